//! # Hashvault
//!
//! A **parallel generator of sorted hash vaults**. A vault is `2^k` fixed-width records,
//! each a truncated hash digest followed by the random nonce it was computed from,
//! written as range-partitioned shards whose concatenation is globally sorted by digest.
//!
//! ## Key Features
//!
//! - **Parallel generation** - independent, idempotent work units on a worker pool
//! - **Analytic partitioning** - digest ranges computed exactly, no sampling pass
//! - **Bounded-memory sorting** - in-memory sort or external sort with k-way merge
//! - **Fault tolerance** - crashed, failed or stalled units are reassigned; sort attempts retry
//! - **Atomic output** - shards and manifest are committed with temp-file renames, and a
//!   `_SUCCESS` marker is written last
//! - **Consumer side** - open, verify and prefix-search finished vaults
//!
//! ## Quick Start
//!
//! ```no_run
//! use hashvault::{Dataset, Job, JobConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! // 2^20 records in 8 shards.
//! let report = Job::new(JobConfig::from_exponent(20, 8, "./vault")).run()?;
//! println!("{} records in {:?}", report.records_generated, report.elapsed);
//!
//! let vault = Dataset::open("./vault")?;
//! assert!(vault.verify()?.is_ok());
//! let hits = vault.search(&[0xab, 0xcd])?;
//! println!("{} records start with abcd", hits.matches.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A record is `digest || nonce` with the widths given by a [`RecordLayout`] (10 and 6
//! bytes by default). Byte-wise comparison orders records by digest, nonce breaking ties.
//!
//! ### Partitions
//!
//! The [`RangePartitioner`] splits the digest space into contiguous, equally sized
//! ranges. Each range becomes one shard, `part-NNNNN.bin`.
//!
//! ### Jobs
//!
//! A [`Job`] runs generation, per-partition sorting and output. It is configured with a
//! [`JobConfig`] and can be given a different [`HashFunction`], [`EntropySource`] or
//! [`SpillStore`]; the [`testing`] module uses those seams to inject faults.
//!
//! ### Output
//!
//! The output directory holds the shards, `manifest.json` (boundaries, counts,
//! checksums, status) and `_SUCCESS`. Without the marker the directory is not a vault.
//!
//! ## Logging
//!
//! Progress and recoveries are reported through [`tracing`]; install any subscriber to
//! see them.

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod error;
pub mod generator;
pub mod hash;
pub mod manifest;
pub mod output;
pub mod partitioner;
pub mod queue;
pub mod record;
pub mod retry;
pub mod sort;
pub mod spill;
pub mod testing;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use cancel::CancelToken;
pub use config::JobConfig;
pub use coordinator::{Job, JobReport};
pub use dataset::{Dataset, PartitionReport, SearchResult, VerifyReport};
pub use error::{
    ConfigError, EntropyError, JobError, ManifestError, SortError, Stage, WorkerFailure,
};
pub use generator::{EntropySource, OsEntropy, RecordGenerator, WorkUnit, plan_work_units};
pub use hash::{Blake3Hash, HashFunction, Sha256Hash, hash_by_name};
pub use manifest::{Manifest, ManifestEntry, ManifestStatus};
pub use partitioner::{
    DigestBound, PartitionImbalance, PartitionRange, RangePartitioner, check_balance,
    partition_index,
};
pub use record::{RecordBatch, RecordLayout, format_record};
pub use retry::RetryConfig;
pub use sort::{SortOutcome, SortSettings, record_footprint, sort_partition, sort_records};
pub use spill::{FsSpillStore, PartitionStage, SegmentId, SpillStore};

#[cfg(feature = "metrics")]
pub use metrics::MetricsCollector;
