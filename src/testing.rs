//! Testing utilities for vault jobs.
//!
//! - **Faults**: drop-in [`HashFunction`](crate::HashFunction), [`SpillStore`](crate::SpillStore)
//!   and [`EntropySource`](crate::EntropySource) implementations that crash, stall or fail
//!   on demand, for exercising recovery.
//! - **Assertions**: checks over written vaults and raw record buffers.
//! - [`test_config`]: a configuration sized for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use hashvault::Job;
//! use hashvault::testing::*;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let job = Job::new(test_config(1 << 12, 4, dir.path()))
//!     .with_hash(Arc::new(CrashOnceHash::after(100)));
//! job.run()?;
//!
//! let dataset = assert_vault_complete(dir.path());
//! assert_eq!(dataset.total_records(), 1 << 12);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod faults;

pub use assertions::*;
pub use faults::*;

use crate::config::JobConfig;
use crate::retry::RetryConfig;
use std::path::Path;
use std::time::Duration;

/// A small, fast configuration: two workers, small units and batches, immediate
/// retries and no metrics file.
#[must_use]
pub fn test_config(total_records: u64, num_partitions: u32, output_dir: &Path) -> JobConfig {
    JobConfig::new(total_records, num_partitions, output_dir)
        .with_workers(2)
        .with_unit_records(256)
        .with_batch_records(64)
        .with_channel_capacity(16)
        .with_stage_buffer_bytes(64 << 10)
        .with_unit_timeout(Duration::from_secs(10))
        .with_retry(RetryConfig::immediate(3))
        .with_metrics(false)
}
