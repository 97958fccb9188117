//! Job configuration.
//!
//! A [`JobConfig`] is a plain struct with public fields and defaults suitable for a
//! single machine; the `with_*` setters allow chained construction:
//!
//! ```no_run
//! use hashvault::JobConfig;
//! use std::time::Duration;
//!
//! let config = JobConfig::from_exponent(24, 16, "./vault")
//!     .with_workers(8)
//!     .with_sort_memory_bytes(64 << 20)
//!     .with_unit_timeout(Duration::from_secs(10));
//! assert_eq!(config.total_records, 1 << 24);
//! ```

use crate::error::ConfigError;
use crate::generator::{DEFAULT_BATCH_RECORDS, default_unit_records};
use crate::record::RecordLayout;
use crate::retry::RetryConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the scratch directory created under the output directory by default.
pub const DEFAULT_SCRATCH_DIR: &str = "_scratch";

/// Everything a [`Job`](crate::Job) needs to know before it starts.
#[derive(Clone, Debug)]
pub struct JobConfig {
    /// Records to generate and write.
    pub total_records: u64,
    /// Number of digest ranges, and therefore shards.
    pub num_partitions: u32,
    /// Directory receiving shards, the manifest and the completion marker.
    pub output_dir: PathBuf,
    pub layout: RecordLayout,
    /// Generation and sort parallelism. `None` uses every CPU.
    pub workers: Option<usize>,
    /// Records per work unit. `None` derives it from the total and worker count.
    pub unit_records: Option<u64>,
    /// Records per batch sent from a worker to the coordinator.
    pub batch_records: usize,
    /// Bound on in-flight batches between workers and the coordinator.
    pub channel_capacity: usize,
    /// In-memory staging per partition before input spills to disk.
    pub stage_buffer_bytes: usize,
    /// Memory a single partition sort may use, sort keys included, before it goes
    /// external.
    pub sort_memory_bytes: usize,
    /// Maximum runs merged at once.
    pub merge_fan_in: usize,
    /// Where stage and run segments live. `None` means `<output_dir>/_scratch`.
    pub scratch_dir: Option<PathBuf>,
    /// A claimed unit with no progress for this long is reassigned.
    pub unit_timeout: Duration,
    pub retry: RetryConfig,
    /// Partitions further than this many standard deviations from the mean are reported.
    pub imbalance_sigmas: f64,
    /// Write `metrics.json` next to the manifest.
    pub write_metrics: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            total_records: 1 << 20,
            num_partitions: u32::try_from(cpus * 2).unwrap_or(u32::MAX),
            output_dir: PathBuf::from("./hashvault_out"),
            layout: RecordLayout::default(),
            workers: None,
            unit_records: None,
            batch_records: DEFAULT_BATCH_RECORDS,
            channel_capacity: 64,
            stage_buffer_bytes: 8 << 20,
            sort_memory_bytes: 256 << 20,
            merge_fan_in: 64,
            scratch_dir: None,
            unit_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            imbalance_sigmas: 6.0,
            write_metrics: cfg!(feature = "metrics"),
        }
    }
}

impl JobConfig {
    #[must_use]
    pub fn new(total_records: u64, num_partitions: u32, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            total_records,
            num_partitions,
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Configure a job for `2^k` records.
    ///
    /// Exponents above 63 saturate to `u64::MAX` and are rejected by [`validate`](Self::validate).
    #[must_use]
    pub fn from_exponent(k: u32, num_partitions: u32, output_dir: impl Into<PathBuf>) -> Self {
        let total = 1u64.checked_shl(k).unwrap_or(u64::MAX);
        Self::new(total, num_partitions, output_dir)
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub const fn with_unit_records(mut self, unit_records: u64) -> Self {
        self.unit_records = Some(unit_records);
        self
    }

    #[must_use]
    pub const fn with_batch_records(mut self, batch_records: usize) -> Self {
        self.batch_records = batch_records;
        self
    }

    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_stage_buffer_bytes(mut self, bytes: usize) -> Self {
        self.stage_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_sort_memory_bytes(mut self, bytes: usize) -> Self {
        self.sort_memory_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_merge_fan_in(mut self, fan_in: usize) -> Self {
        self.merge_fan_in = fan_in;
        self
    }

    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_imbalance_sigmas(mut self, sigmas: f64) -> Self {
        self.imbalance_sigmas = sigmas;
        self
    }

    #[must_use]
    pub const fn with_metrics(mut self, enabled: bool) -> Self {
        self.write_metrics = enabled;
        self
    }

    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    #[must_use]
    pub fn effective_unit_records(&self) -> u64 {
        self.unit_records
            .unwrap_or_else(|| default_unit_records(self.total_records, self.effective_workers()))
            .max(1)
    }

    #[must_use]
    pub fn effective_scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(DEFAULT_SCRATCH_DIR))
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// # Errors
    ///
    /// Returns the first setting that makes the job impossible to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        let fail = |msg: &str| Err(ConfigError(msg.to_string()));
        if self.total_records == 0 {
            return fail("total_records must be at least 1");
        }
        if self.total_records == u64::MAX {
            return fail("total_records exponent too large");
        }
        if self.num_partitions == 0 {
            return fail("num_partitions must be at least 1");
        }
        let digest_bits = 8 * self.layout.digest_len;
        if digest_bits < 32 && u64::from(self.num_partitions) > 1 << digest_bits {
            return fail("num_partitions exceeds the number of distinct digests");
        }
        if self.batch_records == 0 {
            return fail("batch_records must be at least 1");
        }
        if self.channel_capacity == 0 {
            return fail("channel_capacity must be at least 1");
        }
        if self.merge_fan_in < 2 {
            return fail("merge_fan_in must be at least 2");
        }
        if self.sort_memory_bytes < crate::sort::record_footprint(self.layout) {
            return fail("sort_memory_bytes must hold at least one record");
        }
        if self.workers == Some(0) {
            return fail("workers must be at least 1");
        }
        if self.unit_records == Some(0) {
            return fail("unit_records must be at least 1");
        }
        if self.unit_timeout.is_zero() {
            return fail("unit_timeout must be positive");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.imbalance_sigmas.is_nan() || self.imbalance_sigmas <= 0.0 {
            return fail("imbalance_sigmas must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_exponent_sets_power_of_two_total() {
        let config = JobConfig::from_exponent(4, 2, "/tmp/x");
        assert_eq!(config.total_records, 16);
        assert_eq!(config.num_partitions, 2);
        assert!(config.validate().is_ok());
        assert!(JobConfig::from_exponent(64, 2, "/tmp/x").validate().is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let config = JobConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout.record_len(), 16);
        assert_eq!(config.sort_memory_bytes, 256 << 20);
        assert!(config.effective_workers() >= 1);
        assert_eq!(
            config.effective_scratch_dir(),
            PathBuf::from("./hashvault_out").join("_scratch")
        );
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        let base = JobConfig::new(100, 4, "/tmp/x");
        assert!(JobConfig { total_records: 0, ..base.clone() }.validate().is_err());
        assert!(JobConfig { num_partitions: 0, ..base.clone() }.validate().is_err());
        assert!(base.clone().with_merge_fan_in(1).validate().is_err());
        assert!(base.clone().with_workers(0).validate().is_err());
        assert!(base.clone().with_sort_memory_bytes(8).validate().is_err());
        assert!(base.clone().with_unit_timeout(Duration::ZERO).validate().is_err());
        let one_byte = base.with_layout(RecordLayout::new(1, 2));
        assert!(JobConfig { num_partitions: 256, ..one_byte.clone() }.validate().is_ok());
        assert!(JobConfig { num_partitions: 257, ..one_byte }.validate().is_err());
    }

    #[test]
    fn unit_size_follows_worker_count_unless_set() {
        let config = JobConfig::new(8_000_000, 4, "/tmp/x").with_workers(4);
        assert_eq!(config.effective_unit_records(), 20_000);
        assert_eq!(config.with_unit_records(3).effective_unit_records(), 3);
    }
}
