//! Error taxonomy for generation, sorting, output and dataset loading.
//!
//! Every terminal failure of a [`Job`](crate::Job) surfaces as a [`JobError`] whose
//! [`stage`](JobError::stage) tells the caller which part of the run broke. Recoverable
//! worker failures are reported as [`WorkerFailure`] and only escalate once the retry
//! budget is spent.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The OS entropy source could not provide seed material.
#[derive(Debug, Clone, Error)]
#[error("entropy source unavailable: {reason}")]
pub struct EntropyError {
    pub reason: String,
}

impl EntropyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A job was configured with values it cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Why a single generation attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerFailure {
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("worker made no progress for {0:?}")]
    TimedOut(Duration),
    #[error("worker failed: {0}")]
    Failed(String),
}

/// Failure of one partition's sort attempt.
#[derive(Debug, Error)]
pub enum SortError {
    /// Appending unsorted input to, or reading it back from, the partition stage.
    #[error("stage spill failed: {0}")]
    Stage(#[source] io::Error),
    /// Writing a sorted run segment.
    #[error("spill of run {run} failed: {source}")]
    Spill {
        run: usize,
        #[source]
        source: io::Error,
    },
    /// Reading run segments back or writing an intermediate merge pass.
    #[error("merge failed: {0}")]
    Merge(#[source] io::Error),
    /// Writing the sorted output into the partition shard.
    #[error("shard output failed: {0}")]
    Output(#[source] io::Error),
    #[error("sort cancelled")]
    Cancelled,
}

impl SortError {
    /// Cancellation is final; every I/O failure gets a fresh attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Consumer-side reasons a dataset must be treated as unusable.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest missing at {}", .0.display())]
    Missing(PathBuf),
    #[error("dataset incomplete: {0}")]
    Incomplete(String),
    #[error("manifest corrupt: {0}")]
    Corrupt(String),
    #[error("manifest checksum mismatch")]
    ChecksumMismatch,
    #[error("dataset shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The pipeline stage a [`JobError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Config,
    Entropy,
    Generation,
    Sort,
    Write,
    Manifest,
    Cancelled,
}

impl Stage {
    /// Distinct process exit status per stage, for binaries embedding a [`Job`](crate::Job).
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Generation => 3,
            Self::Sort => 4,
            Self::Write => 5,
            Self::Entropy => 6,
            Self::Manifest => 7,
            Self::Cancelled => 130,
        }
    }
}

/// Terminal failure of a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Entropy(#[from] EntropyError),
    #[error(
        "generation failed: work unit {unit} gave up after {attempts} attempts: {last_failure}"
    )]
    Generation {
        unit: usize,
        attempts: u32,
        last_failure: WorkerFailure,
    },
    #[error("sort failed for partition {partition}: {source}")]
    Sort {
        partition: u32,
        #[source]
        source: SortError,
    },
    #[error("write failed{}: {source}", fmt_partition(.partition))]
    Write {
        partition: Option<u32>,
        #[source]
        source: io::Error,
    },
    #[error("manifest could not be finalized: {0}")]
    Manifest(#[from] ManifestError),
    #[error("job cancelled")]
    Cancelled,
}

fn fmt_partition(partition: &Option<u32>) -> String {
    partition.map_or_else(String::new, |p| format!(" for partition {p}"))
}

impl JobError {
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Config(_) => Stage::Config,
            Self::Entropy(_) => Stage::Entropy,
            Self::Generation { .. } => Stage::Generation,
            Self::Sort { .. } => Stage::Sort,
            Self::Write { .. } => Stage::Write,
            Self::Manifest(_) => Stage::Manifest,
            Self::Cancelled => Stage::Cancelled,
        }
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.stage().exit_code()
    }

    pub(crate) fn write(partition: Option<u32>, source: io::Error) -> Self {
        Self::Write { partition, source }
    }

    /// Attribute a failed sort attempt to the stage that actually broke.
    pub(crate) fn from_sort(partition: u32, err: SortError) -> Self {
        match err {
            SortError::Output(source) => Self::Write {
                partition: Some(partition),
                source,
            },
            SortError::Cancelled => Self::Cancelled,
            source => Self::Sort { partition, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_output_failures_are_write_stage() {
        let err = JobError::from_sort(3, SortError::Output(io::Error::other("disk full")));
        assert_eq!(err.stage(), Stage::Write);
        assert!(err.to_string().contains("partition 3"));

        let err = JobError::from_sort(1, SortError::Merge(io::Error::other("bad sector")));
        assert_eq!(err.stage(), Stage::Sort);

        let err = JobError::from_sort(1, SortError::Cancelled);
        assert_eq!(err.stage(), Stage::Cancelled);
    }

    #[test]
    fn stages_have_distinct_exit_codes() {
        let stages = [
            Stage::Config,
            Stage::Entropy,
            Stage::Generation,
            Stage::Sort,
            Stage::Write,
            Stage::Manifest,
            Stage::Cancelled,
        ];
        let mut codes: Vec<i32> = stages.iter().map(|s| s.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), stages.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
