//! Fault-injecting implementations of the job's seams.
//!
//! Each wrapper delegates to a real implementation and misbehaves exactly where it
//! is told to, so recovery paths can be driven deterministically.

use crate::error::EntropyError;
use crate::generator::{EntropySource, OsEntropy};
use crate::hash::{Blake3Hash, HashFunction};
use crate::spill::{SegmentId, SegmentKind, SpillStore};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Panics once, on the digest call after the first `after` calls, then behaves.
///
/// Reports the name of the wrapped hash, so datasets it produces verify normally.
pub struct CrashOnceHash {
    inner: Arc<dyn HashFunction>,
    after: u64,
    calls: AtomicU64,
    fired: AtomicBool,
}

impl CrashOnceHash {
    /// Wrap BLAKE3.
    #[must_use]
    pub fn after(after: u64) -> Self {
        Self::wrap(Arc::new(Blake3Hash), after)
    }

    #[must_use]
    pub fn wrap(inner: Arc<dyn HashFunction>, after: u64) -> Self {
        Self {
            inner,
            after,
            calls: AtomicU64::new(0),
            fired: AtomicBool::new(false),
        }
    }

    /// Whether the crash has happened.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl HashFunction for CrashOnceHash {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn digest_into(&self, nonce: &[u8], out: &mut [u8]) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.after && !self.fired.swap(true, Ordering::SeqCst) {
            panic!("injected worker crash after {call} digests");
        }
        self.inner.digest_into(nonce, out);
    }
}

/// Blocks the calling worker once for `stall`, on the digest call after the first
/// `after` calls.
pub struct StallOnceHash {
    inner: Arc<dyn HashFunction>,
    after: u64,
    stall: Duration,
    calls: AtomicU64,
    fired: AtomicBool,
}

impl StallOnceHash {
    #[must_use]
    pub fn after(after: u64, stall: Duration) -> Self {
        Self {
            inner: Arc::new(Blake3Hash),
            after,
            stall,
            calls: AtomicU64::new(0),
            fired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl HashFunction for StallOnceHash {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn digest_into(&self, nonce: &[u8], out: &mut [u8]) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.after && !self.fired.swap(true, Ordering::SeqCst) {
            thread::sleep(self.stall);
        }
        self.inner.digest_into(nonce, out);
    }
}

/// Where a [`FailingSpillStore`] injects its errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    /// Creating a sorted run or an intermediate merge output.
    RunWrite,
    /// Opening a run for merging.
    RunRead,
    /// Appending to a partition stage during generation.
    StageAppend,
}

/// A [`SpillStore`] that fails with an I/O error at one [`FaultPoint`].
///
/// Faults can be limited to one partition and to a number of occurrences; after
/// that every call is passed through.
pub struct FailingSpillStore {
    inner: Arc<dyn SpillStore>,
    point: FaultPoint,
    partition: Option<u32>,
    remaining: AtomicU64,
    injected: AtomicU64,
}

impl FailingSpillStore {
    /// Fail every call at `point`, for all partitions.
    #[must_use]
    pub fn new(inner: Arc<dyn SpillStore>, point: FaultPoint) -> Self {
        Self {
            inner,
            point,
            partition: None,
            remaining: AtomicU64::new(u64::MAX),
            injected: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn for_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Stop failing after `n` injected errors.
    #[must_use]
    pub fn times(self, n: u64) -> Self {
        self.remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Errors injected so far.
    #[must_use]
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, point: FaultPoint, id: &SegmentId) -> io::Result<()> {
        if point != self.point || self.partition.is_some_and(|p| p != id.partition) {
            return Ok(());
        }
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !armed {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::other(format!(
            "injected {point:?} failure for partition {}",
            id.partition
        )))
    }
}

impl SpillStore for FailingSpillStore {
    fn create(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>> {
        if matches!(id.kind, SegmentKind::Run { .. }) {
            self.check(FaultPoint::RunWrite, id)?;
        }
        self.inner.create(id)
    }

    fn append(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>> {
        if id.kind == SegmentKind::Stage {
            self.check(FaultPoint::StageAppend, id)?;
        }
        self.inner.append(id)
    }

    fn open(&self, id: &SegmentId) -> io::Result<Box<dyn Read + Send>> {
        if matches!(id.kind, SegmentKind::Run { .. }) {
            self.check(FaultPoint::RunRead, id)?;
        }
        self.inner.open(id)
    }

    fn remove(&self, id: &SegmentId) -> io::Result<()> {
        self.inner.remove(id)
    }

    fn discard_attempt(&self, partition: u32, attempt: u32) -> io::Result<()> {
        self.inner.discard_attempt(partition, attempt)
    }
}

/// An entropy source that stops producing seeds.
#[derive(Debug)]
pub struct UnavailableEntropy {
    allowed: u64,
    seeds: AtomicU64,
}

impl UnavailableEntropy {
    /// Never produces a seed.
    #[must_use]
    pub fn new() -> Self {
        Self::after(0)
    }

    /// Produces `allowed` OS seeds, then fails.
    #[must_use]
    pub fn after(allowed: u64) -> Self {
        Self {
            allowed,
            seeds: AtomicU64::new(0),
        }
    }
}

impl Default for UnavailableEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for UnavailableEntropy {
    fn seed(&self) -> Result<[u8; 32], EntropyError> {
        if self.seeds.fetch_add(1, Ordering::SeqCst) < self.allowed {
            OsEntropy.seed()
        } else {
            Err(EntropyError::new("entropy source disabled"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spill::FsSpillStore;
    use std::panic;
    use tempfile::tempdir;

    #[test]
    fn crash_fires_exactly_once() {
        let hash = CrashOnceHash::after(2);
        let mut out = [0u8; 4];
        hash.digest_into(b"a", &mut out);
        hash.digest_into(b"b", &mut out);
        let crashed = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            hash.digest_into(b"c", &mut out);
        }));
        assert!(crashed.is_err());
        assert!(hash.fired());
        hash.digest_into(b"c", &mut out);
        assert_eq!(out.to_vec(), Blake3Hash.digest(b"c", 4));
        assert_eq!(hash.name(), "blake3");
    }

    #[test]
    fn spill_faults_respect_partition_and_budget() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let inner = Arc::new(FsSpillStore::new(dir.path())?);
        let store = FailingSpillStore::new(inner, FaultPoint::RunWrite)
            .for_partition(1)
            .times(2);
        assert!(store.create(&SegmentId::run(0, 1, 0, 0)).is_ok());
        assert!(store.create(&SegmentId::stage(1)).is_ok());
        assert!(store.create(&SegmentId::run(1, 1, 0, 0)).is_err());
        assert!(store.create(&SegmentId::run(1, 2, 0, 0)).is_err());
        assert!(store.create(&SegmentId::run(1, 3, 0, 0)).is_ok());
        assert_eq!(store.injected(), 2);
        Ok(())
    }

    #[test]
    fn entropy_runs_out() {
        let entropy = UnavailableEntropy::after(1);
        assert!(entropy.seed().is_ok());
        assert!(entropy.seed().is_err());
        assert!(UnavailableEntropy::new().seed().is_err());
    }
}
