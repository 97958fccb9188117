//! Record generation from independent work units.
//!
//! Each attempt at a [`WorkUnit`] draws a fresh 32-byte seed from an
//! [`EntropySource`] and drives its own ChaCha-based [`StdRng`], so no two workers
//! (and no two attempts of the same unit) ever share a random stream. Records are
//! produced lazily in batches; a generator never holds more than one batch.
//!
//! No uniqueness is enforced: two nonces may collide, and so may two digests.

use crate::error::EntropyError;
use crate::hash::HashFunction;
use crate::record::{RecordBatch, RecordLayout};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::sync::Arc;

/// Records per batch when a generator is driven as an iterator.
pub const DEFAULT_BATCH_RECORDS: usize = 4096;

/// Supplier of seed material for worker-local random number generators.
pub trait EntropySource: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if no secure seed can be produced.
    fn seed(&self) -> Result<[u8; 32], EntropyError>;
}

/// Seeds drawn from the operating system's secure random source.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn seed(&self) -> Result<[u8; 32], EntropyError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| EntropyError::new(e.to_string()))?;
        Ok(seed)
    }
}

/// An idempotent request for `requested` records.
///
/// Re-running a unit with a fresh seed is always a valid retry: the count stays the
/// same and only the nonces differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub id: usize,
    pub requested: u64,
}

impl WorkUnit {
    /// Start an attempt at this unit, seeding a private RNG from `entropy`.
    ///
    /// # Errors
    ///
    /// Returns an error if `entropy` cannot produce a seed.
    pub fn open(
        &self,
        layout: RecordLayout,
        hash: Arc<dyn HashFunction>,
        entropy: &dyn EntropySource,
    ) -> Result<RecordGenerator, EntropyError> {
        let seed = entropy.seed()?;
        Ok(RecordGenerator::new(layout, hash, seed, self.requested))
    }
}

/// Split `total` records into units of at most `unit_records`.
///
/// Counts differ by at most one and always sum to `total`; the first
/// `total % units` units carry the extra record.
#[must_use]
pub fn plan_work_units(total: u64, unit_records: u64) -> Vec<WorkUnit> {
    if total == 0 {
        return Vec::new();
    }
    let units = total.div_ceil(unit_records.max(1));
    let base = total / units;
    let extra = total % units;
    (0..units)
        .map(|i| WorkUnit {
            id: usize::try_from(i).unwrap_or(usize::MAX),
            requested: base + u64::from(i < extra),
        })
        .collect()
}

/// Unit size heuristic: roughly a hundred units per worker, never below 1000 records
/// and never above 1 Mi records.
#[must_use]
pub fn default_unit_records(total: u64, workers: usize) -> u64 {
    let workers = u64::try_from(workers.max(1)).unwrap_or(u64::MAX);
    (total / workers.saturating_mul(100)).clamp(1000, 1 << 20)
}

/// Lazy producer of exactly `requested` records.
pub struct RecordGenerator {
    layout: RecordLayout,
    hash: Arc<dyn HashFunction>,
    rng: StdRng,
    remaining: u64,
    batch_records: usize,
}

impl RecordGenerator {
    #[must_use]
    pub fn new(
        layout: RecordLayout,
        hash: Arc<dyn HashFunction>,
        seed: [u8; 32],
        requested: u64,
    ) -> Self {
        Self {
            layout,
            hash,
            rng: StdRng::from_seed(seed),
            remaining: requested,
            batch_records: DEFAULT_BATCH_RECORDS,
        }
    }

    /// Set the batch size used by the [`Iterator`] implementation.
    #[must_use]
    pub fn with_batch_records(mut self, batch_records: usize) -> Self {
        self.batch_records = batch_records.max(1);
        self
    }

    /// Records still to be produced.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Produce up to `max_records` more records, or `None` once the unit is exhausted.
    pub fn next_batch(&mut self, max_records: usize) -> Option<RecordBatch> {
        if self.remaining == 0 {
            return None;
        }
        let max = u64::try_from(max_records.max(1)).unwrap_or(u64::MAX);
        let n = usize::try_from(self.remaining.min(max)).unwrap_or(usize::MAX);
        let digest_len = self.layout.digest_len;
        let mut batch = RecordBatch::with_capacity(self.layout, n);
        for _ in 0..n {
            let record = batch.push_uninit();
            let (digest, nonce) = record.split_at_mut(digest_len);
            self.rng.fill_bytes(nonce);
            self.hash.digest_into(nonce, digest);
        }
        self.remaining -= n as u64;
        Some(batch)
    }
}

impl Iterator for RecordGenerator {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch(self.batch_records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3Hash;

    #[test]
    fn plan_distributes_remainder_and_conserves_total() {
        let units = plan_work_units(10, 4);
        let counts: Vec<u64> = units.iter().map(|u| u.requested).collect();
        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(units.iter().map(|u| u.id).collect::<Vec<_>>(), vec![0, 1, 2]);

        for (total, size) in [(1, 1), (16, 3), (1 << 20, 1000), (7, 100)] {
            let units = plan_work_units(total, size);
            assert_eq!(units.iter().map(|u| u.requested).sum::<u64>(), total);
            assert!(units.iter().all(|u| u.requested <= size && u.requested > 0));
        }
        assert!(plan_work_units(0, 10).is_empty());
    }

    #[test]
    fn default_unit_size_is_clamped() {
        assert_eq!(default_unit_records(16, 8), 1000);
        assert_eq!(default_unit_records(1 << 40, 1), 1 << 20);
        assert_eq!(default_unit_records(8_000_000, 4), 20_000);
    }

    #[test]
    fn generator_yields_exactly_the_requested_count() {
        let layout = RecordLayout::default();
        let generator = RecordGenerator::new(layout, Arc::new(Blake3Hash), [7; 32], 10_001)
            .with_batch_records(1000);
        let batches: Vec<RecordBatch> = generator.collect();
        assert_eq!(batches.len(), 11);
        assert!(batches.iter().all(|b| b.len() <= 1000));
        assert_eq!(batches.iter().map(RecordBatch::len).sum::<usize>(), 10_001);
    }

    #[test]
    fn digests_are_truncated_hashes_of_the_nonce() {
        let layout = RecordLayout::default();
        let mut generator = RecordGenerator::new(layout, Arc::new(Blake3Hash), [1; 32], 64);
        let batch = generator.next_batch(64).unwrap();
        for record in &batch {
            let full = blake3::hash(layout.nonce(record));
            assert_eq!(layout.digest(record), &full.as_bytes()[..layout.digest_len]);
        }
        assert_eq!(generator.remaining(), 0);
        assert!(generator.next_batch(64).is_none());
    }

    #[test]
    fn os_entropy_seeds_differ() {
        let a = OsEntropy.seed().unwrap();
        let b = OsEntropy.seed().unwrap();
        assert_ne!(a, b);
    }
}
