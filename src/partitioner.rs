//! Analytic range partitioning of the digest space.
//!
//! A digest of `D` bytes is read as a big-endian integer `d` in `[0, 2^(8D))` and
//! assigned to partition `floor(d * P / 2^(8D))`. Because digests are uniformly
//! distributed, this gives equal expected partition sizes without a sampling pass.
//!
//! Boundaries come from the same formula: `lo_i = ceil(i * 2^(8D) / P)`, so
//! `partition_index(d) == i` exactly when `lo_i <= d < lo_{i+1}`. All arithmetic is
//! byte-wise long multiplication/division, which is exact for any digest width.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::warn;

/// Map a digest to its partition.
///
/// `num_partitions` must be non-zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn partition_index(digest: &[u8], num_partitions: u32) -> u32 {
    let p = u64::from(num_partitions);
    // Multiply from the least significant byte; what carries out of the top byte is
    // floor(d * P / 2^(8D)). Every intermediate stays below 2^40.
    let mut carry = 0u64;
    for &b in digest.iter().rev() {
        carry = (u64::from(b) * p + carry) >> 8;
    }
    carry as u32
}

/// Smallest digest value that maps to `index`, as a `digest_len + 1` byte integer.
#[allow(clippy::cast_possible_truncation)]
fn lower_bound(index: u32, num_partitions: u32, digest_len: usize) -> DigestBound {
    let p = u64::from(num_partitions);
    let mut numerator = index.to_be_bytes().to_vec();
    numerator.resize(4 + digest_len, 0);

    let mut quotient = Vec::with_capacity(numerator.len());
    let mut rem = 0u64;
    for &b in &numerator {
        let cur = (rem << 8) | u64::from(b);
        quotient.push((cur / p) as u8);
        rem = cur % p;
    }
    if rem != 0 {
        for byte in quotient.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
    // The value never exceeds 2^(8D), so the leading bytes are zero.
    DigestBound(quotient.split_off(quotient.len() - (digest_len + 1)))
}

/// A point in the digest space, big-endian over `digest_len + 1` bytes.
///
/// The extra leading byte lets the last partition's upper bound, `2^(8D)`, be
/// represented. Serialized as lowercase hex.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DigestBound(Vec<u8>);

impl DigestBound {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width of the digests this bound applies to.
    #[must_use]
    pub fn digest_len(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Compare this bound with a digest of width [`digest_len`](Self::digest_len).
    #[must_use]
    pub fn cmp_digest(&self, digest: &[u8]) -> Ordering {
        match self.0.split_first() {
            Some((&0, rest)) => rest.cmp(digest),
            Some(_) => Ordering::Greater,
            None => Ordering::Less,
        }
    }
}

impl fmt::Debug for DigestBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DigestBound({})", self.to_hex())
    }
}

impl From<DigestBound> for String {
    fn from(bound: DigestBound) -> Self {
        bound.to_hex()
    }
}

impl TryFrom<String> for DigestBound {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        hex::decode(value).map(DigestBound)
    }
}

/// The half-open digest range `[lo, hi)` owned by one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub index: u32,
    pub lo: DigestBound,
    pub hi: DigestBound,
}

impl PartitionRange {
    #[must_use]
    pub fn contains(&self, digest: &[u8]) -> bool {
        self.lo.cmp_digest(digest) != Ordering::Greater
            && self.hi.cmp_digest(digest) == Ordering::Greater
    }
}

/// Stateless digest → partition mapping for a fixed digest width and partition count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangePartitioner {
    digest_len: usize,
    num_partitions: u32,
}

impl RangePartitioner {
    /// # Errors
    ///
    /// Returns an error if `num_partitions` is zero or `digest_len` is zero.
    pub fn new(digest_len: usize, num_partitions: u32) -> Result<Self, ConfigError> {
        if num_partitions == 0 {
            return Err(ConfigError("num_partitions must be at least 1".into()));
        }
        if digest_len == 0 {
            return Err(ConfigError("digest length must be at least 1".into()));
        }
        Ok(Self {
            digest_len,
            num_partitions,
        })
    }

    #[must_use]
    pub const fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    #[must_use]
    pub const fn digest_len(&self) -> usize {
        self.digest_len
    }

    #[inline]
    #[must_use]
    pub fn index_of(&self, digest: &[u8]) -> u32 {
        debug_assert_eq!(digest.len(), self.digest_len);
        partition_index(digest, self.num_partitions)
    }

    /// Range of partition `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= num_partitions`.
    #[must_use]
    pub fn range(&self, index: u32) -> PartitionRange {
        assert!(index < self.num_partitions, "partition {index} out of range");
        PartitionRange {
            index,
            lo: lower_bound(index, self.num_partitions, self.digest_len),
            hi: lower_bound(index + 1, self.num_partitions, self.digest_len),
        }
    }

    pub fn ranges(&self) -> impl Iterator<Item = PartitionRange> + '_ {
        (0..self.num_partitions).map(|i| self.range(i))
    }
}

/// A partition whose size is far outside what a uniform digest predicts.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionImbalance {
    pub partition: u32,
    pub records: u64,
    pub expected: f64,
    pub deviation_sigmas: f64,
}

/// Flag partitions that deviate from `total / P` by more than `sigmas` binomial
/// standard deviations. Each finding is logged; none is fatal.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn check_balance(counts: &[u64], sigmas: f64) -> Vec<PartitionImbalance> {
    let total: u64 = counts.iter().sum();
    if counts.len() < 2 || total == 0 {
        return Vec::new();
    }
    let p = 1.0 / counts.len() as f64;
    let expected = total as f64 * p;
    let sd = (total as f64 * p * (1.0 - p)).sqrt();
    // Boundaries differ in width by at most one digest value; one record of slack covers it.
    let allowed = sigmas.mul_add(sd, 1.0);

    counts
        .iter()
        .enumerate()
        .filter_map(|(i, &records)| {
            let deviation = (records as f64 - expected).abs();
            if deviation <= allowed {
                return None;
            }
            let imbalance = PartitionImbalance {
                partition: u32::try_from(i).unwrap_or(u32::MAX),
                records,
                expected,
                deviation_sigmas: if sd > 0.0 { deviation / sd } else { f64::INFINITY },
            };
            warn!(
                partition = imbalance.partition,
                records,
                expected,
                sigmas = imbalance.deviation_sigmas,
                "partition size far outside the uniform expectation"
            );
            Some(imbalance)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(bytes: &[u8]) -> DigestBound {
        DigestBound(bytes.to_vec())
    }

    #[test]
    fn two_partitions_split_at_the_midpoint() {
        let p = RangePartitioner::new(2, 2).unwrap();
        assert_eq!(p.index_of(&[0x7f, 0xff]), 0);
        assert_eq!(p.index_of(&[0x80, 0x00]), 1);
        assert_eq!(p.index_of(&[0xff, 0xff]), 1);

        let r0 = p.range(0);
        let r1 = p.range(1);
        assert_eq!(r0.lo, bound(&[0, 0, 0]));
        assert_eq!(r0.hi, bound(&[0, 0x80, 0]));
        assert_eq!(r1.lo, r0.hi);
        assert_eq!(r1.hi, bound(&[1, 0, 0]));
    }

    #[test]
    fn uneven_partition_counts_use_ceiling_bounds() {
        // 256 values over 3 partitions: [0, 86), [86, 171), [171, 256)
        let p = RangePartitioner::new(1, 3).unwrap();
        let ranges: Vec<_> = p.ranges().collect();
        assert_eq!(ranges[1].lo, bound(&[0, 86]));
        assert_eq!(ranges[2].lo, bound(&[0, 171]));
        assert_eq!(ranges[2].hi, bound(&[1, 0]));

        for d in 0u8..=255 {
            let idx = p.index_of(&[d]);
            assert!(ranges[idx as usize].contains(&[d]), "digest {d} not in range {idx}");
            for (j, r) in ranges.iter().enumerate() {
                if j != idx as usize {
                    assert!(!r.contains(&[d]));
                }
            }
        }
    }

    #[test]
    fn ranges_are_contiguous_for_wide_digests() {
        for parts in [1u32, 2, 7, 64, 1000] {
            let p = RangePartitioner::new(10, parts).unwrap();
            let ranges: Vec<_> = p.ranges().collect();
            assert_eq!(ranges[0].lo.as_bytes(), &[0u8; 11][..]);
            let mut top = vec![0u8; 11];
            top[0] = 1;
            assert_eq!(ranges.last().unwrap().hi.as_bytes(), top.as_slice());
            for w in ranges.windows(2) {
                assert_eq!(w[0].hi, w[1].lo);
                assert!(w[0].lo < w[0].hi);
            }
        }
    }

    #[test]
    fn index_agrees_with_bounds_at_the_edges() {
        let p = RangePartitioner::new(10, 7).unwrap();
        for range in p.ranges() {
            let lo = &range.lo.as_bytes()[1..];
            assert_eq!(p.index_of(lo), range.index);
            if range.index > 0 {
                // One below lo belongs to the previous partition.
                let mut below = lo.to_vec();
                for b in below.iter_mut().rev() {
                    let (v, borrow) = b.overflowing_sub(1);
                    *b = v;
                    if !borrow {
                        break;
                    }
                }
                assert_eq!(p.index_of(&below), range.index - 1);
            }
        }
        assert_eq!(p.index_of(&[0xff; 10]), 6);
    }

    #[test]
    fn huge_partition_counts_do_not_overflow() {
        let p = RangePartitioner::new(32, u32::MAX).unwrap();
        assert_eq!(p.index_of(&[0xff; 32]), u32::MAX - 1);
        assert_eq!(p.index_of(&[0; 32]), 0);
        let last = p.range(u32::MAX - 1);
        assert_eq!(last.hi.as_bytes()[0], 1);
    }

    #[test]
    fn bound_serializes_as_hex() {
        let b = bound(&[0, 0x80, 0x01]);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "\"008001\"");
        let back: DigestBound = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn balance_check_flags_only_outliers() {
        assert!(check_balance(&[5000, 5100, 4900, 5000], 6.0).is_empty());
        let flagged = check_balance(&[5000, 5000, 9000, 1000], 6.0);
        let parts: Vec<u32> = flagged.iter().map(|f| f.partition).collect();
        assert_eq!(parts, vec![2, 3]);
        assert!(check_balance(&[10], 6.0).is_empty());
        assert!(check_balance(&[0, 0], 6.0).is_empty());
    }

    #[test]
    fn zero_partitions_is_rejected() {
        assert!(RangePartitioner::new(10, 0).is_err());
    }
}
