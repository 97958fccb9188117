//! Assertions over written vaults and raw record buffers.
//!
//! All of these panic with a descriptive message, so they read naturally inside
//! `#[test]` functions.

use crate::dataset::Dataset;
use crate::hash::HashFunction;
use crate::manifest::marker_present;
use crate::partitioner::PartitionRange;
use crate::record::{RecordBatch, RecordLayout, format_record};
use std::path::Path;

/// Assert that `records` is in non-decreasing byte order.
///
/// # Panics
///
/// Panics at the first pair of records out of order.
#[track_caller]
pub fn assert_records_sorted(layout: RecordLayout, records: &[u8]) {
    let width = layout.record_len();
    for (i, pair) in records.windows(2 * width).step_by(width).enumerate() {
        let (a, b) = pair.split_at(width);
        assert!(
            a <= b,
            "records out of order at index {}:\n  {}\n  {}",
            i + 1,
            format_record(layout, a),
            format_record(layout, b)
        );
    }
}

/// Assert that every digest equals the truncated hash of its nonce.
///
/// # Panics
///
/// Panics at the first record whose digest does not match.
#[track_caller]
pub fn assert_digests_match(hash: &dyn HashFunction, layout: RecordLayout, records: &[u8]) {
    for (i, record) in records.chunks_exact(layout.record_len()).enumerate() {
        let expected = hash.digest(layout.nonce(record), layout.digest_len);
        assert_eq!(
            layout.digest(record),
            expected.as_slice(),
            "record {i} has a wrong digest: {}",
            format_record(layout, record)
        );
    }
}

/// Assert that every record's digest lies in `range`.
///
/// # Panics
///
/// Panics at the first record outside the range.
#[track_caller]
pub fn assert_in_range(range: &PartitionRange, layout: RecordLayout, records: &[u8]) {
    for (i, record) in records.chunks_exact(layout.record_len()).enumerate() {
        assert!(
            range.contains(layout.digest(record)),
            "record {i} ({}) outside partition {} [{}, {})",
            format_record(layout, record),
            range.index,
            range.lo.to_hex(),
            range.hi.to_hex()
        );
    }
}

/// Open the vault in `dir`, run a full verification and assert it is clean.
///
/// # Panics
///
/// Panics if the vault cannot be opened, read or fails any check.
#[track_caller]
pub fn assert_vault_complete(dir: &Path) -> Dataset {
    let dataset = match Dataset::open(dir) {
        Ok(dataset) => dataset,
        Err(e) => panic!("vault in {} is not usable: {e}", dir.display()),
    };
    let report = match dataset.verify() {
        Ok(report) => report,
        Err(e) => panic!("vault in {} could not be read: {e:#}", dir.display()),
    };
    assert!(report.is_ok(), "vault in {} failed verification: {report:#?}", dir.display());
    dataset
}

/// Assert that `dir` does not hold a usable vault.
///
/// # Panics
///
/// Panics if a completion marker exists or the vault opens.
#[track_caller]
pub fn assert_vault_incomplete(dir: &Path) {
    assert!(
        !marker_present(dir),
        "{} carries a completion marker",
        dir.display()
    );
    assert!(
        Dataset::open(dir).is_err(),
        "{} opened as a complete vault",
        dir.display()
    );
}

/// Every record of a vault, partitions concatenated in index order.
///
/// # Panics
///
/// Panics if a shard cannot be read.
#[must_use]
#[track_caller]
pub fn concat_shards(dataset: &Dataset) -> RecordBatch {
    let mut all = RecordBatch::new(dataset.layout());
    for partition in 0..dataset.num_partitions() {
        match dataset.read_partition(partition) {
            Ok(batch) => batch.iter().for_each(|record| all.push(record)),
            Err(e) => panic!("reading partition {partition}: {e:#}"),
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3Hash;
    use crate::partitioner::RangePartitioner;

    #[test]
    fn sorted_records_pass() {
        assert_records_sorted(RecordLayout::new(1, 1), &[1, 0, 1, 0, 2, 9]);
        assert_records_sorted(RecordLayout::new(1, 1), &[]);
    }

    #[test]
    #[should_panic(expected = "out of order at index 2")]
    fn unsorted_records_panic() {
        assert_records_sorted(RecordLayout::new(1, 1), &[1, 0, 3, 0, 2, 0]);
    }

    #[test]
    #[should_panic(expected = "wrong digest")]
    fn wrong_digest_panics() {
        let layout = RecordLayout::new(2, 1);
        let mut record = Blake3Hash.digest(&[7], 2);
        record.push(8);
        assert_digests_match(&Blake3Hash, layout, &record);
    }

    #[test]
    fn range_check_uses_partition_bounds() {
        let layout = RecordLayout::new(1, 1);
        let range = RangePartitioner::new(1, 2).unwrap().range(1);
        assert_in_range(&range, layout, &[0x80, 0, 0xff, 0]);
    }
}
