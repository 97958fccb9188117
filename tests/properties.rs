//! Properties every finished vault must have, across partition counts, hashes and
//! record layouts.

use anyhow::Result;
use hashvault::testing::*;
use hashvault::{
    Dataset, HashFunction, Job, ManifestStatus, RangePartitioner, RecordLayout, Sha256Hash,
    hash_by_name, sort_records,
};
use std::sync::Arc;
use tempfile::tempdir;

fn check_vault(dataset: &Dataset, expected_records: u64) {
    let layout = dataset.layout();
    let manifest = dataset.manifest();
    assert_eq!(manifest.status, ManifestStatus::Complete);
    assert_eq!(manifest.total_record_count, Some(expected_records));
    assert_eq!(dataset.total_records(), expected_records);

    let all = concat_shards(dataset);
    assert_eq!(all.len() as u64, expected_records);
    assert_records_sorted(layout, all.as_bytes());
    let hash = hash_by_name(&manifest.hash).expect("known hash");
    assert_digests_match(hash.as_ref(), layout, all.as_bytes());

    let partitioner = RangePartitioner::new(layout.digest_len, manifest.num_partitions)
        .expect("valid partitioner");
    for (range, entry) in partitioner.ranges().zip(&manifest.partitions) {
        let shard = dataset.read_partition(range.index).expect("readable shard");
        assert_eq!(shard.len() as u64, entry.record_count);
        assert_in_range(&range, layout, shard.as_bytes());
    }
}

#[test]
fn conservation_and_order_hold_for_any_partition_count() -> Result<()> {
    for partitions in [1, 3, 7, 16] {
        let dir = tempdir()?;
        let report = Job::new(test_config(5000, partitions, dir.path())).run()?;
        assert_eq!(report.records_generated, 5000);
        let dataset = assert_vault_complete(dir.path());
        check_vault(&dataset, 5000);
    }
    Ok(())
}

#[test]
fn ranges_tile_the_digest_space() -> Result<()> {
    let dir = tempdir()?;
    Job::new(test_config(1000, 5, dir.path())).run()?;
    let dataset = assert_vault_complete(dir.path());
    let entries = &dataset.manifest().partitions;

    let digest_len = dataset.layout().digest_len;
    assert!(entries[0].lo.as_bytes().iter().all(|&b| b == 0));
    let top = entries[entries.len() - 1].hi.as_bytes();
    assert_eq!(top[0], 1);
    assert!(top[1..].iter().all(|&b| b == 0));
    assert_eq!(top.len(), digest_len + 1);
    for pair in entries.windows(2) {
        assert_eq!(pair[0].hi, pair[1].lo);
        assert!(pair[0].lo < pair[0].hi);
    }
    Ok(())
}

#[test]
fn resorting_a_partition_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    Job::new(test_config(3000, 3, dir.path())).run()?;
    let dataset = Dataset::open(dir.path())?;
    for partition in 0..3 {
        let shard = dataset.read_partition(partition)?;
        let mut resorted = shard.as_bytes().to_vec();
        sort_records(dataset.layout(), &mut resorted);
        assert_eq!(resorted, shard.as_bytes());
    }
    Ok(())
}

#[test]
fn sha256_vaults_record_their_hash() -> Result<()> {
    let dir = tempdir()?;
    let hash: Arc<dyn HashFunction> = Arc::new(Sha256Hash);
    Job::new(test_config(2000, 4, dir.path()))
        .with_hash(hash)
        .run()?;
    let dataset = assert_vault_complete(dir.path());
    assert_eq!(dataset.manifest().hash, "sha256");
    check_vault(&dataset, 2000);
    Ok(())
}

#[test]
fn custom_layouts_are_honoured() -> Result<()> {
    for layout in [RecordLayout::new(4, 4), RecordLayout::new(20, 12), RecordLayout::new(1, 2)] {
        let dir = tempdir()?;
        let config = test_config(1500, 4, dir.path()).with_layout(layout);
        Job::new(config).run()?;
        let dataset = assert_vault_complete(dir.path());
        assert_eq!(dataset.layout(), layout);
        check_vault(&dataset, 1500);
    }
    Ok(())
}

#[test]
fn uneven_unit_sizes_still_add_up() -> Result<()> {
    let dir = tempdir()?;
    // At most 97 records per unit: 11 units of 91.
    let config = test_config(1001, 2, dir.path()).with_unit_records(97).with_workers(3);
    let report = Job::new(config).run()?;
    assert_eq!(report.units_completed, 11);
    check_vault(&assert_vault_complete(dir.path()), 1001);
    Ok(())
}
