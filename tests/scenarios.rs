//! End-to-end runs: the small reference vault, a crashing worker and a failing disk.

use anyhow::Result;
use hashvault::testing::*;
use hashvault::{Blake3Hash, FsSpillStore, Job, JobError, SortError, Stage};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn sixteen_records_in_two_partitions() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config(1 << 4, 2, dir.path());
    assert_eq!(hashvault::JobConfig::from_exponent(4, 2, dir.path()).total_records, 16);

    let report = Job::new(config).run()?;
    assert_eq!(report.records_generated, 16);
    assert_eq!(report.manifest.total_record_count, Some(16));

    let dataset = assert_vault_complete(dir.path());
    let layout = dataset.layout();
    let all = concat_shards(&dataset);
    assert_eq!(all.len(), 16);
    assert_records_sorted(layout, all.as_bytes());
    assert_digests_match(&Blake3Hash, layout, all.as_bytes());

    // Partition 0 owns exactly the lower half of the digest space.
    let low = dataset.read_partition(0)?;
    let high = dataset.read_partition(1)?;
    assert_eq!(low.len() + high.len(), 16);
    assert!(low.iter().all(|r| r[0] < 0x80));
    assert!(high.iter().all(|r| r[0] >= 0x80));
    Ok(())
}

#[test]
fn worker_crash_is_recovered() -> Result<()> {
    let dir = tempdir()?;
    let hash = Arc::new(CrashOnceHash::after(300));
    let report = Job::new(test_config(4096, 4, dir.path()))
        .with_hash(hash.clone())
        .run()?;

    assert!(hash.fired());
    assert!(report.unit_retries >= 1);
    assert_eq!(report.records_generated, 4096);
    assert_eq!(report.manifest.partitions.len(), 4);

    let dataset = assert_vault_complete(dir.path());
    assert_eq!(dataset.total_records(), 4096);
    assert_eq!(dataset.manifest().hash, "blake3");
    Ok(())
}

#[test]
fn disk_failure_during_spill_fails_the_sort_stage() -> Result<()> {
    let dir = tempdir()?;
    let scratch = tempdir()?;
    let store = FailingSpillStore::new(
        Arc::new(FsSpillStore::new(scratch.path())?),
        FaultPoint::RunWrite,
    )
    .for_partition(1);
    let store = Arc::new(store);

    // 4096 records of 16 bytes over 4 partitions: about 16 KiB each, far over 2 KiB.
    let config = test_config(4096, 4, dir.path()).with_sort_memory_bytes(2 << 10);
    let err = Job::new(config)
        .with_spill_store(store.clone())
        .run()
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Sort);
    assert_eq!(err.exit_code(), 4);
    assert!(matches!(
        err,
        JobError::Sort {
            partition: 1,
            source: SortError::Spill { .. }
        }
    ));
    assert_eq!(store.injected(), 3);

    assert_vault_incomplete(dir.path());
    assert!(!dir.path().join("part-00001.bin").exists());
    for entry in fs::read_dir(dir.path())? {
        let name = entry?.file_name();
        assert!(!name.to_string_lossy().ends_with(".tmp"), "leftover {name:?}");
    }
    Ok(())
}
