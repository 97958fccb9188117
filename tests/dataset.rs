//! Consumer side: opening, verifying, searching and listing finished vaults, and
//! refusing damaged ones.

use anyhow::Result;
use hashvault::manifest::{MANIFEST_FILE, SUCCESS_MARKER};
use hashvault::testing::*;
use hashvault::{Dataset, Job, ManifestError, format_record};
use std::fs;
use std::path::Path;
use tempfile::{TempDir, tempdir};

fn vault(records: u64, partitions: u32) -> Result<TempDir> {
    let dir = tempdir()?;
    Job::new(test_config(records, partitions, dir.path())).run()?;
    Ok(dir)
}

fn shard(dir: &Path, partition: u32) -> std::path::PathBuf {
    dir.join(format!("part-{partition:05}.bin"))
}

#[test]
fn search_finds_existing_records() -> Result<()> {
    let dir = vault(4000, 4)?;
    let dataset = Dataset::open(dir.path())?;
    let all = concat_shards(&dataset);
    let digest_len = dataset.layout().digest_len;

    for index in [0, 1234, 3999] {
        let record = all.get(index).expect("record exists");
        let result = dataset.search(&record[..digest_len])?;
        assert!(result.is_found());
        assert!(result.matches.iter().any(|m| m == record));
        assert_eq!(result.partitions.len(), 1);
        assert!(result.comparisons > 0);
    }
    Ok(())
}

#[test]
fn short_prefix_matches_a_contiguous_block() -> Result<()> {
    let dir = vault(4000, 3)?;
    let dataset = Dataset::open(dir.path())?;
    let all = concat_shards(&dataset);

    let prefix = [0x55];
    let expected: Vec<&[u8]> = all.iter().filter(|r| r[0] == 0x55).collect();
    let result = dataset.search(&prefix)?;
    assert_eq!(result.matches.len(), expected.len());
    assert!(result.matches.iter().eq(expected.iter().copied()));
    if let Some(first) = result.first() {
        assert_eq!(first[0], 0x55);
    }
    Ok(())
}

#[test]
fn absent_prefix_is_not_found() -> Result<()> {
    let dir = vault(64, 2)?;
    let dataset = Dataset::open(dir.path())?;
    let all = concat_shards(&dataset);
    let digest_len = dataset.layout().digest_len;

    // A full-width digest one above an existing one is almost surely absent.
    let mut probe = all.get(10).expect("record exists")[..digest_len].to_vec();
    let last = probe.len() - 1;
    probe[last] = probe[last].wrapping_add(1);
    if all.iter().any(|r| r[..digest_len] == probe[..]) {
        return Ok(());
    }
    let result = dataset.search(&probe)?;
    assert!(!result.is_found());
    assert!(result.first().is_none());
    Ok(())
}

#[test]
fn head_lists_the_smallest_records() -> Result<()> {
    let dir = vault(500, 4)?;
    let dataset = Dataset::open(dir.path())?;
    let all = concat_shards(&dataset);
    let head = dataset.head(5)?;
    assert_eq!(head.len(), 5);
    assert_eq!(head.as_bytes(), &all.as_bytes()[..head.as_bytes().len()]);

    let line = format_record(dataset.layout(), head.get(0).expect("one record"));
    assert!(line.contains(" nonce="));
    Ok(())
}

#[test]
fn missing_marker_means_incomplete() -> Result<()> {
    let dir = vault(100, 2)?;
    fs::remove_file(dir.path().join(SUCCESS_MARKER))?;
    assert!(matches!(
        Dataset::open(dir.path()),
        Err(ManifestError::Incomplete(_))
    ));
    Ok(())
}

#[test]
fn edited_manifest_fails_its_checksum() -> Result<()> {
    let dir = vault(100, 2)?;
    let path = dir.path().join(MANIFEST_FILE);
    let mut manifest: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
    manifest["partitions"][0]["record_count"] = serde_json::json!(1);
    fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;
    assert!(matches!(
        Dataset::open(dir.path()),
        Err(ManifestError::ChecksumMismatch)
    ));
    Ok(())
}

#[test]
fn garbled_manifest_is_corrupt() -> Result<()> {
    let dir = vault(100, 2)?;
    fs::write(dir.path().join(MANIFEST_FILE), b"{\"version\": 1,")?;
    assert!(matches!(
        Dataset::open(dir.path()),
        Err(ManifestError::Corrupt(_))
    ));
    Ok(())
}

#[test]
fn deleted_shard_is_a_shape_mismatch() -> Result<()> {
    let dir = vault(100, 2)?;
    fs::remove_file(shard(dir.path(), 1))?;
    assert!(matches!(
        Dataset::open(dir.path()),
        Err(ManifestError::ShapeMismatch(_))
    ));
    Ok(())
}

#[test]
fn swapped_records_fail_verification() -> Result<()> {
    let dir = vault(2000, 2)?;
    let dataset = Dataset::open(dir.path())?;
    let width = dataset.layout().record_len();
    let path = shard(dir.path(), 0);
    let mut bytes = fs::read(&path)?;
    let (first, rest) = bytes.split_at_mut(width);
    first.swap_with_slice(&mut rest[..width]);
    fs::write(&path, &bytes)?;

    let report = dataset.verify()?;
    assert!(!report.is_ok());
    assert_eq!(report.failed_partitions(), vec![0]);
    assert_eq!(report.partitions[0].out_of_order, 1);
    assert!(!report.partitions[0].checksum_ok);
    assert!(report.partitions[1].is_ok());
    assert_eq!(report.bad_digests(), 0);
    Ok(())
}
