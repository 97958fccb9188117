//! Atomic shard files.
//!
//! A shard is the sorted content of one partition: concatenated records, no header,
//! no delimiters. [`ShardWriter`] streams into `part-NNNNN.bin.tmp` and only
//! [`commit`](ShardWriter::commit) makes the final name appear, after the data is on
//! disk. A writer dropped before commit removes its temp file, so a failed or
//! cancelled sort never leaves a shard behind.

use crate::partitioner::PartitionRange;
use crate::record::RecordLayout;
use crate::sort::RecordSink;
use anyhow::{Context, Result};
use glob::{Pattern, glob};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const TEMP_SUFFIX: &str = ".tmp";

#[must_use]
pub fn shard_file_name(partition: u32) -> String {
    format!("part-{partition:05}.bin")
}

/// A shard that reached its final name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedShard {
    pub partition: u32,
    pub file_name: String,
    pub records: u64,
    /// Hex SHA-256 of the shard bytes.
    pub sha256: String,
}

/// Streaming writer for one shard that checks every record it is given.
///
/// Records must arrive in non-decreasing order and fall inside the partition's range;
/// anything else is rejected with [`io::ErrorKind::InvalidData`].
pub struct ShardWriter {
    layout: RecordLayout,
    range: PartitionRange,
    expected: Option<u64>,
    final_path: PathBuf,
    temp_path: PathBuf,
    out: Option<BufWriter<File>>,
    hasher: Sha256,
    records: u64,
    last: Option<Vec<u8>>,
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl ShardWriter {
    /// Start writing the shard of `range.index` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be created.
    pub fn create(
        dir: &Path,
        layout: RecordLayout,
        range: PartitionRange,
        expected_records: Option<u64>,
    ) -> io::Result<Self> {
        let file_name = shard_file_name(range.index);
        let final_path = dir.join(&file_name);
        let temp_path = dir.join(format!("{file_name}{TEMP_SUFFIX}"));
        let out = BufWriter::with_capacity(1 << 20, File::create(&temp_path)?);
        Ok(Self {
            layout,
            range,
            expected: expected_records,
            final_path,
            temp_path,
            out: Some(out),
            hasher: Sha256::new(),
            records: 0,
            last: None,
        })
    }

    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    fn check(&mut self, records: &[u8]) -> io::Result<()> {
        let width = self.layout.record_len();
        let count = self.layout.count_records(records.len()).ok_or_else(|| {
            invalid(format!("{} bytes is not a whole number of records", records.len()))
        })?;
        if let Some(expected) = self.expected.filter(|&e| self.records + count as u64 > e) {
            return Err(invalid(format!(
                "partition {} received more than the {expected} staged records",
                self.range.index
            )));
        }
        let mut previous = self.last.as_deref();
        for record in records.chunks_exact(width) {
            if !self.range.contains(self.layout.digest(record)) {
                return Err(invalid(format!(
                    "record {} is outside partition {}",
                    hex::encode(self.layout.digest(record)),
                    self.range.index
                )));
            }
            if previous.is_some_and(|p| p > record) {
                return Err(invalid(format!(
                    "records out of order in partition {}",
                    self.range.index
                )));
            }
            previous = Some(record);
        }
        if let Some(tail) = records.len().checked_sub(width) {
            self.last = Some(records[tail..].to_vec());
        }
        self.records += count as u64;
        Ok(())
    }

    /// Flush, fsync and rename the shard to its final name.
    ///
    /// # Errors
    ///
    /// Returns an error if the record count differs from the expected one or the
    /// data cannot be made durable.
    pub fn commit(mut self) -> io::Result<CommittedShard> {
        if let Some(expected) = self.expected.filter(|&e| e != self.records) {
            return Err(invalid(format!(
                "partition {} wrote {} records, expected {expected}",
                self.range.index, self.records
            )));
        }
        let out = self
            .out
            .take()
            .ok_or_else(|| io::Error::other("shard writer already closed"))?;
        let file = out.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir)?;
        }

        let file_name = shard_file_name(self.range.index);
        debug!(partition = self.range.index, records = self.records, "shard committed");
        Ok(CommittedShard {
            partition: self.range.index,
            file_name,
            records: self.records,
            sha256: hex::encode(std::mem::take(&mut self.hasher).finalize()),
        })
    }
}

impl RecordSink for ShardWriter {
    fn write_records(&mut self, records: &[u8]) -> io::Result<()> {
        self.check(records)?;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::other("shard writer already closed"))?;
        out.write_all(records)?;
        self.hasher.update(records);
        Ok(())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            // Uncommitted; the temp file must not outlive the writer.
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove leftover `*.tmp` files from an output directory.
///
/// # Errors
///
/// Returns an error if the directory path cannot be used as a glob pattern or a
/// temp file cannot be removed.
pub fn sweep_temp_files(dir: &Path) -> Result<usize> {
    sweep_files(dir, &format!("*{TEMP_SUFFIX}"))
}

/// Remove the files in `dir` whose names match `pattern`. Returns how many were removed.
///
/// # Errors
///
/// Returns an error if the pattern is invalid or a matching file cannot be removed.
pub fn sweep_files(dir: &Path, pattern: &str) -> Result<usize> {
    let base = dir
        .to_str()
        .with_context(|| format!("output directory is not valid UTF-8: {}", dir.display()))?;
    let pattern = format!("{}/{pattern}", Pattern::escape(base));
    let mut removed = 0;
    for entry in glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::RangePartitioner;
    use tempfile::tempdir;

    fn layout() -> RecordLayout {
        RecordLayout::new(1, 1)
    }

    fn range(index: u32) -> PartitionRange {
        RangePartitioner::new(1, 2).unwrap().range(index)
    }

    #[test]
    fn commit_renames_and_checksums() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut writer = ShardWriter::create(dir.path(), layout(), range(1), Some(3))?;
        writer.write_records(&[0x80, 1, 0x90, 0])?;
        writer.write_records(&[0x90, 0])?;
        assert!(dir.path().join("part-00001.bin.tmp").exists());

        let shard = writer.commit()?;
        assert_eq!(shard.records, 3);
        assert_eq!(shard.file_name, "part-00001.bin");
        let bytes = fs::read(dir.path().join("part-00001.bin"))?;
        assert_eq!(bytes, vec![0x80, 1, 0x90, 0, 0x90, 0]);
        assert_eq!(shard.sha256, hex::encode(Sha256::digest(&bytes)));
        assert!(!dir.path().join("part-00001.bin.tmp").exists());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_and_unordered_records() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut writer = ShardWriter::create(dir.path(), layout(), range(0), None)?;
        let err = writer.write_records(&[0x80, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        writer.write_records(&[0x10, 5])?;
        let err = writer.write_records(&[0x10, 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        Ok(())
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() -> anyhow::Result<()> {
        let dir = tempdir()?;
        {
            let mut writer = ShardWriter::create(dir.path(), layout(), range(0), Some(2))?;
            writer.write_records(&[0x01, 0])?;
            assert!(writer.commit().is_err());
        }
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn sweep_removes_only_temp_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("part-00000.bin.tmp"), b"x")?;
        fs::write(dir.path().join("manifest.json.tmp"), b"x")?;
        fs::write(dir.path().join("part-00001.bin"), b"x")?;
        assert_eq!(sweep_temp_files(dir.path())?, 2);
        assert!(dir.path().join("part-00001.bin").exists());
        Ok(())
    }
}
