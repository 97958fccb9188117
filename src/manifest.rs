//! The manifest: authoritative description of a dataset's shape.
//!
//! The coordinator rewrites `manifest.json` after every committed shard with status
//! `in_progress`, and only after the last partition commits does it set
//! `total_record_count`, switch to `complete`, seal the file with a SHA-256 checksum
//! over its own content and write the `_SUCCESS` marker. Readers accept nothing less
//! than a marker plus a sealed, complete manifest whose shape is internally consistent.

use crate::error::ManifestError;
use crate::output::sync_dir;
use crate::partitioner::{DigestBound, RangePartitioner};
use crate::record::RecordLayout;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SUCCESS_MARKER: &str = "_SUCCESS";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    InProgress,
    Complete,
}

/// One committed partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub partition: u32,
    pub lo: DigestBound,
    pub hi: DigestBound,
    pub record_count: u64,
    /// Shard file name relative to the dataset directory.
    pub shard: String,
    /// Hex SHA-256 of the shard file.
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub status: ManifestStatus,
    /// Name of the hash the digests were computed with.
    pub hash: String,
    pub layout: RecordLayout,
    pub num_partitions: u32,
    pub requested_records: u64,
    /// Set when the manifest is finalized.
    pub total_record_count: Option<u64>,
    /// Committed partitions in index order.
    pub partitions: Vec<ManifestEntry>,
    /// SHA-256 over the manifest serialized with this field unset.
    pub checksum: Option<String>,
}

impl Manifest {
    #[must_use]
    pub fn new(
        hash: impl Into<String>,
        layout: RecordLayout,
        num_partitions: u32,
        requested_records: u64,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            status: ManifestStatus::InProgress,
            hash: hash.into(),
            layout,
            num_partitions,
            requested_records,
            total_record_count: None,
            partitions: Vec::new(),
            checksum: None,
        }
    }

    /// Add or replace the entry of a committed partition, keeping index order.
    pub fn record(&mut self, entry: ManifestEntry) {
        match self
            .partitions
            .binary_search_by_key(&entry.partition, |e| e.partition)
        {
            Ok(i) => self.partitions[i] = entry,
            Err(i) => self.partitions.insert(i, entry),
        }
    }

    #[must_use]
    pub fn entry(&self, partition: u32) -> Option<&ManifestEntry> {
        self.partitions
            .binary_search_by_key(&partition, |e| e.partition)
            .ok()
            .map(|i| &self.partitions[i])
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == ManifestStatus::Complete
    }

    /// Sum of the committed partitions' counts.
    #[must_use]
    pub fn committed_records(&self) -> u64 {
        self.partitions.iter().map(|e| e.record_count).sum()
    }

    /// Seal the manifest once every partition has committed.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::ShapeMismatch`] if partitions are missing or the
    /// counts do not add up to the requested total.
    pub fn finalize(&mut self) -> Result<(), ManifestError> {
        self.total_record_count = Some(self.committed_records());
        if let Err(e) = self.check_shape() {
            self.total_record_count = None;
            return Err(e);
        }
        self.status = ManifestStatus::Complete;
        self.checksum = Some(self.compute_checksum()?);
        Ok(())
    }

    /// Checksum of the canonical JSON form with `checksum` unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be serialized.
    pub fn compute_checksum(&self) -> Result<String, ManifestError> {
        let unsealed = Self {
            checksum: None,
            ..self.clone()
        };
        let bytes =
            serde_json::to_vec(&unsealed).map_err(|e| ManifestError::Corrupt(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Check that this is a sealed, complete and self-consistent manifest.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::Corrupt(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        if !self.is_complete() {
            return Err(ManifestError::Incomplete("manifest status is in_progress".into()));
        }
        let Some(stored) = self.checksum.as_deref() else {
            return Err(ManifestError::ChecksumMismatch);
        };
        if stored != self.compute_checksum()? {
            return Err(ManifestError::ChecksumMismatch);
        }
        self.layout
            .validate()
            .map_err(|e| ManifestError::Corrupt(e.to_string()))?;
        self.check_shape()
    }

    fn check_shape(&self) -> Result<(), ManifestError> {
        let shape = |msg: String| Err(ManifestError::ShapeMismatch(msg));
        let partitioner = RangePartitioner::new(self.layout.digest_len, self.num_partitions)
            .map_err(|e| ManifestError::Corrupt(e.to_string()))?;
        if self.partitions.len() != self.num_partitions as usize {
            return shape(format!(
                "{} of {} partitions recorded",
                self.partitions.len(),
                self.num_partitions
            ));
        }
        for (expected, entry) in partitioner.ranges().zip(&self.partitions) {
            if entry.partition != expected.index {
                return shape(format!(
                    "entry for partition {} where {} was expected",
                    entry.partition, expected.index
                ));
            }
            if entry.lo != expected.lo || entry.hi != expected.hi {
                return shape(format!("partition {} has wrong bounds", entry.partition));
            }
        }
        let sum = self.committed_records();
        if self.total_record_count != Some(sum) {
            return shape(format!(
                "partition counts sum to {sum}, total says {:?}",
                self.total_record_count
            ));
        }
        if sum != self.requested_records {
            return shape(format!(
                "{sum} records written, {} requested",
                self.requested_records
            ));
        }
        Ok(())
    }

    /// Atomically replace `<dir>/manifest.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written durably.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let path = dir.join(MANIFEST_FILE);
        let temp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, &path)?;
        sync_dir(dir)
    }

    /// Read `<dir>/manifest.json` without judging its content.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Missing`] or [`ManifestError::Corrupt`] if the file
    /// is absent or unparsable.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::Missing(path));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| ManifestError::Corrupt(e.to_string()))
    }

    /// Load a manifest a consumer may rely on: marker present, sealed and consistent.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset in `dir` is not complete and intact.
    pub fn load_complete(dir: &Path) -> Result<Self, ManifestError> {
        if !marker_present(dir) {
            return Err(ManifestError::Incomplete(format!(
                "no {SUCCESS_MARKER} marker in {}",
                dir.display()
            )));
        }
        let manifest = Self::load(dir)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Write the completion marker. Only called after the final manifest is durable.
///
/// # Errors
///
/// Returns an error if the marker cannot be created durably.
pub fn write_success_marker(dir: &Path) -> io::Result<()> {
    File::create(dir.join(SUCCESS_MARKER))?.sync_all()?;
    sync_dir(dir)
}

#[must_use]
pub fn marker_present(dir: &Path) -> bool {
    dir.join(SUCCESS_MARKER).is_file()
}
