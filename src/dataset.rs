//! Read side of a finished vault.
//!
//! [`Dataset::open`] only accepts a directory that a job completed: the `_SUCCESS`
//! marker, a sealed manifest and shard files whose sizes agree with their counts.
//! Everything else here works on that validated view.

use crate::error::ManifestError;
use crate::hash::{HashFunction, hash_by_name};
use crate::manifest::{Manifest, ManifestEntry};
use crate::output::shard_file_name;
use crate::partitioner::{PartitionRange, partition_index};
use crate::record::{MAX_DIGEST_LEN, RecordBatch, RecordLayout};
use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records read per chunk while streaming a shard.
const STREAM_RECORDS: usize = 8192;

/// A complete, validated vault directory.
pub struct Dataset {
    dir: PathBuf,
    manifest: Manifest,
    hash: Arc<dyn HashFunction>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("dir", &self.dir)
            .field("hash", &self.manifest.hash)
            .field("partitions", &self.manifest.num_partitions)
            .finish_non_exhaustive()
    }
}

impl Dataset {
    /// Open the vault in `dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] if the marker is missing, the manifest is not a
    /// sealed and consistent `complete` manifest, the hash it names is unknown, or a
    /// shard file is missing or has the wrong size.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let manifest = Manifest::load_complete(&dir)?;
        let hash = hash_by_name(&manifest.hash).ok_or_else(|| {
            ManifestError::Corrupt(format!("unknown hash function {:?}", manifest.hash))
        })?;
        let width = manifest.layout.record_len() as u64;
        for entry in &manifest.partitions {
            if entry.shard != shard_file_name(entry.partition) {
                return Err(ManifestError::ShapeMismatch(format!(
                    "partition {} names shard {:?}",
                    entry.partition, entry.shard
                )));
            }
            let path = dir.join(&entry.shard);
            let len = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ManifestError::ShapeMismatch(format!(
                        "shard {} is missing",
                        entry.shard
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            if len != entry.record_count * width {
                return Err(ManifestError::ShapeMismatch(format!(
                    "shard {} holds {len} bytes, {} records of {width} bytes expected",
                    entry.shard, entry.record_count
                )));
            }
        }
        debug!(dir = %dir.display(), partitions = manifest.num_partitions, "dataset opened");
        Ok(Self {
            dir,
            manifest,
            hash,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    #[must_use]
    pub const fn layout(&self) -> RecordLayout {
        self.manifest.layout
    }

    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.manifest.committed_records()
    }

    #[must_use]
    pub const fn num_partitions(&self) -> u32 {
        self.manifest.num_partitions
    }

    /// Path of a partition's shard, if the partition exists.
    #[must_use]
    pub fn shard_path(&self, partition: u32) -> Option<PathBuf> {
        self.manifest
            .entry(partition)
            .map(|entry| self.dir.join(&entry.shard))
    }

    fn entry(&self, partition: u32) -> Result<&ManifestEntry> {
        self.manifest.entry(partition).with_context(|| {
            format!(
                "partition {partition} out of range (dataset has {})",
                self.manifest.num_partitions
            )
        })
    }

    /// Load one partition's records into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition does not exist or its shard cannot be read.
    pub fn read_partition(&self, partition: u32) -> Result<RecordBatch> {
        let entry = self.entry(partition)?;
        let path = self.dir.join(&entry.shard);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        RecordBatch::from_bytes(self.layout(), bytes)
            .with_context(|| format!("decoding {}", path.display()))
    }

    /// The first `n` records of the dataset in sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if a shard cannot be read.
    pub fn head(&self, n: usize) -> Result<RecordBatch> {
        let layout = self.layout();
        let width = layout.record_len();
        let mut out = RecordBatch::with_capacity(layout, n.min(STREAM_RECORDS));
        for entry in &self.manifest.partitions {
            let wanted = n - out.len();
            if wanted == 0 {
                break;
            }
            let path = self.dir.join(&entry.shard);
            let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            let mut bytes = Vec::new();
            let limit = u64::try_from(wanted)
                .unwrap_or(u64::MAX)
                .saturating_mul(width as u64);
            file.take(limit)
                .read_to_end(&mut bytes)
                .with_context(|| format!("reading {}", path.display()))?;
            for record in bytes.chunks_exact(width) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Stream every shard and check it against the manifest.
    ///
    /// Partitions are checked in parallel. Problems are counted in the report rather
    /// than returned as errors; only I/O failures are errors.
    ///
    /// # Errors
    ///
    /// Returns an error if a shard cannot be read.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut partitions: Vec<(PartitionReport, Option<Bounds>)> = self
            .manifest
            .partitions
            .par_iter()
            .map(|entry| self.verify_partition(entry))
            .collect::<Result<_>>()?;
        partitions.sort_by_key(|(report, _)| report.partition);

        let mut boundary_violations = Vec::new();
        let mut previous: Option<&[u8]> = None;
        for (report, bounds) in &partitions {
            let Some(bounds) = bounds else { continue };
            if previous.is_some_and(|last| last > bounds.first.as_slice()) {
                boundary_violations.push(report.partition);
            }
            previous = Some(&bounds.last);
        }

        let report = VerifyReport {
            partitions: partitions.into_iter().map(|(report, _)| report).collect(),
            boundary_violations,
        };
        if report.is_ok() {
            info!(dir = %self.dir.display(), records = report.records(), "dataset verified");
        } else {
            warn!(
                dir = %self.dir.display(),
                failed = ?report.failed_partitions(),
                boundaries = ?report.boundary_violations,
                "dataset failed verification"
            );
        }
        Ok(report)
    }

    fn verify_partition(&self, entry: &ManifestEntry) -> Result<(PartitionReport, Option<Bounds>)> {
        let layout = self.layout();
        let width = layout.record_len();
        let range = PartitionRange {
            index: entry.partition,
            lo: entry.lo.clone(),
            hi: entry.hi.clone(),
        };
        let path = self.dir.join(&entry.shard);
        let mut reader = BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );

        let mut report = PartitionReport {
            partition: entry.partition,
            records: 0,
            out_of_order: 0,
            out_of_range: 0,
            bad_digests: 0,
            count_ok: false,
            checksum_ok: false,
        };
        let mut hasher = Sha256::new();
        let mut expected = [0u8; MAX_DIGEST_LEN];
        let expected = &mut expected[..layout.digest_len];
        let mut first: Option<Vec<u8>> = None;
        let mut last: Vec<u8> = Vec::new();
        let mut trailing = 0usize;
        let mut chunk = Vec::with_capacity(STREAM_RECORDS * width);

        loop {
            chunk.clear();
            let n = (&mut reader)
                .take((STREAM_RECORDS * width) as u64)
                .read_to_end(&mut chunk)
                .with_context(|| format!("reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk);
            let records = chunk.chunks_exact(width);
            trailing = records.remainder().len();
            for record in records {
                if first.is_none() {
                    first = Some(record.to_vec());
                } else if last.as_slice() > record {
                    report.out_of_order += 1;
                }
                if !range.contains(layout.digest(record)) {
                    report.out_of_range += 1;
                }
                self.hash.digest_into(layout.nonce(record), expected);
                if layout.digest(record) != &*expected {
                    report.bad_digests += 1;
                }
                last.clear();
                last.extend_from_slice(record);
                report.records += 1;
            }
        }

        report.count_ok = trailing == 0 && report.records == entry.record_count;
        report.checksum_ok = hex::encode(hasher.finalize()) == entry.sha256;
        let bounds = first.map(|first| Bounds { first, last });
        Ok((report, bounds))
    }

    /// Find every record whose digest starts with `prefix`.
    ///
    /// Only partitions whose ranges intersect the prefix are searched, each with a
    /// lower-bound and an upper-bound binary search over the shard file.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is empty or longer than a digest, or a shard
    /// cannot be read.
    pub fn search(&self, prefix: &[u8]) -> Result<SearchResult> {
        let layout = self.layout();
        if prefix.is_empty() || prefix.len() > layout.digest_len {
            bail!(
                "prefix of {} bytes; expected 1..={} bytes",
                prefix.len(),
                layout.digest_len
            );
        }
        let mut low = prefix.to_vec();
        low.resize(layout.digest_len, 0x00);
        let mut high = prefix.to_vec();
        high.resize(layout.digest_len, 0xff);

        let mut result = SearchResult {
            prefix: prefix.to_vec(),
            matches: RecordBatch::new(layout),
            partitions: Vec::new(),
            comparisons: 0,
            seeks: 0,
        };
        let partitions = self.manifest.num_partitions;
        for partition in partition_index(&low, partitions)..=partition_index(&high, partitions) {
            let entry = self.entry(partition)?;
            result.partitions.push(partition);
            if entry.record_count == 0 {
                continue;
            }
            let path = self.dir.join(&entry.shard);
            let mut shard = ShardProbe {
                file: File::open(&path).with_context(|| format!("opening {}", path.display()))?,
                layout,
                prefix,
                digest: vec![0u8; layout.digest_len],
                comparisons: 0,
                seeks: 0,
            };
            let (start, end) = shard
                .equal_range(entry.record_count)
                .with_context(|| format!("searching {}", path.display()))?;
            result.comparisons += shard.comparisons;
            result.seeks += shard.seeks;
            if start < end {
                shard
                    .read_records(start, end, &mut result.matches)
                    .with_context(|| format!("reading matches from {}", path.display()))?;
            }
        }
        debug!(
            prefix = %hex::encode(prefix),
            matches = result.matches.len(),
            comparisons = result.comparisons,
            seeks = result.seeks,
            "prefix search"
        );
        Ok(result)
    }
}

struct Bounds {
    first: Vec<u8>,
    last: Vec<u8>,
}

/// Binary search over the digests of one shard file.
struct ShardProbe<'a> {
    file: File,
    layout: RecordLayout,
    prefix: &'a [u8],
    digest: Vec<u8>,
    comparisons: u64,
    seeks: u64,
}

impl ShardProbe<'_> {
    fn compare_at(&mut self, index: u64) -> io::Result<Ordering> {
        self.seeks += 1;
        self.comparisons += 1;
        self.file
            .seek(SeekFrom::Start(index * self.layout.record_len() as u64))?;
        self.file.read_exact(&mut self.digest)?;
        Ok(self.digest[..self.prefix.len()].cmp(self.prefix))
    }

    /// First index in `[0, n)` whose prefix compares as not `Less` (or not
    /// `Less`/`Equal` when `past_equal`).
    fn partition_point(&mut self, n: u64, past_equal: bool) -> io::Result<u64> {
        let (mut lo, mut hi) = (0u64, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let before = match self.compare_at(mid)? {
                Ordering::Less => true,
                Ordering::Equal => past_equal,
                Ordering::Greater => false,
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn equal_range(&mut self, n: u64) -> io::Result<(u64, u64)> {
        let start = self.partition_point(n, false)?;
        let end = self.partition_point(n, true)?;
        Ok((start, end.max(start)))
    }

    fn read_records(&mut self, start: u64, end: u64, out: &mut RecordBatch) -> io::Result<()> {
        let width = self.layout.record_len();
        self.seeks += 1;
        self.file.seek(SeekFrom::Start(start * width as u64))?;
        let mut bytes = Vec::new();
        (&mut self.file)
            .take((end - start) * width as u64)
            .read_to_end(&mut bytes)?;
        for record in bytes.chunks_exact(width) {
            out.push(record);
        }
        Ok(())
    }
}

/// Outcome of [`Dataset::verify`] for one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: u32,
    pub records: u64,
    /// Records smaller than their predecessor.
    pub out_of_order: u64,
    pub out_of_range: u64,
    /// Records whose digest does not match the hash of their nonce.
    pub bad_digests: u64,
    /// Whole records only, and as many as the manifest says.
    pub count_ok: bool,
    pub checksum_ok: bool,
}

impl PartitionReport {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.out_of_order == 0
            && self.out_of_range == 0
            && self.bad_digests == 0
            && self.count_ok
            && self.checksum_ok
    }
}

/// Outcome of [`Dataset::verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    /// One report per partition, in index order.
    pub partitions: Vec<PartitionReport>,
    /// Partitions whose first record is smaller than the last record of the
    /// preceding non-empty partition.
    pub boundary_violations: Vec<u32>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.boundary_violations.is_empty() && self.partitions.iter().all(PartitionReport::is_ok)
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.partitions.iter().map(|p| p.records).sum()
    }

    /// Order violations inside shards plus those across shard boundaries.
    #[must_use]
    pub fn out_of_order(&self) -> u64 {
        self.partitions.iter().map(|p| p.out_of_order).sum::<u64>()
            + self.boundary_violations.len() as u64
    }

    #[must_use]
    pub fn bad_digests(&self) -> u64 {
        self.partitions.iter().map(|p| p.bad_digests).sum()
    }

    #[must_use]
    pub fn failed_partitions(&self) -> Vec<u32> {
        self.partitions
            .iter()
            .filter(|p| !p.is_ok())
            .map(|p| p.partition)
            .collect()
    }
}

/// Outcome of [`Dataset::search`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub prefix: Vec<u8>,
    /// Matching records in sorted order.
    pub matches: RecordBatch,
    /// Partitions whose ranges intersect the prefix.
    pub partitions: Vec<u32>,
    /// Digest comparisons made by the binary searches.
    pub comparisons: u64,
    /// File seeks, including the one that reads the matches.
    pub seeks: u64,
}

impl SearchResult {
    #[must_use]
    pub fn is_found(&self) -> bool {
        !self.matches.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&[u8]> {
        self.matches.get(0)
    }
}
