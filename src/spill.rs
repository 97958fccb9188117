//! Scratch storage for partition staging and sort runs.
//!
//! All disk traffic of the sort goes through a [`SpillStore`], so tests can swap
//! in a store that fails on demand. Two kinds of segment exist:
//!
//! - the **stage** of a partition: unsorted input appended while generation runs.
//!   It is only read by sort attempts, never consumed, so a failed sort can start over.
//! - **runs**: sorted segments that belong to one sort attempt. A retry never sees
//!   the runs of an earlier attempt; they are removed with
//!   [`discard_attempt`](SpillStore::discard_attempt).

use crate::record::RecordLayout;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// What a scratch segment holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Stage,
    /// Sorted run `seq` written in merge pass `pass` of sort attempt `attempt`.
    /// Pass 0 holds the runs cut from the stage.
    Run { attempt: u32, pass: u32, seq: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub partition: u32,
    pub kind: SegmentKind,
}

impl SegmentId {
    #[must_use]
    pub const fn stage(partition: u32) -> Self {
        Self {
            partition,
            kind: SegmentKind::Stage,
        }
    }

    #[must_use]
    pub const fn run(partition: u32, attempt: u32, pass: u32, seq: usize) -> Self {
        Self {
            partition,
            kind: SegmentKind::Run { attempt, pass, seq },
        }
    }
}

/// Byte-oriented scratch storage.
pub trait SpillStore: Send + Sync {
    /// Create (or truncate) a segment for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be created.
    fn create(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>>;

    /// Open a segment for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be opened.
    fn append(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>>;

    /// # Errors
    ///
    /// Returns an error if the segment does not exist or cannot be read.
    fn open(&self, id: &SegmentId) -> io::Result<Box<dyn Read + Send>>;

    /// Remove a segment. Removing a missing segment is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing segment cannot be removed.
    fn remove(&self, id: &SegmentId) -> io::Result<()>;

    /// Remove every run written by one sort attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt's segments cannot be removed.
    fn discard_attempt(&self, partition: u32, attempt: u32) -> io::Result<()>;
}

/// [`SpillStore`] backed by a scratch directory.
///
/// Layout: `pNNNNN.stage` for stages and `pNNNNN-aA/run-P-S.bin` for runs.
#[derive(Debug)]
pub struct FsSpillStore {
    root: PathBuf,
}

impl FsSpillStore {
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn attempt_dir(&self, partition: u32, attempt: u32) -> PathBuf {
        self.root.join(format!("p{partition:05}-a{attempt}"))
    }

    fn path(&self, id: &SegmentId) -> PathBuf {
        match id.kind {
            SegmentKind::Stage => self.root.join(format!("p{:05}.stage", id.partition)),
            SegmentKind::Run { attempt, pass, seq } => self
                .attempt_dir(id.partition, attempt)
                .join(format!("run-{pass}-{seq}.bin")),
        }
    }

    fn prepare(&self, id: &SegmentId) -> io::Result<PathBuf> {
        let path = self.path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Remove the whole scratch directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists and cannot be removed.
    pub fn purge(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl SpillStore for FsSpillStore {
    fn create(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>> {
        let path = self.prepare(id)?;
        Ok(Box::new(File::create(path)?))
    }

    fn append(&self, id: &SegmentId) -> io::Result<Box<dyn Write + Send>> {
        let path = self.prepare(id)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open(&self, id: &SegmentId) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.path(id))?))
    }

    fn remove(&self, id: &SegmentId) -> io::Result<()> {
        ignore_missing(fs::remove_file(self.path(id)))
    }

    fn discard_attempt(&self, partition: u32, attempt: u32) -> io::Result<()> {
        ignore_missing(fs::remove_dir_all(self.attempt_dir(partition, attempt)))
    }
}

/// Unsorted input of one partition: an in-memory tail over an optional spilled prefix.
pub struct PartitionStage {
    partition: u32,
    layout: RecordLayout,
    store: Arc<dyn SpillStore>,
    buffer: Vec<u8>,
    buffer_limit: usize,
    spilled_bytes: u64,
    spills: usize,
}

impl PartitionStage {
    #[must_use]
    pub fn new(
        partition: u32,
        layout: RecordLayout,
        store: Arc<dyn SpillStore>,
        buffer_limit: usize,
    ) -> Self {
        Self {
            partition,
            layout,
            store,
            buffer: Vec::new(),
            buffer_limit,
            spilled_bytes: 0,
            spills: 0,
        }
    }

    #[must_use]
    pub const fn partition(&self) -> u32 {
        self.partition
    }

    #[must_use]
    pub const fn layout(&self) -> RecordLayout {
        self.layout
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SpillStore> {
        &self.store
    }

    /// Append whole records; spills the buffer once it reaches its limit.
    ///
    /// # Errors
    ///
    /// Returns an error if spilling to the store fails.
    pub fn push_bytes(&mut self, records: &[u8]) -> io::Result<()> {
        debug_assert!(self.layout.count_records(records.len()).is_some());
        self.buffer.extend_from_slice(records);
        if self.buffer.len() >= self.buffer_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut out = self.store.append(&SegmentId::stage(self.partition))?;
        out.write_all(&self.buffer)?;
        out.flush()?;
        self.spilled_bytes += self.buffer.len() as u64;
        self.spills += 1;
        debug!(
            partition = self.partition,
            bytes = self.buffer.len(),
            "spilled stage buffer"
        );
        self.buffer.clear();
        Ok(())
    }

    /// Staged bytes, spilled and buffered.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.spilled_bytes + self.buffer.len() as u64
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.byte_len() / self.layout.record_len() as u64
    }

    /// Number of times the buffer was written out.
    #[must_use]
    pub const fn spill_count(&self) -> usize {
        self.spills
    }

    /// Read the staged records from the start. Every call starts over.
    ///
    /// # Errors
    ///
    /// Returns an error if the spilled prefix cannot be opened.
    pub fn reader(&self) -> io::Result<StageReader<'_>> {
        let spilled = if self.spilled_bytes > 0 {
            Some(BufReader::new(
                self.store.open(&SegmentId::stage(self.partition))?,
            ))
        } else {
            None
        };
        Ok(StageReader {
            record_len: self.layout.record_len(),
            spilled,
            spilled_remaining: self.spilled_bytes,
            tail: &self.buffer,
        })
    }

    /// Drop the staged input and its spill segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the spill segment cannot be removed.
    pub fn discard(self) -> io::Result<()> {
        if self.spilled_bytes > 0 {
            self.store.remove(&SegmentId::stage(self.partition))?;
        }
        Ok(())
    }
}

/// Sequential reader over a [`PartitionStage`].
pub struct StageReader<'a> {
    record_len: usize,
    spilled: Option<BufReader<Box<dyn Read + Send>>>,
    spilled_remaining: u64,
    tail: &'a [u8],
}

impl StageReader<'_> {
    /// Replace `out` with up to `max_bytes` of whole records (at least one record if any
    /// remain). Returns the number of bytes read; zero means the stage is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the spilled prefix is shorter than recorded or unreadable.
    pub fn read_chunk(&mut self, max_bytes: usize, out: &mut Vec<u8>) -> io::Result<usize> {
        out.clear();
        let want = (max_bytes / self.record_len).max(1) * self.record_len;

        if let Some(spilled) = self.spilled.as_mut() {
            let take = usize::try_from(self.spilled_remaining)
                .unwrap_or(usize::MAX)
                .min(want);
            out.resize(take, 0);
            spilled.read_exact(out)?;
            self.spilled_remaining -= take as u64;
            if self.spilled_remaining == 0 {
                self.spilled = None;
            }
        }

        let room = want - out.len();
        if room > 0 && !self.tail.is_empty() {
            let take = room.min(self.tail.len());
            out.extend_from_slice(&self.tail[..take]);
            self.tail = &self.tail[take..];
        }
        Ok(out.len())
    }
}
