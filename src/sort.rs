//! Per-partition sort: in memory when the stage fits, external otherwise.
//!
//! Records compare as unsigned byte strings over their full width, so digest order
//! dominates and equal digests fall back to nonce order. Equal records are
//! byte-identical, which makes the unstable parallel sort deterministic.
//!
//! Sorting copies every record into a fixed-width key, so a chunk of `n` records
//! costs `n * record_footprint(layout)` bytes. The external path cuts the stage into
//! the largest chunks that fit `memory_bytes`, sorts each one and writes it as a
//! run, then merges with a binary heap. More than `merge_fan_in` runs are first
//! reduced by intermediate passes that merge groups of runs in parallel.

use crate::cancel::CancelToken;
use crate::error::SortError;
use crate::record::{MAX_RECORD_LEN, RecordLayout};
use crate::spill::{PartitionStage, SegmentId, SpillStore};
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use tracing::{debug, warn};

const OUTPUT_BLOCK_BYTES: usize = 256 << 10;

/// Consumer of sorted records.
pub trait RecordSink {
    /// Accept a block of whole records that continues the sorted sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be stored.
    fn write_records(&mut self, records: &[u8]) -> io::Result<()>;
}

impl RecordSink for Vec<u8> {
    fn write_records(&mut self, records: &[u8]) -> io::Result<()> {
        self.extend_from_slice(records);
        Ok(())
    }
}

impl<W: Write> RecordSink for BufWriter<W> {
    fn write_records(&mut self, records: &[u8]) -> io::Result<()> {
        self.write_all(records)
    }
}

/// Sort a flat buffer of records in place.
///
/// # Panics
///
/// Panics if `records` is not a whole number of records.
pub fn sort_records(layout: RecordLayout, records: &mut [u8]) {
    let width = layout.record_len();
    assert!(
        layout.count_records(records.len()).is_some(),
        "buffer is not a whole number of records"
    );
    if width <= 16 {
        // Left-aligned big-endian packing keeps byte order and turns comparisons into integer ones.
        let mut keys: Vec<u128> = records
            .par_chunks_exact(width)
            .map(|r| {
                let mut packed = [0u8; 16];
                packed[..width].copy_from_slice(r);
                u128::from_be_bytes(packed)
            })
            .collect();
        keys.par_sort_unstable();
        records
            .par_chunks_exact_mut(width)
            .zip(keys.par_iter())
            .for_each(|(dst, key)| dst.copy_from_slice(&key.to_be_bytes()[..width]));
    } else {
        let mut keys: Vec<[u8; MAX_RECORD_LEN]> = records
            .par_chunks_exact(width)
            .map(|r| {
                let mut key = [0u8; MAX_RECORD_LEN];
                key[..width].copy_from_slice(r);
                key
            })
            .collect();
        keys.par_sort_unstable();
        records
            .par_chunks_exact_mut(width)
            .zip(keys.par_iter())
            .for_each(|(dst, key)| dst.copy_from_slice(&key[..width]));
    }
}

const fn key_width(record_width: usize) -> usize {
    if record_width <= 16 { 16 } else { MAX_RECORD_LEN }
}

/// Bytes one record occupies while [`sort_records`] runs: the record plus its key.
#[must_use]
pub const fn record_footprint(layout: RecordLayout) -> usize {
    let width = layout.record_len();
    width + key_width(width)
}

/// Largest whole-record chunk whose sort stays within `memory_bytes`.
fn chunk_bytes(layout: RecordLayout, memory_bytes: usize) -> usize {
    (memory_bytes / record_footprint(layout)).max(1) * layout.record_len()
}

/// True if `records` is non-decreasing.
#[must_use]
pub fn is_sorted(layout: RecordLayout, records: &[u8]) -> bool {
    let width = layout.record_len();
    records
        .chunks_exact(width)
        .zip(records.chunks_exact(width).skip(1))
        .all(|(a, b)| a <= b)
}

/// Memory and fan-in limits of one partition sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSettings {
    /// Peak memory of one in-memory sort, counting records and their sort keys
    /// (see [`record_footprint`]). Partitions that fit never touch runs.
    pub memory_bytes: usize,
    pub merge_fan_in: usize,
    /// Buffer per open run during a merge.
    pub read_buffer_bytes: usize,
}

impl Default for SortSettings {
    fn default() -> Self {
        Self {
            memory_bytes: 256 << 20,
            merge_fan_in: 64,
            read_buffer_bytes: 64 << 10,
        }
    }
}

/// What one successful sort did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortOutcome {
    pub records: u64,
    /// Runs cut from the stage. Zero for an in-memory sort.
    pub runs: usize,
    /// Intermediate merge passes before the final merge.
    pub merge_passes: u32,
}

#[derive(Clone, Copy, Debug)]
struct Run {
    id: SegmentId,
    records: u64,
}

/// Sort everything staged for one partition into `sink`.
///
/// Runs live under `attempt` and are removed before returning, whatever the
/// outcome. The stage itself is left untouched so a failed attempt can be retried.
///
/// # Errors
///
/// Returns [`SortError::Stage`] if the stage cannot be read, [`SortError::Spill`] or
/// [`SortError::Merge`] for run I/O, [`SortError::Output`] if `sink` fails and
/// [`SortError::Cancelled`] once `cancel` fires.
pub fn sort_partition(
    stage: &PartitionStage,
    attempt: u32,
    settings: &SortSettings,
    cancel: &CancelToken,
    sink: &mut dyn RecordSink,
) -> Result<SortOutcome, SortError> {
    let result = sort_staged(stage, attempt, settings, cancel, sink);
    if let Err(e) = stage.store().discard_attempt(stage.partition(), attempt) {
        warn!(partition = stage.partition(), attempt, error = %e, "could not remove sort runs");
    }
    result
}

fn sort_staged(
    stage: &PartitionStage,
    attempt: u32,
    settings: &SortSettings,
    cancel: &CancelToken,
    sink: &mut dyn RecordSink,
) -> Result<SortOutcome, SortError> {
    if cancel.is_cancelled() {
        return Err(SortError::Cancelled);
    }
    let layout = stage.layout();
    let width = layout.record_len();
    let memory = chunk_bytes(layout, settings.memory_bytes);
    let total = usize::try_from(stage.byte_len()).unwrap_or(usize::MAX);
    let mut reader = stage.reader().map_err(SortError::Stage)?;
    let mut buf = Vec::new();

    if total <= memory {
        reader.read_chunk(total, &mut buf).map_err(SortError::Stage)?;
        sort_records(layout, &mut buf);
        sink.write_records(&buf).map_err(SortError::Output)?;
        return Ok(SortOutcome {
            records: (buf.len() / width) as u64,
            runs: 0,
            merge_passes: 0,
        });
    }

    let store = stage.store().as_ref();
    let partition = stage.partition();
    let mut runs = Vec::new();
    loop {
        let read = reader.read_chunk(memory, &mut buf).map_err(SortError::Stage)?;
        if read == 0 {
            break;
        }
        if cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        sort_records(layout, &mut buf);
        let seq = runs.len();
        let id = SegmentId::run(partition, attempt, 0, seq);
        write_run(store, &id, &buf).map_err(|source| SortError::Spill { run: seq, source })?;
        runs.push(Run {
            id,
            records: (buf.len() / width) as u64,
        });
    }
    drop(buf);
    let cut = runs.len();
    debug!(partition, attempt, runs = cut, "stage cut into sorted runs");

    let fan_in = settings.merge_fan_in.max(2);
    let mut pass = 0;
    while runs.len() > fan_in {
        pass += 1;
        let merged = runs
            .par_chunks(fan_in)
            .enumerate()
            .map(|(seq, group)| -> Result<Run, SortError> {
                let id = SegmentId::run(partition, attempt, pass, seq);
                let mut out = BufWriter::new(store.create(&id).map_err(SortError::Merge)?);
                let records =
                    merge_runs(store, width, group, settings, cancel, &mut out, SortError::Merge)?;
                out.flush().map_err(SortError::Merge)?;
                Ok(Run { id, records })
            })
            .collect::<Result<Vec<_>, SortError>>()?;
        for run in &runs {
            store.remove(&run.id).map_err(SortError::Merge)?;
        }
        debug!(partition, attempt, pass, runs = merged.len(), "intermediate merge pass done");
        runs = merged;
    }

    let records = merge_runs(store, width, &runs, settings, cancel, sink, SortError::Output)?;
    Ok(SortOutcome {
        records,
        runs: cut,
        merge_passes: pass,
    })
}

fn write_run(store: &dyn SpillStore, id: &SegmentId, records: &[u8]) -> io::Result<()> {
    let mut out = BufWriter::new(store.create(id)?);
    out.write_all(records)?;
    out.flush()
}

struct RunCursor {
    reader: BufReader<Box<dyn Read + Send>>,
    remaining: u64,
    current: [u8; MAX_RECORD_LEN],
}

impl RunCursor {
    fn open(store: &dyn SpillStore, run: &Run, buffer_bytes: usize) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::with_capacity(buffer_bytes.max(4096), store.open(&run.id)?),
            remaining: run.records,
            current: [0; MAX_RECORD_LEN],
        })
    }

    /// Load the next record into `current`; false once the run is exhausted.
    fn advance(&mut self, width: usize) -> io::Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.reader.read_exact(&mut self.current[..width])?;
        self.remaining -= 1;
        Ok(true)
    }
}

/// K-way merge of sorted runs into `sink`. Keys are zero-padded to a fixed width, which
/// preserves order between records of equal length.
fn merge_runs<F>(
    store: &dyn SpillStore,
    width: usize,
    runs: &[Run],
    settings: &SortSettings,
    cancel: &CancelToken,
    sink: &mut dyn RecordSink,
    sink_err: F,
) -> Result<u64, SortError>
where
    F: Fn(io::Error) -> SortError,
{
    let mut cursors = Vec::with_capacity(runs.len());
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (i, run) in runs.iter().enumerate() {
        let mut cursor =
            RunCursor::open(store, run, settings.read_buffer_bytes).map_err(SortError::Merge)?;
        if cursor.advance(width).map_err(SortError::Merge)? {
            heap.push(Reverse((cursor.current, i)));
        }
        cursors.push(cursor);
    }

    let mut block = Vec::with_capacity(OUTPUT_BLOCK_BYTES);
    let mut written = 0u64;
    while let Some(Reverse((key, i))) = heap.pop() {
        block.extend_from_slice(&key[..width]);
        written += 1;
        if block.len() >= OUTPUT_BLOCK_BYTES {
            if cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            sink.write_records(&block).map_err(&sink_err)?;
            block.clear();
        }
        let cursor = &mut cursors[i];
        if cursor.advance(width).map_err(SortError::Merge)? {
            heap.push(Reverse((cursor.current, i)));
        }
    }
    if !block.is_empty() {
        sink.write_records(&block).map_err(&sink_err)?;
    }
    Ok(written)
}
