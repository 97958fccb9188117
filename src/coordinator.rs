//! Job orchestration: generation, staging, per-partition sorting and output.
//!
//! A run has two phases.
//!
//! **Generation.** Work units sit in a [`WorkQueue`]. Each of `workers` detached threads
//! claims a unit, generates its records in batches, tags every record with its
//! partition and sends the batch to the coordinator over a bounded channel. The
//! coordinator holds the batches of an attempt as pending and commits them to the
//! partition stages only when the attempt reports that it is done. A failed, panicked
//! or silent attempt is dropped together with its pending batches and the unit goes
//! back to the queue; messages from superseded attempts are ignored. A silent attempt
//! also gets a replacement worker, and the job never waits for the thread it abandoned.
//!
//! **Sort and write.** Every partition stage is sorted on a rayon pool, streamed into
//! its shard and committed. Each commit adds the partition to the manifest under a
//! lock and rewrites it. A failed sort attempt is retried with backoff. Once every
//! partition is committed the manifest is sealed and `_SUCCESS` written.

use crate::cancel::CancelToken;
use crate::config::JobConfig;
use crate::error::{EntropyError, JobError, SortError, WorkerFailure};
use crate::generator::{EntropySource, OsEntropy, WorkUnit, plan_work_units};
use crate::hash::{Blake3Hash, HashFunction};
use crate::manifest::{Manifest, ManifestEntry, marker_present, write_success_marker};
use crate::output::{ShardWriter, sweep_files, sweep_temp_files};
use crate::partitioner::{PartitionImbalance, RangePartitioner, check_balance};
use crate::queue::{Claim, Requeue, WorkQueue};
use crate::record::{RecordBatch, RecordLayout};
use crate::retry::retry_with_backoff;
use crate::sort::{SortSettings, sort_partition};
use crate::spill::{FsSpillStore, PartitionStage, SpillStore};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rayon::prelude::*;
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A generated batch with the partition of each record, in record order.
#[derive(Debug)]
struct TaggedBatch {
    batch: RecordBatch,
    partitions: Vec<u32>,
}

#[derive(Debug)]
enum GenMessage {
    Batch { claim: Claim, batch: TaggedBatch },
    Done { claim: Claim, generated: u64 },
    Failed { claim: Claim, failure: WorkerFailure },
    Fatal(EntropyError),
}

enum AttemptEnd {
    Done(u64),
    /// Superseded, closed or cancelled; nothing to report.
    Abandoned,
}

enum AttemptError {
    Entropy(EntropyError),
    Disconnected,
}

#[derive(Debug, Default)]
struct JobStats {
    records_generated: AtomicU64,
    units_completed: AtomicU64,
    unit_retries: AtomicU64,
    sort_retries: AtomicU64,
    stage_spills: AtomicU64,
    sort_runs: AtomicU64,
    merge_passes: AtomicU64,
}

impl JobStats {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Summary of a successful run.
#[derive(Clone, Debug)]
pub struct JobReport {
    /// The sealed manifest, as written to disk.
    pub manifest: Manifest,
    /// Partitions whose size was far from the uniform expectation.
    pub imbalances: Vec<PartitionImbalance>,
    pub records_generated: u64,
    pub units_completed: u64,
    /// Generation attempts that failed, panicked or timed out and were retried.
    pub unit_retries: u64,
    /// Sort attempts that failed and were retried.
    pub sort_retries: u64,
    pub stage_spills: u64,
    /// Sorted runs written by successful external sorts.
    pub sort_runs: u64,
    pub merge_passes: u64,
    pub elapsed: Duration,
}

/// One generate-partition-sort-write run.
///
/// ```no_run
/// use hashvault::{Job, JobConfig};
///
/// let report = Job::new(JobConfig::from_exponent(20, 8, "./vault")).run()?;
/// assert_eq!(report.manifest.total_record_count, Some(1 << 20));
/// # Ok::<(), hashvault::JobError>(())
/// ```
pub struct Job {
    config: JobConfig,
    hash: Arc<dyn HashFunction>,
    entropy: Arc<dyn EntropySource>,
    spill_store: Option<Arc<dyn SpillStore>>,
    cancel: CancelToken,
}

impl Job {
    /// A job using BLAKE3 and OS entropy, spilling under the configured scratch directory.
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            hash: Arc::new(Blake3Hash),
            entropy: Arc::new(OsEntropy),
            spill_store: None,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: Arc<dyn HashFunction>) -> Self {
        self.hash = hash;
        self
    }

    #[must_use]
    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// Use `store` for stages and runs instead of a scratch directory. The job does not
    /// purge a store it was given.
    #[must_use]
    pub fn with_spill_store(mut self, store: Arc<dyn SpillStore>) -> Self {
        self.spill_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle that cancels this job from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub const fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run the job to completion.
    ///
    /// On failure no completion marker exists, temp files are removed and the
    /// manifest (if any) still says `in_progress`.
    ///
    /// # Errors
    ///
    /// Returns a [`JobError`] whose [`stage`](JobError::stage) names the failing phase.
    pub fn run(&self) -> Result<JobReport, JobError> {
        let started = Instant::now();
        self.config.validate()?;
        let partitioner =
            RangePartitioner::new(self.config.layout.digest_len, self.config.num_partitions)?;

        // No output is created unless secure seeds are available.
        self.entropy.seed()?;

        let dir = &self.config.output_dir;
        prepare_output_dir(dir)?;

        let (store, owned) = match &self.spill_store {
            Some(store) => (Arc::clone(store), None),
            None => {
                let fs_store = Arc::new(
                    FsSpillStore::new(self.config.effective_scratch_dir())
                        .map_err(|e| JobError::write(None, e))?,
                );
                (Arc::clone(&fs_store) as Arc<dyn SpillStore>, Some(fs_store))
            }
        };

        let result = self.execute(&partitioner, &store, started);

        if let Some(fs_store) = owned {
            if let Err(e) = fs_store.purge() {
                warn!(
                    dir = %fs_store.root().display(),
                    error = %e,
                    "could not remove scratch directory"
                );
            }
        }
        match &result {
            Ok(report) => info!(
                records = report.records_generated,
                partitions = report.manifest.num_partitions,
                elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                "vault complete"
            ),
            Err(err) => {
                warn!(stage = ?err.stage(), error = %err, "job failed");
                if let Err(e) = sweep_temp_files(dir) {
                    warn!(error = %e, "could not sweep temp files");
                }
            }
        }
        result
    }

    fn execute(
        &self,
        partitioner: &RangePartitioner,
        store: &Arc<dyn SpillStore>,
        started: Instant,
    ) -> Result<JobReport, JobError> {
        #[cfg(feature = "metrics")]
        let metrics = {
            let metrics = crate::metrics::MetricsCollector::new();
            metrics.record_start();
            metrics
        };

        let config = &self.config;
        let stats = JobStats::default();
        let units = plan_work_units(config.total_records, config.effective_unit_records());
        info!(
            records = config.total_records,
            partitions = config.num_partitions,
            workers = config.effective_workers(),
            units = units.len(),
            "generation started"
        );

        let mut stages: Vec<PartitionStage> = (0..config.num_partitions)
            .map(|p| {
                PartitionStage::new(p, config.layout, Arc::clone(store), config.stage_buffer_bytes)
            })
            .collect();
        self.generate(partitioner, units, &mut stages, &stats)?;

        let counts: Vec<u64> = stages.iter().map(PartitionStage::records).collect();
        let staged: u64 = counts.iter().sum();
        if staged != config.total_records {
            // Units are only completed with their full count, so this is a bookkeeping bug.
            return Err(JobError::Generation {
                unit: 0,
                attempts: 0,
                last_failure: WorkerFailure::Failed(format!(
                    "{staged} records staged, {} requested",
                    config.total_records
                )),
            });
        }
        JobStats::add(
            &stats.stage_spills,
            stages.iter().map(|s| s.spill_count() as u64).sum(),
        );
        let imbalances = check_balance(&counts, config.imbalance_sigmas);
        info!(records = staged, imbalanced = imbalances.len(), "generation finished");

        let mut manifest = self.sort_and_write(partitioner, stages, &stats)?;

        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        manifest.finalize()?;
        manifest
            .save(&config.output_dir)
            .map_err(|e| JobError::write(None, e))?;
        write_success_marker(&config.output_dir).map_err(|e| JobError::write(None, e))?;

        let report = JobReport {
            manifest,
            imbalances,
            records_generated: JobStats::get(&stats.records_generated),
            units_completed: JobStats::get(&stats.units_completed),
            unit_retries: JobStats::get(&stats.unit_retries),
            sort_retries: JobStats::get(&stats.sort_retries),
            stage_spills: JobStats::get(&stats.stage_spills),
            sort_runs: JobStats::get(&stats.sort_runs),
            merge_passes: JobStats::get(&stats.merge_passes),
            elapsed: started.elapsed(),
        };

        #[cfg(feature = "metrics")]
        if config.write_metrics {
            metrics.record_end();
            metrics.record_job(&report);
            let path = config.output_dir.join(crate::metrics::METRICS_FILE);
            if let Err(e) = metrics.save_to_file(&path) {
                warn!(error = %e, "could not write metrics");
            }
        }

        Ok(report)
    }

    fn poll_interval(&self) -> Duration {
        poll_interval(self.config.unit_timeout)
    }

    fn generate(
        &self,
        partitioner: &RangePartitioner,
        units: Vec<WorkUnit>,
        stages: &mut [PartitionStage],
        stats: &JobStats,
    ) -> Result<(), JobError> {
        if units.is_empty() {
            return Ok(());
        }
        let context = Arc::new(WorkerContext {
            queue: WorkQueue::new(units),
            partitioner: *partitioner,
            layout: self.config.layout,
            batch_records: self.config.batch_records,
            poll: self.poll_interval(),
            hash: Arc::clone(&self.hash),
            entropy: Arc::clone(&self.entropy),
            cancel: self.cancel.clone(),
        });
        let (tx, rx) = bounded::<GenMessage>(self.config.channel_capacity);
        let mut workers = WorkerPool {
            context: Arc::clone(&context),
            tx,
            spawned: 0,
        };

        let result = workers
            .spawn_many(self.config.effective_workers())
            .and_then(|()| self.collect(&mut workers, &rx, stages, stats));
        // Closing the queue and dropping the receiver lets idle or blocked workers exit.
        // Workers stuck inside an abandoned attempt are not waited for.
        context.queue.close();
        result
    }

    fn collect(
        &self,
        workers: &mut WorkerPool,
        rx: &Receiver<GenMessage>,
        stages: &mut [PartitionStage],
        stats: &JobStats,
    ) -> Result<(), JobError> {
        let context = Arc::clone(&workers.context);
        let queue = &context.queue;
        let mut pending: HashMap<Claim, Vec<TaggedBatch>> = HashMap::new();
        let timeout = self.config.unit_timeout;
        let tick = self.poll_interval();

        loop {
            if self.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if queue.is_done() {
                return Ok(());
            }
            match rx.recv_timeout(tick) {
                Ok(GenMessage::Batch { claim, batch }) => {
                    if queue.touch(&claim) {
                        pending.entry(claim).or_default().push(batch);
                    }
                }
                Ok(GenMessage::Done { claim, generated }) => {
                    let batches = pending.remove(&claim).unwrap_or_default();
                    if !queue.is_current(&claim) {
                        continue;
                    }
                    let received: u64 = batches.iter().map(|b| b.batch.len() as u64).sum();
                    if received != generated || generated != claim.unit.requested {
                        let failure = WorkerFailure::Failed(format!(
                            "attempt delivered {received} of {} records",
                            claim.unit.requested
                        ));
                        self.fail_claim(queue, claim, failure, stats)?;
                        continue;
                    }
                    for batch in batches {
                        commit_batch(stages, &batch)?;
                    }
                    if queue.complete(&claim) {
                        JobStats::add(&stats.units_completed, 1);
                        JobStats::add(&stats.records_generated, generated);
                        debug!(
                            unit = claim.unit.id,
                            attempt = claim.attempt,
                            records = generated,
                            "unit committed"
                        );
                    }
                }
                Ok(GenMessage::Failed { claim, failure }) => {
                    pending.remove(&claim);
                    self.fail_claim(queue, claim, failure, stats)?;
                }
                Ok(GenMessage::Fatal(e)) => return Err(JobError::Entropy(e)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.cancel.is_cancelled() {
                        return Err(JobError::Cancelled);
                    }
                    if queue.is_done() {
                        return Ok(());
                    }
                    return Err(JobError::Generation {
                        unit: queue.completed(),
                        attempts: 0,
                        last_failure: WorkerFailure::Failed("every worker exited".into()),
                    });
                }
            }

            for claim in queue.expired(timeout) {
                pending.remove(&claim);
                warn!(unit = claim.unit.id, attempt = claim.attempt, ?timeout, "unit timed out");
                self.fail_claim(queue, claim, WorkerFailure::TimedOut(timeout), stats)?;
                // The thread running the silent attempt may never come back.
                workers.spawn()?;
            }
        }
    }

    fn fail_claim(
        &self,
        queue: &WorkQueue,
        claim: Claim,
        failure: WorkerFailure,
        stats: &JobStats,
    ) -> Result<(), JobError> {
        match queue.fail(&claim, self.config.retry.max_attempts) {
            Requeue::Requeued => {
                JobStats::add(&stats.unit_retries, 1);
                warn!(
                    unit = claim.unit.id,
                    attempt = claim.attempt,
                    %failure,
                    "unit attempt failed; requeued"
                );
                Ok(())
            }
            Requeue::Exhausted { attempts } => Err(JobError::Generation {
                unit: claim.unit.id,
                attempts,
                last_failure: failure,
            }),
            Requeue::Stale => Ok(()),
        }
    }

    fn sort_and_write(
        &self,
        partitioner: &RangePartitioner,
        stages: Vec<PartitionStage>,
        stats: &JobStats,
    ) -> Result<Manifest, JobError> {
        let config = &self.config;
        let dir = &config.output_dir;
        let manifest = Manifest::new(
            self.hash.name(),
            config.layout,
            config.num_partitions,
            config.total_records,
        );
        manifest.save(dir).map_err(|e| JobError::write(None, e))?;
        let manifest = Mutex::new(manifest);

        let settings = SortSettings {
            memory_bytes: config.sort_memory_bytes,
            merge_fan_in: config.merge_fan_in,
            ..SortSettings::default()
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.effective_workers())
            .thread_name(|i| format!("hashvault-sort-{i}"))
            .build()
            .map_err(|e| JobError::write(None, io::Error::other(e)))?;

        pool.install(|| {
            stages.into_par_iter().try_for_each(|stage| -> Result<(), JobError> {
                let partition = stage.partition();
                let range = partitioner.range(partition);
                let expected = stage.records();

                let (outcome, shard) = retry_with_backoff(
                    &config.retry,
                    |attempt| {
                        if attempt > 1 {
                            JobStats::add(&stats.sort_retries, 1);
                        }
                        let mut writer =
                            ShardWriter::create(dir, config.layout, range.clone(), Some(expected))
                                .map_err(SortError::Output)?;
                        let outcome =
                            sort_partition(&stage, attempt, &settings, &self.cancel, &mut writer)?;
                        let shard = writer.commit().map_err(SortError::Output)?;
                        Ok((outcome, shard))
                    },
                    SortError::is_retryable,
                )
                .map_err(|e| JobError::from_sort(partition, e))?;

                JobStats::add(&stats.sort_runs, outcome.runs as u64);
                JobStats::add(&stats.merge_passes, u64::from(outcome.merge_passes));
                {
                    let mut manifest = manifest.lock().unwrap_or_else(PoisonError::into_inner);
                    manifest.record(ManifestEntry {
                        partition,
                        lo: range.lo,
                        hi: range.hi,
                        record_count: shard.records,
                        shard: shard.file_name,
                        sha256: shard.sha256,
                    });
                    manifest
                        .save(dir)
                        .map_err(|e| JobError::write(Some(partition), e))?;
                }
                if let Err(e) = stage.discard() {
                    warn!(partition, error = %e, "could not remove stage");
                }
                info!(
                    partition,
                    records = shard.records,
                    runs = outcome.runs,
                    "partition committed"
                );
                Ok(())
            })
        })?;

        Ok(manifest.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}

/// State shared by the generation workers. Workers own an `Arc` of it, so a worker
/// stuck in an abandoned attempt can outlive the job.
struct WorkerContext {
    queue: WorkQueue,
    partitioner: RangePartitioner,
    layout: RecordLayout,
    batch_records: usize,
    poll: Duration,
    hash: Arc<dyn HashFunction>,
    entropy: Arc<dyn EntropySource>,
    cancel: CancelToken,
}

impl WorkerContext {
    fn worker_loop(&self, worker: usize, tx: &Sender<GenMessage>) {
        while let Some(claim) = self.queue.claim(&self.cancel, self.poll) {
            debug!(worker, unit = claim.unit.id, attempt = claim.attempt, "unit claimed");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_attempt(claim, tx)));
            let message = match outcome {
                Ok(Ok(AttemptEnd::Done(generated))) => GenMessage::Done { claim, generated },
                Ok(Ok(AttemptEnd::Abandoned)) => continue,
                Ok(Err(AttemptError::Entropy(e))) => GenMessage::Fatal(e),
                Ok(Err(AttemptError::Disconnected)) => return,
                Err(payload) => GenMessage::Failed {
                    claim,
                    failure: WorkerFailure::Panicked(panic_message(payload.as_ref())),
                },
            };
            if tx.send(message).is_err() {
                return;
            }
        }
        debug!(worker, "worker exiting");
    }

    fn run_attempt(
        &self,
        claim: Claim,
        tx: &Sender<GenMessage>,
    ) -> Result<AttemptEnd, AttemptError> {
        let layout = self.layout;
        let mut generator = claim
            .unit
            .open(layout, Arc::clone(&self.hash), self.entropy.as_ref())
            .map_err(AttemptError::Entropy)?;
        let mut generated = 0u64;
        while let Some(batch) = generator.next_batch(self.batch_records) {
            if self.cancel.is_cancelled() || !self.queue.touch(&claim) {
                return Ok(AttemptEnd::Abandoned);
            }
            let partitions = batch
                .iter()
                .map(|record| self.partitioner.index_of(layout.digest(record)))
                .collect();
            generated += batch.len() as u64;
            tx.send(GenMessage::Batch {
                claim,
                batch: TaggedBatch { batch, partitions },
            })
            .map_err(|_| AttemptError::Disconnected)?;
        }
        Ok(AttemptEnd::Done(generated))
    }
}

/// Spawns detached generation workers. Holding `tx` keeps the channel open while
/// replacements may still be needed.
struct WorkerPool {
    context: Arc<WorkerContext>,
    tx: Sender<GenMessage>,
    spawned: usize,
}

impl WorkerPool {
    fn spawn(&mut self) -> Result<(), JobError> {
        let worker = self.spawned;
        let context = Arc::clone(&self.context);
        let tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("hashvault-gen-{worker}"))
            .spawn(move || context.worker_loop(worker, &tx))
            .map_err(|e| JobError::Generation {
                unit: 0,
                attempts: 0,
                last_failure: WorkerFailure::Failed(format!("could not spawn worker: {e}")),
            })?;
        self.spawned += 1;
        Ok(())
    }

    fn spawn_many(&mut self, n: usize) -> Result<(), JobError> {
        (0..n).try_for_each(|_| self.spawn())
    }
}

fn poll_interval(unit_timeout: Duration) -> Duration {
    (unit_timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(100))
}

fn prepare_output_dir(dir: &std::path::Path) -> Result<(), JobError> {
    fs::create_dir_all(dir).map_err(|e| JobError::write(None, e))?;
    if marker_present(dir) {
        return Err(JobError::write(
            None,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already holds a complete dataset", dir.display()),
            ),
        ));
    }
    // Leftovers of an earlier run that never completed.
    for pattern in ["*.tmp", "part-*.bin", "manifest.json", "metrics.json"] {
        sweep_files(dir, pattern).map_err(|e| JobError::write(None, io::Error::other(e)))?;
    }
    Ok(())
}

fn commit_batch(stages: &mut [PartitionStage], tagged: &TaggedBatch) -> Result<(), JobError> {
    for (record, &partition) in tagged.batch.iter().zip(&tagged.partitions) {
        stages[partition as usize]
            .push_bytes(record)
            .map_err(|e| JobError::from_sort(partition, SortError::Stage(e)))?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }

    #[test]
    fn existing_complete_dataset_is_not_overwritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_success_marker(dir.path())?;
        let err = prepare_output_dir(dir.path()).unwrap_err();
        assert_eq!(err.stage(), crate::error::Stage::Write);
        Ok(())
    }

    #[test]
    fn stale_partial_output_is_cleared() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("part-00003.bin"), b"old")?;
        fs::write(dir.path().join("part-00001.bin.tmp"), b"old")?;
        fs::write(dir.path().join("manifest.json"), b"{}")?;
        fs::write(dir.path().join("notes.txt"), b"keep")?;
        prepare_output_dir(dir.path())?;
        let names: Vec<String> = fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["notes.txt".to_string()]);
        Ok(())
    }
}
