//! Chunked, bounded-concurrency batch execution
//!
//! A [`BatchCoordinator`] runs the chunks produced by [`plan`] strictly in
//! order. Every batch of a chunk gets its own task in a [`JoinSet`]; the set
//! is drained completely before the next chunk is dispatched, so at most
//! `max_workers` batches (and therefore upstream requests and pooled
//! connections) are in flight at any time.
//!
//! Batch tasks never cancel each other. Whether to keep going is decided only
//! at chunk boundaries, from `stop_on_failure` and the cancellation token.

use crate::config::{BatchConfig, Tenant};
use crate::error::{IngestError, Result};
use crate::planner::{plan, Batch};
use crate::progress::{BatchResult, BatchStatus, ProcessingStats, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::sink::PersistenceSink;
use crate::source::PagedSource;
use crate::transform::{transform_all, RecordTransform};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Everything one batch task needs, cheap to clone into the task
#[derive(Clone)]
struct BatchWorker {
    source: Arc<dyn PagedSource>,
    transform: Arc<dyn RecordTransform>,
    sink: Arc<dyn PersistenceSink>,
    retry: RetryPolicy,
}

impl BatchWorker {
    /// Fetch, transform and commit one batch. Never panics on failure; the
    /// outcome is always a [`BatchResult`].
    async fn process(&self, tenant: &Tenant, batch: Batch) -> BatchResult {
        let started = Instant::now();

        let fetched = self
            .retry
            .execute("fetch", |_| self.source.page(tenant, batch.offset, batch.size))
            .await;
        let mut retries = fetched.retries;
        let items = match fetched.result {
            Ok(items) => items,
            Err(err) => return Self::fail(&batch, err, started, retries),
        };
        if items.len() as u64 != batch.size {
            warn!(
                batch_id = batch.batch_id,
                expected = batch.size,
                received = items.len(),
                "Page size differs from plan"
            );
        }

        let outcome = transform_all(self.transform.as_ref(), tenant, &items);
        let spec = self.transform.spec();

        let committed = self
            .retry
            .execute("commit", |_| {
                self.sink.commit(tenant, batch.batch_id, spec, &outcome)
            })
            .await;
        retries += committed.retries;

        match committed.result {
            Ok((processed, failed)) => {
                BatchResult::completed(&batch, processed, failed, started.elapsed(), retries)
            },
            Err(err) => Self::fail(&batch, err, started, retries),
        }
    }

    fn fail(batch: &Batch, err: IngestError, started: Instant, retries: u32) -> BatchResult {
        error!(
            batch_id = batch.batch_id,
            offset = batch.offset,
            error = %err,
            "Batch failed"
        );
        BatchResult::failed(batch, &err, started.elapsed(), retries)
    }
}

/// Outcome of one coordinated run over a resource
#[derive(Debug)]
pub struct BatchRun {
    tracker: Arc<ProgressTracker>,
    planned_batches: usize,
    skipped: Vec<Batch>,
    cancelled: bool,
}

impl BatchRun {
    pub fn stats(&self) -> ProcessingStats {
        self.tracker.stats()
    }

    /// Stamp the end time and return the final counters
    pub fn finish(&self) -> ProcessingStats {
        self.tracker.finish()
    }

    pub fn planned_batches(&self) -> usize {
        self.planned_batches
    }

    /// Every batch result not `Completed`
    pub fn failed(&self) -> Vec<BatchResult> {
        self.tracker.failed_batches()
    }

    pub fn results(&self) -> Vec<BatchResult> {
        self.tracker.results()
    }

    /// Planned batches that were never dispatched
    pub fn skipped(&self) -> &[Batch] {
        &self.skipped
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }
}

pub struct BatchCoordinator {
    worker: BatchWorker,
    config: BatchConfig,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(
        source: Arc<dyn PagedSource>,
        transform: Arc<dyn RecordTransform>,
        sink: Arc<dyn PersistenceSink>,
        config: BatchConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            worker: BatchWorker {
                source,
                transform,
                sink,
                retry,
            },
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.worker.retry = retry;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Plan `total_items` and run every chunk in order.
    ///
    /// Only planning errors are returned; batch failures end up in the
    /// returned [`BatchRun`].
    #[instrument(skip(self, tenant), fields(tenant = %tenant.region, table = self.worker.transform.spec().table))]
    pub async fn run(&self, tenant: &Tenant, total_items: u64) -> Result<BatchRun> {
        let chunks = plan(total_items, self.config.batch_size, self.config.max_workers)?;
        let planned_batches = chunks.iter().map(|c| c.batches.len()).sum();
        let tracker = Arc::new(ProgressTracker::new(total_items));

        info!(
            total_items,
            planned_batches,
            chunks = chunks.len(),
            batch_size = self.config.batch_size,
            max_workers = self.config.max_workers,
            "Starting batch run"
        );

        let mut skipped = Vec::new();
        let mut cancelled = false;

        for (position, chunk) in chunks.iter().enumerate() {
            let halt = if self.cancel.is_cancelled() {
                warn!(chunk = chunk.index, "Run cancelled, not dispatching further chunks");
                cancelled = true;
                true
            } else if self.config.stop_on_failure && tracker.stats().failed_batches > 0 {
                warn!(
                    chunk = chunk.index,
                    "Stopping after failed batch, not dispatching further chunks"
                );
                true
            } else {
                false
            };

            if halt {
                skipped.extend(chunks[position..].iter().flat_map(|c| c.batches.iter().copied()));
                break;
            }

            debug!(chunk = chunk.index, batches = chunk.batches.len(), "Dispatching chunk");
            let work = chunk.batches.iter().map(|b| (*b, 0)).collect();
            self.run_chunk(tenant, &tracker, work).await;
            tracker.log_progress();
        }

        let stats = tracker.stats();
        info!(
            completed = stats.completed_batches,
            failed = stats.failed_batches,
            skipped = skipped.len(),
            processed = stats.total_processed,
            "Batch run finished"
        );

        Ok(BatchRun {
            tracker,
            planned_batches,
            skipped,
            cancelled,
        })
    }

    /// One explicit retry pass over the failed batches of `run`.
    ///
    /// Batches that have already been through `max_retries` passes stay
    /// failed. Returns how many batches were re-dispatched.
    #[instrument(skip(self, tenant, run), fields(tenant = %tenant.region))]
    pub async fn retry_failed(&self, tenant: &Tenant, run: &BatchRun) -> usize {
        let eligible: Vec<(Batch, u32)> = run
            .failed()
            .into_iter()
            .filter(|result| {
                let keep = result.retry_passes < self.config.max_retries;
                if !keep {
                    warn!(
                        batch_id = result.batch_id,
                        passes = result.retry_passes,
                        "Retry passes exhausted, leaving batch failed"
                    );
                }
                keep
            })
            .map(|result| (result.batch(), result.retry_passes + 1))
            .collect();

        if eligible.is_empty() {
            return 0;
        }
        info!(batches = eligible.len(), "Retrying failed batches");

        let mut dispatched = 0;
        for chunk in eligible.chunks(self.config.max_workers) {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, abandoning retry pass");
                break;
            }

            let mut work = Vec::with_capacity(chunk.len());
            for (batch, passes) in chunk {
                match run.tracker.mark_retrying(batch.batch_id) {
                    Ok(()) => work.push((*batch, *passes)),
                    Err(err) => error!(batch_id = batch.batch_id, error = %err, "Cannot retry batch"),
                }
            }
            dispatched += work.len();
            self.run_chunk(tenant, &run.tracker, work).await;
            run.tracker.log_progress();
        }
        dispatched
    }

    /// Run one chunk to completion. Each task reports its own result; a task
    /// that died without reporting is recorded as failed afterwards.
    async fn run_chunk(
        &self,
        tenant: &Tenant,
        tracker: &Arc<ProgressTracker>,
        work: Vec<(Batch, u32)>,
    ) {
        let mut tasks = JoinSet::new();

        for (batch, passes) in &work {
            if let Err(err) = tracker.start(batch.batch_id) {
                error!(batch_id = batch.batch_id, error = %err, "Cannot start batch");
                continue;
            }

            let worker = self.worker.clone();
            let tenant = tenant.clone();
            let tracker = Arc::clone(tracker);
            let (batch, passes) = (*batch, *passes);
            tasks.spawn(async move {
                let result = worker.process(&tenant, batch).await.with_retry_passes(passes);
                if let Err(err) = tracker.report(result) {
                    error!(batch_id = batch.batch_id, error = %err, "Failed to record batch result");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Batch task aborted");
            }
        }

        for (batch, passes) in &work {
            if tracker.status(batch.batch_id) == BatchStatus::Processing {
                let err = IngestError::permanent("batch task aborted before reporting");
                let result = BatchResult::failed(batch, &err, Duration::ZERO, 0)
                    .with_retry_passes(*passes);
                if let Err(err) = tracker.report(result) {
                    error!(batch_id = batch.batch_id, error = %err, "Failed to record batch result");
                }
            }
        }
    }
}
