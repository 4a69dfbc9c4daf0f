//! Batch outcomes and aggregate progress
//!
//! [`ProgressTracker`] is shared by every task of a run. All of its
//! read-modify-write operations happen under one lock, so a [`stats`]
//! snapshot always satisfies `completed + failed == total_batches` and the
//! item totals equal the sums over the recorded results.
//!
//! [`stats`]: ProgressTracker::stats

use crate::error::{IngestError, Result};
use crate::planner::Batch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves: `Pending -> Processing -> {Completed | Failed}` and
    /// `Failed -> Retrying -> Processing`.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Retrying)
                | (Self::Retrying, Self::Processing)
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of one batch attempt as reported by its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: usize,
    pub offset: u64,
    pub size: u64,
    pub status: BatchStatus,
    pub processed_count: u64,
    pub failed_count: u64,
    pub error_message: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Retries performed by the retry controller while fetching and committing
    pub retry_count: u32,
    /// Explicit retry passes this batch has been through
    pub retry_passes: u32,
}

impl BatchResult {
    pub fn completed(
        batch: &Batch,
        processed_count: u64,
        failed_count: u64,
        duration: Duration,
        retry_count: u32,
    ) -> Self {
        Self {
            batch_id: batch.batch_id,
            offset: batch.offset,
            size: batch.size,
            status: BatchStatus::Completed,
            processed_count,
            failed_count,
            error_message: None,
            duration,
            retry_count,
            retry_passes: 0,
        }
    }

    /// A batch that persisted nothing; every item in it counts as failed.
    pub fn failed(batch: &Batch, error: &IngestError, duration: Duration, retry_count: u32) -> Self {
        Self {
            batch_id: batch.batch_id,
            offset: batch.offset,
            size: batch.size,
            status: BatchStatus::Failed,
            processed_count: 0,
            failed_count: batch.size,
            error_message: Some(error.to_string()),
            duration,
            retry_count,
            retry_passes: 0,
        }
    }

    pub fn with_retry_passes(mut self, passes: u32) -> Self {
        self.retry_passes = passes;
        self
    }

    pub fn batch(&self) -> Batch {
        Batch {
            batch_id: self.batch_id,
            offset: self.offset,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// Batches dispatched so far; never-dispatched batches are not counted
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self {
            total_batches: 0,
            completed_batches: 0,
            failed_batches: 0,
            total_processed: 0,
            total_failed: 0,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_batches == 0 {
            return 0.0;
        }
        self.completed_batches as f64 / self.total_batches as f64
    }

    /// Elapsed time up to `end_time`, or up to now while still running
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    /// Items processed per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_processed as f64 / secs
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed_batches == 0
    }

    fn add(&mut self, result: &BatchResult) {
        match result.status {
            BatchStatus::Completed => self.completed_batches += 1,
            _ => self.failed_batches += 1,
        }
        self.total_processed += result.processed_count;
        self.total_failed += result.failed_count;
    }

    fn remove(&mut self, result: &BatchResult) {
        match result.status {
            BatchStatus::Completed => self.completed_batches -= 1,
            _ => self.failed_batches -= 1,
        }
        self.total_processed -= result.processed_count;
        self.total_failed -= result.failed_count;
    }
}

impl Default for ProcessingStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TrackerState {
    stats: ProcessingStats,
    statuses: BTreeMap<usize, BatchStatus>,
    results: BTreeMap<usize, BatchResult>,
    planned_items: u64,
}

/// Thread-safe accumulator of batch outcomes
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(planned_items: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                stats: ProcessingStats::new(),
                statuses: BTreeMap::new(),
                results: BTreeMap::new(),
                planned_items,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Counters are consistent after every guarded section; recover from poisoning
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(state: &mut TrackerState, batch_id: usize, next: BatchStatus) -> Result<()> {
        let current = state
            .statuses
            .get(&batch_id)
            .copied()
            .unwrap_or(BatchStatus::Pending);
        if !current.can_transition_to(next) {
            return Err(IngestError::permanent(format!(
                "batch {batch_id}: invalid status transition {current} -> {next}"
            )));
        }
        state.statuses.insert(batch_id, next);
        Ok(())
    }

    /// Record that a batch task has started. A first start also counts the
    /// batch towards `total_batches`.
    pub fn start(&self, batch_id: usize) -> Result<()> {
        let mut state = self.lock();
        let first_dispatch = !state.statuses.contains_key(&batch_id);
        Self::transition(&mut state, batch_id, BatchStatus::Processing)?;
        if first_dispatch {
            state.stats.total_batches += 1;
        }
        Ok(())
    }

    /// Move a failed batch into the retry pass.
    pub fn mark_retrying(&self, batch_id: usize) -> Result<()> {
        let mut state = self.lock();
        Self::transition(&mut state, batch_id, BatchStatus::Retrying)?;
        if let Some(result) = state.results.get_mut(&batch_id) {
            result.status = BatchStatus::Retrying;
        }
        Ok(())
    }

    /// Record a finished batch. A result for a batch that was already
    /// reported (a retry) replaces the earlier one in the totals.
    pub fn report(&self, result: BatchResult) -> Result<()> {
        if !result.status.is_terminal() {
            return Err(IngestError::permanent(format!(
                "batch {}: cannot report non-terminal status {}",
                result.batch_id, result.status
            )));
        }

        let mut state = self.lock();
        Self::transition(&mut state, result.batch_id, result.status)?;

        if let Some(previous) = state.results.remove(&result.batch_id) {
            state.stats.remove(&previous);
        }
        state.stats.add(&result);

        info!(
            batch_id = result.batch_id,
            status = %result.status,
            processed = result.processed_count,
            failed = result.failed_count,
            retries = result.retry_count,
            duration_ms = result.duration.as_millis() as u64,
            "Batch finished"
        );

        state.results.insert(result.batch_id, result);
        Ok(())
    }

    /// Consistent snapshot of the counters
    pub fn stats(&self) -> ProcessingStats {
        self.lock().stats.clone()
    }

    /// Stamp the end time and return the final counters
    pub fn finish(&self) -> ProcessingStats {
        let mut state = self.lock();
        state.stats.end_time = Some(Utc::now());
        state.stats.clone()
    }

    pub fn failed_batches(&self) -> Vec<BatchResult> {
        self.lock()
            .results
            .values()
            .filter(|r| r.status == BatchStatus::Failed)
            .cloned()
            .collect()
    }

    /// Every recorded result, ordered by batch id
    pub fn results(&self) -> Vec<BatchResult> {
        self.lock().results.values().cloned().collect()
    }

    pub fn status(&self, batch_id: usize) -> BatchStatus {
        self.lock()
            .statuses
            .get(&batch_id)
            .copied()
            .unwrap_or(BatchStatus::Pending)
    }

    /// Emit a one-line progress summary with rate and ETA.
    pub fn log_progress(&self) {
        let state = self.lock();
        let stats = &state.stats;
        let done = stats.total_processed + stats.total_failed;
        let rate = stats.throughput();
        let remaining = state.planned_items.saturating_sub(done);
        let eta_secs = if rate > 0.0 { remaining as f64 / rate } else { 0.0 };
        let percent = if state.planned_items > 0 {
            done as f64 / state.planned_items as f64 * 100.0
        } else {
            100.0
        };

        info!(
            done,
            planned = state.planned_items,
            percent = format_args!("{percent:.1}"),
            items_per_sec = format_args!("{rate:.1}"),
            eta_secs = format_args!("{eta_secs:.0}"),
            "Progress"
        );
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
