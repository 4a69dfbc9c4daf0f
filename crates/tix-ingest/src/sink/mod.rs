//! Batch persistence
//!
//! A [`PersistenceSink`] writes one batch as one atomic unit. Replaying a
//! batch converges to the same rows, so retries and re-runs are safe.

pub mod postgres;

pub use postgres::PostgresSink;

use crate::config::Tenant;
use crate::error::Result;
use crate::transform::{TransformOutcome, UpsertSpec};
use async_trait::async_trait;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Upsert every row of `batch` in a single transaction.
    ///
    /// Returns `(processed_count, failed_count)`: rows written and records
    /// the transform rejected. Any storage error rolls the whole batch back
    /// and is returned instead.
    async fn commit(
        &self,
        tenant: &Tenant,
        batch_id: usize,
        spec: &'static UpsertSpec,
        batch: &TransformOutcome,
    ) -> Result<(u64, u64)>;
}
