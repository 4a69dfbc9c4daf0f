//! Per-tenant pipeline and the run over all tenants
//!
//! For each tenant: bootstrap the schema, sync the event record, ingest each
//! requested resource through a [`BatchCoordinator`], then recompute the
//! summary tables when anything was persisted. Tenants are independent; a
//! tenant that fails is reported and the run moves on to the next one.

use crate::aggregation::Aggregator;
use crate::config::{BatchConfig, Tenant};
use crate::coordinator::BatchCoordinator;
use crate::error::{IngestError, Result};
use crate::report::{AggregationOutcome, RunReport, RunSummary, TenantReport};
use crate::retry::RetryPolicy;
use crate::sink::PostgresSink;
use crate::source::{PagedSource, Resource, TicketApi};
use crate::transform::{self, EventTransform, RecordTransform, EVENTS};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub resources: Vec<Resource>,
    /// Only recompute the summary tables from what is already stored
    pub skip_fetch: bool,
    /// Re-run failed batches in explicit retry passes
    pub retry_failed: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resources: Resource::ALL.to_vec(),
            skip_fetch: false,
            retry_failed: false,
        }
    }
}

pub struct TenantPipeline {
    api: TicketApi,
    sink: PostgresSink,
    aggregator: Arc<dyn Aggregator>,
    batch: BatchConfig,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl TenantPipeline {
    pub fn new(
        api: TicketApi,
        sink: PostgresSink,
        aggregator: Arc<dyn Aggregator>,
        batch: BatchConfig,
        options: PipelineOptions,
    ) -> Self {
        Self {
            api,
            sink,
            aggregator,
            batch,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every tenant in order under one run id.
    pub async fn run_all(&self, tenants: &[Tenant]) -> RunSummary {
        let mut summary = RunSummary::new(Uuid::new_v4());
        info!(run_id = %summary.run_id, tenants = tenants.len(), "Starting run");

        for tenant in tenants {
            if self.cancel.is_cancelled() {
                warn!(tenant = %tenant.region, "Run cancelled, skipping tenant");
                summary
                    .tenants
                    .push(TenantReport::failed(tenant, summary.run_id, IngestError::Cancelled));
                continue;
            }

            let report = match self.run_tenant(tenant, summary.run_id).await {
                Ok(report) => report,
                Err(err) => {
                    error!(tenant = %tenant.region, error = %err, "Tenant run failed");
                    TenantReport::failed(tenant, summary.run_id, err)
                },
            };
            summary.tenants.push(report);
        }

        let failed = summary.failed_tenants().count();
        info!(
            run_id = %summary.run_id,
            tenants = summary.tenants.len(),
            failed,
            "Run finished"
        );
        summary
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant.region, schema = %tenant.schema))]
    pub async fn run_tenant(&self, tenant: &Tenant, run_id: Uuid) -> Result<TenantReport> {
        self.sink.ensure_schema(tenant).await?;
        let mut report = TenantReport::new(tenant, run_id);

        if !self.options.skip_fetch {
            self.sync_event(tenant).await?;
            for (idx, resource) in self.options.resources.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    let remaining = &self.options.resources[idx..];
                    warn!(skipped = ?remaining, "Run cancelled, skipping resources");
                    report.mark_cancelled(remaining);
                    return Ok(report);
                }
                let run_report = self.ingest(tenant, *resource, run_id).await?;
                run_report.log();
                report.resources.push(run_report);
            }
        }

        report.aggregation = if self.options.skip_fetch || report.total_processed() > 0 {
            self.aggregate(tenant, run_id).await
        } else {
            info!("Nothing processed, skipping aggregation");
            AggregationOutcome::Skipped {
                reason: "no rows processed".to_string(),
            }
        };
        Ok(report)
    }

    /// Fetch the tenant's event and upsert it into `events`.
    async fn sync_event(&self, tenant: &Tenant) -> Result<()> {
        let retry = RetryPolicy::from_config(&self.batch);
        let raw = retry.execute("event", |_| self.api.event(tenant)).await.result?;
        let row = EventTransform
            .transform(tenant, &raw)
            .map_err(|e| IngestError::Malformed(format!("event {}: {e}", tenant.event_id)))?;
        self.sink.upsert(tenant, &EVENTS, &[row]).await?;
        info!(event_id = %tenant.event_id, "Event synced");
        Ok(())
    }

    #[instrument(skip_all, fields(resource = %resource))]
    async fn ingest(&self, tenant: &Tenant, resource: Resource, run_id: Uuid) -> Result<RunReport> {
        let source: Arc<dyn PagedSource> = Arc::new(self.api.source(resource));
        let retry = RetryPolicy::from_config(&self.batch);
        let total = retry.execute("total", |_| source.total(tenant)).await.result?;
        info!(total, "Upstream total");

        let coordinator = BatchCoordinator::new(
            source,
            transform::for_resource(resource),
            Arc::new(self.sink.clone()),
            self.batch.clone(),
        )
        .with_cancellation(self.cancel.clone());

        let run = coordinator.run(tenant, total).await?;

        if self.options.retry_failed {
            for pass in 1..=self.batch.max_retries {
                if run.failed().is_empty() {
                    break;
                }
                info!(pass, "Retry pass");
                if coordinator.retry_failed(tenant, &run).await == 0 {
                    break;
                }
            }
        }

        let stats = run.finish();
        Ok(RunReport::new(tenant, resource, run_id, stats, &run))
    }

    async fn aggregate(&self, tenant: &Tenant, run_id: Uuid) -> AggregationOutcome {
        match self.aggregator.recompute_summaries(tenant, run_id).await {
            Ok(summary) => AggregationOutcome::Completed(summary),
            Err(err) => {
                error!(error = %err, "Aggregation failed");
                AggregationOutcome::Failed {
                    error: err.to_string(),
                }
            },
        }
    }
}
