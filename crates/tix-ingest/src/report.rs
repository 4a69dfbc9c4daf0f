//! Run reports
//!
//! One [`RunReport`] per ingested resource, grouped per tenant into a
//! [`TenantReport`] and per invocation into a [`RunSummary`]. Everything
//! serializes to JSON for `--report`.

use crate::aggregation::AggregationSummary;
use crate::config::Tenant;
use crate::coordinator::BatchRun;
use crate::planner::Batch;
use crate::progress::{BatchResult, ProcessingStats};
use crate::source::Resource;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregationOutcome {
    NotRun,
    Skipped { reason: String },
    Completed(AggregationSummary),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tenant: String,
    pub resource: Resource,
    pub run_id: Uuid,
    pub stats: ProcessingStats,
    pub success_rate: f64,
    pub throughput: f64,
    pub duration_ms: u64,
    pub planned_batches: usize,
    /// Every batch result that did not complete
    pub failed: Vec<BatchResult>,
    /// Planned batches never dispatched
    pub skipped: Vec<Batch>,
    pub cancelled: bool,
}

impl RunReport {
    /// Build from a finished run; `stats` should come from [`BatchRun::finish`].
    pub fn new(
        tenant: &Tenant,
        resource: Resource,
        run_id: Uuid,
        stats: ProcessingStats,
        run: &BatchRun,
    ) -> Self {
        Self {
            tenant: tenant.region.clone(),
            resource,
            run_id,
            success_rate: stats.success_rate(),
            throughput: stats.throughput(),
            duration_ms: stats.duration().as_millis() as u64,
            stats,
            planned_batches: run.planned_batches(),
            failed: run.failed(),
            skipped: run.skipped().to_vec(),
            cancelled: run.cancelled(),
        }
    }

    /// Every planned batch was dispatched and completed
    pub fn is_success(&self) -> bool {
        self.stats.is_complete_success() && self.skipped.is_empty() && !self.cancelled
    }

    pub fn log(&self) {
        if self.is_success() {
            info!(
                tenant = %self.tenant,
                resource = %self.resource,
                batches = self.stats.total_batches,
                processed = self.stats.total_processed,
                rejected = self.stats.total_failed,
                success_rate = format_args!("{:.2}", self.success_rate),
                items_per_sec = format_args!("{:.1}", self.throughput),
                duration_ms = self.duration_ms,
                "Resource ingested"
            );
        } else {
            warn!(
                tenant = %self.tenant,
                resource = %self.resource,
                batches = self.stats.total_batches,
                completed = self.stats.completed_batches,
                failed = self.stats.failed_batches,
                skipped = self.skipped.len(),
                cancelled = self.cancelled,
                processed = self.stats.total_processed,
                "Resource ingested with failures"
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant: String,
    pub schema: String,
    pub run_id: Uuid,
    pub resources: Vec<RunReport>,
    /// Requested resources never started because the run was cancelled
    pub cancelled_resources: Vec<Resource>,
    /// Shared by every resource of the tenant; runs once after ingestion
    pub aggregation: AggregationOutcome,
    /// Set when the tenant could not be run at all
    pub error: Option<String>,
}

impl TenantReport {
    pub fn new(tenant: &Tenant, run_id: Uuid) -> Self {
        Self {
            tenant: tenant.region.clone(),
            schema: tenant.schema.clone(),
            run_id,
            resources: Vec::new(),
            cancelled_resources: Vec::new(),
            aggregation: AggregationOutcome::NotRun,
            error: None,
        }
    }

    pub fn failed(tenant: &Tenant, run_id: Uuid, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(tenant, run_id)
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.resources.iter().map(|r| r.stats.total_processed).sum()
    }

    /// Record resources left unstarted by a cancellation.
    pub fn mark_cancelled(&mut self, remaining: &[Resource]) {
        self.cancelled_resources.extend_from_slice(remaining);
        self.aggregation = AggregationOutcome::Skipped {
            reason: "run cancelled".to_string(),
        };
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self.cancelled_resources.is_empty()
            && self.resources.iter().all(RunReport::is_success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub tenants: Vec<TenantReport>,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            tenants: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.tenants.iter().all(TenantReport::is_success)
    }

    pub fn failed_tenants(&self) -> impl Iterator<Item = &TenantReport> {
        self.tenants.iter().filter(|t| !t.is_success())
    }

    pub fn to_json(&self) -> tix_common::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> tix_common::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        info!(path = %path.display(), "Run report written");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant {
            region: "emea".into(),
            schema: "emea".into(),
            event_id: "ev1".into(),
            token: "secret".into(),
            base_url: "http://localhost".into(),
        }
    }

    #[test]
    fn test_failed_tenant_is_not_success() {
        let mut summary = RunSummary::new(Uuid::new_v4());
        summary.tenants.push(TenantReport::new(&tenant(), summary.run_id));
        assert!(summary.is_success());

        summary
            .tenants
            .push(TenantReport::failed(&tenant(), summary.run_id, "event missing"));
        assert!(!summary.is_success());
        assert_eq!(summary.failed_tenants().count(), 1);
    }

    #[test]
    fn test_cancelled_resources_fail_tenant() {
        let mut report = TenantReport::new(&tenant(), Uuid::nil());
        assert!(report.is_success());

        report.mark_cancelled(&[Resource::Coupons]);
        assert!(!report.is_success());
        assert_eq!(report.cancelled_resources, vec![Resource::Coupons]);
        assert!(matches!(report.aggregation, AggregationOutcome::Skipped { .. }));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cancelled_resources"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_json_shape() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            tenants: vec![TenantReport {
                aggregation: AggregationOutcome::Completed(AggregationSummary {
                    ticket_types: 3,
                    age_group_rows: 14,
                }),
                ..TenantReport::new(&tenant(), Uuid::nil())
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        let aggregation = &value["tenants"][0]["aggregation"];
        assert_eq!(aggregation["status"], "completed");
        assert_eq!(aggregation["ticket_types"], 3);
        assert!(!value.to_string().contains("secret"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        RunSummary::new(Uuid::nil()).write_json(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"tenants\": []"));
    }
}
