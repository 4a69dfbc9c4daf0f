//! Shared fixtures for tix-ingest integration tests
//!
//! - [`StubSource`]: in-memory paged source with scripted failures and an
//!   in-flight counter
//! - [`RecordingSink`]: sink that records committed ids and can fail batches
//! - [`TestPostgres`]: throwaway PostgreSQL container

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tix_ingest::config::{BatchConfig, Tenant};
use tix_ingest::error::IngestError;
use tix_ingest::source::{PagedSource, RawItem};
use tix_ingest::transform::{TransformOutcome, UpsertSpec};
use tix_ingest::sink::PersistenceSink;
use tokio_util::sync::CancellationToken;

pub const EVENT_ID: &str = "ev-2026";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tix_ingest=debug")
        .with_test_writer()
        .try_init();
}

pub fn tenant(schema: &str) -> Tenant {
    Tenant {
        region: schema.to_string(),
        schema: schema.to_string(),
        event_id: EVENT_ID.to_string(),
        token: "test-token".to_string(),
        base_url: "http://localhost".to_string(),
    }
}

/// Small delays so tests stay fast
pub fn batch_config(batch_size: u64, max_workers: usize) -> BatchConfig {
    BatchConfig {
        batch_size,
        max_workers,
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        batch_timeout: Duration::from_secs(10),
        stop_on_failure: true,
    }
}

pub fn coupon(i: u64) -> RawItem {
    json!({
        "_id": format!("C{i}"),
        "code": format!("CODE{i}"),
        "name": "Early bird",
        "active": true,
        "used": i % 2,
        "couponSeriesId": "S1",
    })
}

/// What a page request at a given offset should do
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Fail this many times with a transient error, then succeed
    TransientThenOk(usize),
    AlwaysTransient,
    Permanent,
    /// Succeed, but the first item has no `_id`
    FirstInvalid,
}

/// In-memory coupons, `total` items long
pub struct StubSource {
    total: u64,
    latency: Duration,
    scripts: HashMap<u64, Script>,
    calls: Mutex<HashMap<u64, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_on_page: Option<CancellationToken>,
}

impl StubSource {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            latency: Duration::from_millis(20),
            scripts: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_on_page: None,
        }
    }

    /// Cancel `token` as soon as any page is requested
    pub fn with_cancel_on_page(mut self, token: CancellationToken) -> Self {
        self.cancel_on_page = Some(token);
        self
    }

    pub fn with_script(mut self, offset: u64, script: Script) -> Self {
        self.scripts.insert(offset, script);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Page requests seen at `offset`
    pub fn calls(&self, offset: u64) -> usize {
        self.calls.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn record_call(&self, offset: u64) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let n = calls.entry(offset).or_default();
        *n += 1;
        *n
    }
}

#[async_trait]
impl PagedSource for StubSource {
    async fn total(&self, _tenant: &Tenant) -> tix_ingest::Result<u64> {
        Ok(self.total)
    }

    async fn page(
        &self,
        _tenant: &Tenant,
        offset: u64,
        limit: u64,
    ) -> tix_ingest::Result<Vec<RawItem>> {
        if let Some(token) = &self.cancel_on_page {
            token.cancel();
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let call = self.record_call(offset);
        match self.scripts.get(&offset) {
            Some(Script::TransientThenOk(n)) if call <= *n => {
                return Err(IngestError::Status {
                    status: 503,
                    url: format!("stub?skip={offset}"),
                })
            },
            Some(Script::AlwaysTransient) => {
                return Err(IngestError::transient("connection reset"))
            },
            Some(Script::Permanent) => {
                return Err(IngestError::Status {
                    status: 404,
                    url: format!("stub?skip={offset}"),
                })
            },
            _ => {},
        }

        let end = (offset + limit).min(self.total);
        let mut items: Vec<RawItem> = (offset..end).map(coupon).collect();
        if let (Some(Script::FirstInvalid), Some(first)) = (self.scripts.get(&offset), items.first_mut()) {
            *first = json!({ "code": "NOID" });
        }
        Ok(items)
    }
}

/// Sink that keeps committed rows in memory
#[derive(Default)]
pub struct RecordingSink {
    committed: Mutex<Vec<String>>,
    fail_batches: Vec<usize>,
}

impl RecordingSink {
    pub fn failing(batch_ids: &[usize]) -> Self {
        Self {
            committed: Mutex::new(Vec::new()),
            fail_batches: batch_ids.to_vec(),
        }
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn commit(
        &self,
        _tenant: &Tenant,
        batch_id: usize,
        _spec: &'static UpsertSpec,
        batch: &TransformOutcome,
    ) -> tix_ingest::Result<(u64, u64)> {
        if self.fail_batches.contains(&batch_id) {
            return Err(IngestError::permanent("duplicate key value violates unique constraint"));
        }
        self.committed
            .lock()
            .unwrap()
            .extend(batch.rows.iter().map(|r| r.id.clone()));
        Ok((batch.rows.len() as u64, batch.rejected))
    }
}

/// PostgreSQL container with a connected pool
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    url: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
            url,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
