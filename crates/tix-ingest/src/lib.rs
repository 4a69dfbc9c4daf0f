//! Tix Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batched ingestion of ticketing data into per-tenant Postgres schemas.
//!
//! # Pipeline
//!
//! - **Planning**: [`planner::plan`] splits an upstream total into batches
//!   and chunks of batches
//! - **Coordination**: [`coordinator::BatchCoordinator`] runs one chunk at a
//!   time with bounded concurrency
//! - **Sources**: [`source::PagedSource`], implemented over HTTP by
//!   [`source::TicketApi`]
//! - **Persistence**: [`sink::PersistenceSink`], implemented by
//!   [`sink::PostgresSink`] as one upsert transaction per batch
//! - **Aggregation**: [`aggregation::Aggregator`] rebuilds the summary tables
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tix_ingest::aggregation::PostgresAggregator;
//! use tix_ingest::config::IngestConfig;
//! use tix_ingest::pipeline::{PipelineOptions, TenantPipeline};
//! use tix_ingest::sink::{postgres::create_pool, PostgresSink};
//! use tix_ingest::source::TicketApi;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let pool = create_pool(&config.database).await?;
//!     let pipeline = TenantPipeline::new(
//!         TicketApi::new(&config.http)?,
//!         PostgresSink::new(pool.clone()),
//!         Arc::new(PostgresAggregator::new(pool)),
//!         config.batch.clone(),
//!         PipelineOptions::default(),
//!     );
//!     let summary = pipeline.run_all(&config.tenants).await;
//!     println!("success: {}", summary.is_success());
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod report;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transform;

pub use coordinator::{BatchCoordinator, BatchRun};
pub use error::{IngestError, Result};
pub use pipeline::{PipelineOptions, TenantPipeline};
pub use progress::{BatchResult, BatchStatus, ProcessingStats, ProgressTracker};
