//! Tix Ingest - ticketing data ingestion

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tix_common::logging::{init_logging, LogConfig, LogLevel};
use tix_ingest::aggregation::PostgresAggregator;
use tix_ingest::config::IngestConfig;
use tix_ingest::pipeline::{PipelineOptions, TenantPipeline};
use tix_ingest::sink::{postgres::create_pool, PostgresSink};
use tix_ingest::source::{Resource, TicketApi};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tix-ingest")]
#[command(author, version, about = "Ingest ticketing data into per-tenant Postgres schemas")]
struct Cli {
    /// Tenant region to run (repeatable); all configured tenants by default
    #[arg(short, long = "tenant")]
    tenants: Vec<String>,

    /// Resource to ingest
    #[arg(short, long, value_enum, default_value_t = ResourceArg::All)]
    resource: ResourceArg,

    /// Only recompute summary tables from stored data
    #[arg(long)]
    skip_fetch: bool,

    /// Re-run failed batches in explicit retry passes
    #[arg(long)]
    retry_failed: bool,

    /// Keep dispatching chunks after a batch failed
    #[arg(long)]
    no_stop_on_failure: bool,

    /// Items per batch (overrides BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<u64>,

    /// Concurrent batch tasks (overrides BATCH_MAX_WORKERS)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Write the JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResourceArg {
    Tickets,
    Coupons,
    All,
}

impl ResourceArg {
    fn resources(self) -> Vec<Resource> {
        match self {
            Self::Tickets => vec![Resource::Tickets],
            Self::Coupons => vec![Resource::Coupons],
            Self::All => Resource::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if std::env::var("LOG_FILE_PREFIX").is_err() {
        log_config.log_file_prefix = "tix-ingest".to_string();
    }
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        },
    };

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Ingestion failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Returns whether every batch of every tenant completed.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = IngestConfig::load().context("Failed to load configuration")?;
    if let Some(batch_size) = cli.batch_size {
        config.batch.batch_size = batch_size;
    }
    if let Some(max_workers) = cli.max_workers {
        config.batch.max_workers = max_workers;
    }
    if cli.no_stop_on_failure {
        config.batch.stop_on_failure = false;
    }
    config.validate().context("Invalid configuration")?;

    let tenants = config
        .select_tenants(&cli.tenants)
        .context("Failed to select tenants")?;

    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    let api = TicketApi::new(&config.http).context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight batches");
            signal.cancel();
        }
    });

    let options = PipelineOptions {
        resources: cli.resource.resources(),
        skip_fetch: cli.skip_fetch,
        retry_failed: cli.retry_failed,
    };
    info!(
        tenants = tenants.len(),
        resources = ?options.resources,
        batch = ?config.batch,
        "Starting ingestion"
    );

    let pipeline = TenantPipeline::new(
        api,
        PostgresSink::new(pool.clone()),
        Arc::new(PostgresAggregator::new(pool.clone())),
        config.batch.clone(),
        options,
    )
    .with_cancellation(cancel);

    let summary = pipeline.run_all(&tenants).await;

    if let Some(path) = &cli.report {
        summary
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    for tenant in summary.failed_tenants() {
        warn!(tenant = %tenant.tenant, error = ?tenant.error, "Tenant incomplete");
    }

    pool.close().await;
    Ok(summary.is_success())
}
