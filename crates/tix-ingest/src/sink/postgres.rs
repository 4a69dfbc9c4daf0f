//! PostgreSQL persistence
//!
//! Each tenant owns a schema holding the same set of tables. Every write is
//! a multi-row `INSERT ... ON CONFLICT (id, region_schema) DO UPDATE`, split
//! into statements of at most [`MAX_ROWS_PER_STATEMENT`] rows to stay below
//! the bind-parameter limit.

use super::PersistenceSink;
use crate::config::{validate_schema_name, DatabaseConfig, Tenant};
use crate::error::Result;
use crate::transform::{ColumnValue, TransformOutcome, UpsertRow, UpsertSpec};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Rows per INSERT statement; 28 columns * 500 rows stays well under 65535 binds
pub const MAX_ROWS_PER_STATEMENT: usize = 500;

/// Connections idle longer than this are closed
const IDLE_TIMEOUT_SECS: u64 = 600;

/// Connections are recycled after this lifetime
const MAX_LIFETIME_SECS: u64 = 1800;

/// Create the shared pool for a run.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(Some(Duration::from_secs(IDLE_TIMEOUT_SECS)))
        .max_lifetime(Some(Duration::from_secs(MAX_LIFETIME_SECS)))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tenant schema and its tables if missing, adding columns
    /// that older tables lack. Existing data is never dropped.
    #[instrument(skip(self, tenant), fields(schema = %tenant.schema))]
    pub async fn ensure_schema(&self, tenant: &Tenant) -> Result<()> {
        validate_schema_name(&tenant.schema)?;
        let mut tx = self.pool.begin().await?;
        for statement in schema_ddl(&tenant.schema) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("Schema ready");
        Ok(())
    }

    /// Upsert `rows` into `spec.table` of the tenant schema in one
    /// transaction, returning the number of distinct rows written.
    pub async fn upsert(
        &self,
        tenant: &Tenant,
        spec: &'static UpsertSpec,
        rows: &[UpsertRow],
    ) -> Result<u64> {
        validate_schema_name(&tenant.schema)?;
        let rows = dedupe(rows);
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let written = write_rows(&mut tx, &tenant.schema, spec, &rows).await?;
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl PersistenceSink for PostgresSink {
    #[instrument(skip_all, fields(schema = %tenant.schema, table = spec.table, batch_id = batch_id))]
    async fn commit(
        &self,
        tenant: &Tenant,
        batch_id: usize,
        spec: &'static UpsertSpec,
        batch: &TransformOutcome,
    ) -> Result<(u64, u64)> {
        // Dropping the transaction on any error below rolls the batch back
        let written = self.upsert(tenant, spec, &batch.rows).await?;
        let duplicates = (batch.rows.len() as u64).saturating_sub(written);
        debug!(written, duplicates, rejected = batch.rejected, "Batch committed");
        // Repeated ids collapse into one row and count once
        Ok((written, batch.rejected))
    }
}

/// Keep only the last occurrence of each id, preserving order.
fn dedupe(rows: &[UpsertRow]) -> Vec<&UpsertRow> {
    let last: HashMap<&str, usize> = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| (row.id.as_str(), idx))
        .collect();
    rows.iter()
        .enumerate()
        .filter(|(idx, row)| last.get(row.id.as_str()) == Some(idx))
        .map(|(_, row)| row)
        .collect()
}

async fn write_rows(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    spec: &UpsertSpec,
    rows: &[&UpsertRow],
) -> Result<u64> {
    let mut written = 0;
    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
        let mut query_builder = upsert_statement(schema, spec, chunk);
        let result = query_builder.build().execute(&mut **tx).await?;
        written += result.rows_affected();
    }
    Ok(written)
}

fn upsert_statement<'args>(
    schema: &str,
    spec: &UpsertSpec,
    rows: &[&UpsertRow],
) -> QueryBuilder<'args, Postgres> {
    let mut query_builder = QueryBuilder::new(format!(
        "INSERT INTO \"{schema}\".{} ({}) ",
        spec.table,
        spec.columns.join(", ")
    ));

    query_builder.push_values(rows.iter(), |mut b, row| {
        for value in &row.values {
            match value {
                ColumnValue::Text(v) => b.push_bind(v.clone()),
                ColumnValue::Int(v) => b.push_bind(*v),
                ColumnValue::Bool(v) => b.push_bind(*v),
                ColumnValue::Timestamp(v) => b.push_bind(*v),
                ColumnValue::Json(v) => b.push_bind(v.clone().map(sqlx::types::Json)),
            };
        }
    });

    let updates: Vec<String> = spec
        .update_columns()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    query_builder.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {}, ingested_at = now()",
        spec.conflict_key.join(", "),
        updates.join(", ")
    ));
    query_builder
}

/// DDL for one tenant schema, one statement per entry
fn schema_ddl(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".events (
                id TEXT NOT NULL,
                region_schema TEXT NOT NULL,
                name TEXT,
                seller_id TEXT,
                location_name TEXT,
                start_date TIMESTAMPTZ,
                end_date TIMESTAMPTZ,
                sell_start TIMESTAMPTZ,
                sell_end TIMESTAMPTZ,
                timezone TEXT,
                groups JSONB,
                ticket_types JSONB,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, region_schema)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".tickets (
                id TEXT NOT NULL,
                region_schema TEXT NOT NULL,
                event_id TEXT,
                transaction_id TEXT,
                ticket_type_id TEXT,
                ticket_name TEXT,
                ticket_category TEXT,
                category_name TEXT,
                status TEXT,
                currency TEXT,
                personalized BOOLEAN,
                expired BOOLEAN,
                barcode TEXT,
                city TEXT,
                country TEXT,
                customer_id TEXT,
                gender TEXT,
                birthday TEXT,
                age BIGINT,
                nationality TEXT,
                region_of_residence TEXT,
                is_returning_athlete BOOLEAN,
                is_returning_athlete_to_city BOOLEAN,
                is_gym_affiliate TEXT,
                gym_affiliate TEXT,
                gym_affiliate_location TEXT,
                created_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, region_schema)
            )"#
        ),
        format!(
            r#"ALTER TABLE "{schema}".tickets
                ADD COLUMN IF NOT EXISTS is_gym_affiliate TEXT,
                ADD COLUMN IF NOT EXISTS gym_affiliate TEXT,
                ADD COLUMN IF NOT EXISTS gym_affiliate_location TEXT"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS tickets_event_type_idx
                ON "{schema}".tickets (event_id, ticket_type_id)"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".coupons (
                id TEXT NOT NULL,
                region_schema TEXT NOT NULL,
                code TEXT,
                name TEXT,
                active BOOLEAN,
                used BIGINT,
                is_used BOOLEAN,
                coupon_series_id TEXT,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, region_schema)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".ticket_type_summary (
                id TEXT NOT NULL,
                region_schema TEXT NOT NULL,
                event_id TEXT,
                event_name TEXT,
                ticket_type_id TEXT,
                ticket_name TEXT,
                ticket_category TEXT,
                total_count BIGINT NOT NULL,
                run_id UUID,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (id, region_schema)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".ticket_age_groups (
                ticket_group TEXT NOT NULL,
                age_range TEXT NOT NULL,
                region_schema TEXT NOT NULL,
                ticket_category TEXT,
                count BIGINT NOT NULL,
                run_id UUID,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (ticket_group, age_range, region_schema)
            )"#
        ),
    ]
}
