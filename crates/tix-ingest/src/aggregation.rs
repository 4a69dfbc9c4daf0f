//! Summary tables derived from ingested tickets
//!
//! Recomputed after a run that persisted at least one row. Both tables are
//! rebuilt in a single transaction per tenant: rows are upserted with the
//! current `run_id` and rows left over from earlier runs are removed, so a
//! ticket type that disappeared upstream does not linger.

use crate::config::{validate_schema_name, Tenant};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::BTreeMap;
use tracing::{info, instrument};
use uuid::Uuid;

/// Row counts written by one recompute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub ticket_types: u64,
    pub age_group_rows: u64,
}

#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn recompute_summaries(&self, tenant: &Tenant, run_id: Uuid) -> Result<AggregationSummary>;
}

/// Inclusive age band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeBand {
    pub label: &'static str,
    pub min: i64,
    pub max: i64,
}

const fn band(label: &'static str, min: i64, max: i64) -> AgeBand {
    AgeBand { label, min, max }
}

pub const INCOMPLETE: &str = "Incomplete";
pub const TOTAL: &str = "Total";

pub const SINGLE_BANDS: &[AgeBand] = &[
    band("U24", 0, 24),
    band("25-29", 25, 29),
    band("30-34", 30, 34),
    band("35-39", 35, 39),
    band("40-44", 40, 44),
    band("45-49", 45, 49),
    band("50-54", 50, 54),
    band("55-59", 55, 59),
    band("60-64", 60, 64),
    band("65-69", 65, 69),
    band("70+", 70, 999),
];

pub const DOUBLE_BANDS: &[AgeBand] = &[
    band("U29", 0, 29),
    band("30-39", 30, 39),
    band("40-49", 40, 49),
    band("50-59", 50, 59),
    band("60-69", 60, 69),
    band("70+", 70, 999),
];

pub const RELAY_BANDS: &[AgeBand] = &[band("U40", 0, 39), band("40+", 40, 999)];

/// Age bands for a ticket category; anything unknown uses the single bands.
pub fn bands_for(category: &str) -> &'static [AgeBand] {
    match category {
        "double" => DOUBLE_BANDS,
        "relay" => RELAY_BANDS,
        _ => SINGLE_BANDS,
    }
}

/// Label of the band containing `age`, or [`INCOMPLETE`] when the age is
/// unknown or outside every band.
pub fn age_range(category: &str, age: Option<i64>) -> &'static str {
    age.and_then(|age| {
        bands_for(category)
            .iter()
            .find(|b| (b.min..=b.max).contains(&age))
    })
    .map_or(INCOMPLETE, |b| b.label)
}

/// Grouped ticket count as read back from the tickets table
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AgeCount {
    pub ticket_name: String,
    pub ticket_category: Option<String>,
    pub age: Option<i64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeGroupRow {
    pub ticket_group: String,
    pub age_range: &'static str,
    pub ticket_category: Option<String>,
    pub count: i64,
}

/// Bucket grouped counts into one row per band (zeros included), one
/// [`INCOMPLETE`] row and one [`TOTAL`] row per ticket group.
pub fn bucket_ages(counts: &[AgeCount]) -> Vec<AgeGroupRow> {
    let mut groups: BTreeMap<&str, (Option<&str>, BTreeMap<&'static str, i64>)> = BTreeMap::new();

    for c in counts {
        let category = c.ticket_category.as_deref();
        let (_, ranges) = groups
            .entry(c.ticket_name.as_str())
            .or_insert_with(|| (category, BTreeMap::new()));
        let label = age_range(category.unwrap_or_default(), c.age);
        *ranges.entry(label).or_default() += c.count;
    }

    let mut rows = Vec::new();
    for (group, (category, ranges)) in groups {
        let labels = bands_for(category.unwrap_or_default())
            .iter()
            .map(|b| b.label)
            .chain([INCOMPLETE]);
        let mut total = 0;
        for label in labels {
            let count = ranges.get(label).copied().unwrap_or(0);
            total += count;
            rows.push(AgeGroupRow {
                ticket_group: group.to_string(),
                age_range: label,
                ticket_category: category.map(str::to_string),
                count,
            });
        }
        rows.push(AgeGroupRow {
            ticket_group: group.to_string(),
            age_range: TOTAL,
            ticket_category: category.map(str::to_string),
            count: total,
        });
    }
    rows
}

#[derive(Debug, Clone)]
pub struct PostgresAggregator {
    pool: PgPool,
}

impl PostgresAggregator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Aggregator for PostgresAggregator {
    #[instrument(skip(self, tenant), fields(schema = %tenant.schema))]
    async fn recompute_summaries(&self, tenant: &Tenant, run_id: Uuid) -> Result<AggregationSummary> {
        validate_schema_name(&tenant.schema)?;
        let schema = tenant.schema.as_str();

        let mut tx = self.pool.begin().await?;
        let ticket_types = ticket_type_summary(&mut tx, schema, run_id).await?;
        let age_group_rows = ticket_age_groups(&mut tx, schema, run_id).await?;
        tx.commit().await?;

        let summary = AggregationSummary {
            ticket_types,
            age_group_rows,
        };
        info!(
            ticket_types = summary.ticket_types,
            age_group_rows = summary.age_group_rows,
            "Summaries recomputed"
        );
        Ok(summary)
    }
}

async fn ticket_type_summary(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    run_id: Uuid,
) -> Result<u64> {
    let upserted = sqlx::query(&format!(
        r#"INSERT INTO "{schema}".ticket_type_summary
            (id, region_schema, event_id, event_name, ticket_type_id, ticket_name,
             ticket_category, total_count, run_id, updated_at)
        SELECT t.event_id || '_' || t.ticket_type_id, $1, t.event_id, max(e.name),
               t.ticket_type_id, max(t.ticket_name), max(t.ticket_category), count(*), $2, now()
        FROM "{schema}".tickets t
        LEFT JOIN "{schema}".events e
            ON e.id = t.event_id AND e.region_schema = t.region_schema
        WHERE t.region_schema = $1
            AND t.event_id IS NOT NULL
            AND t.ticket_type_id IS NOT NULL
        GROUP BY t.event_id, t.ticket_type_id
        ON CONFLICT (id, region_schema) DO UPDATE SET
            event_id = EXCLUDED.event_id,
            event_name = EXCLUDED.event_name,
            ticket_type_id = EXCLUDED.ticket_type_id,
            ticket_name = EXCLUDED.ticket_name,
            ticket_category = EXCLUDED.ticket_category,
            total_count = EXCLUDED.total_count,
            run_id = EXCLUDED.run_id,
            updated_at = now()"#
    ))
    .bind(schema)
    .bind(run_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    sqlx::query(&format!(
        r#"DELETE FROM "{schema}".ticket_type_summary
        WHERE region_schema = $1 AND run_id IS DISTINCT FROM $2"#
    ))
    .bind(schema)
    .bind(run_id)
    .execute(&mut **tx)
    .await?;

    Ok(upserted)
}

async fn ticket_age_groups(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    run_id: Uuid,
) -> Result<u64> {
    let counts: Vec<AgeCount> = sqlx::query_as(&format!(
        r#"SELECT ticket_name, max(ticket_category) AS ticket_category, age, count(*) AS count
        FROM "{schema}".tickets
        WHERE region_schema = $1 AND ticket_name IS NOT NULL
        GROUP BY ticket_name, age"#
    ))
    .bind(schema)
    .fetch_all(&mut **tx)
    .await?;

    let rows = bucket_ages(&counts);
    let mut written = 0;
    for chunk in rows.chunks(500) {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            r#"INSERT INTO "{schema}".ticket_age_groups
                (ticket_group, age_range, region_schema, ticket_category, count, run_id, updated_at) "#
        ));
        query_builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.ticket_group.clone())
                .push_bind(row.age_range)
                .push_bind(schema.to_string())
                .push_bind(row.ticket_category.clone())
                .push_bind(row.count)
                .push_bind(run_id)
                .push("now()");
        });
        query_builder.push(
            " ON CONFLICT (ticket_group, age_range, region_schema) DO UPDATE SET \
             ticket_category = EXCLUDED.ticket_category, count = EXCLUDED.count, \
             run_id = EXCLUDED.run_id, updated_at = now()",
        );
        written += query_builder.build().execute(&mut **tx).await?.rows_affected();
    }

    sqlx::query(&format!(
        r#"DELETE FROM "{schema}".ticket_age_groups
        WHERE region_schema = $1 AND run_id IS DISTINCT FROM $2"#
    ))
    .bind(schema)
    .bind(run_id)
    .execute(&mut **tx)
    .await?;

    Ok(written)
}
