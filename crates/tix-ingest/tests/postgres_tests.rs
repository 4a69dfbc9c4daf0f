//! Postgres sink, aggregation and full tenant pipeline against a real database
//!
//! Requires Docker. Run with `cargo test --test postgres_tests -- --ignored`.

mod common;

use chrono::NaiveDate;
use common::{init_tracing, tenant, TestPostgres, EVENT_ID};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tix_ingest::aggregation::{Aggregator, PostgresAggregator};
use tix_ingest::config::{HttpConfig, Tenant};
use tix_ingest::pipeline::{PipelineOptions, TenantPipeline};
use tix_ingest::report::AggregationOutcome;
use tix_ingest::sink::{PersistenceSink, PostgresSink};
use tix_ingest::source::{Resource, TicketApi};
use tix_ingest::transform::{
    transform_all, ColumnValue, CouponTransform, RecordTransform, TicketTransform, UpsertRow,
    COUPONS, TICKETS,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

fn coupon_row(t: &Tenant, id: &str, name: &str) -> UpsertRow {
    CouponTransform
        .transform(t, &json!({"_id": id, "code": "CODE", "name": name, "used": 0}))
        .unwrap()
}

fn ticket(id: &str, name: &str, type_id: &str, birth_date: Option<&str>) -> serde_json::Value {
    let mut raw = json!({
        "_id": id,
        "eventId": EVENT_ID,
        "ticketName": name,
        "ticketTypeId": type_id,
        "status": "VALID",
        "createdAt": "2026-03-01T09:00:00Z",
        "extraFields": { "gender": "Male" }
    });
    if let Some(date) = birth_date {
        raw["extraFields"]["birth_date"] = json!(date);
    }
    raw
}

async fn count(pg: &TestPostgres, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pg.pool()).await.unwrap()
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_replayed_batch_converges() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = tenant("emea");
    sink.ensure_schema(&t).await.unwrap();
    // Bootstrapping twice is harmless
    sink.ensure_schema(&t).await.unwrap();

    let batch = tix_ingest::transform::TransformOutcome {
        rows: vec![coupon_row(&t, "T1", "A")],
        rejected: 0,
    };
    for _ in 0..2 {
        let (processed, failed) = sink.commit(&t, 0, &COUPONS, &batch).await.unwrap();
        assert_eq!((processed, failed), (1, 0));
    }

    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT id, name FROM emea.coupons WHERE region_schema = 'emea'")
            .fetch_all(pg.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![("T1".to_string(), Some("A".to_string()))]);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_upsert_overwrites_and_dedupes_within_batch() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = tenant("emea");
    sink.ensure_schema(&t).await.unwrap();

    sink.upsert(&t, &COUPONS, &[coupon_row(&t, "C1", "old")]).await.unwrap();
    let written = sink
        .upsert(
            &t,
            &COUPONS,
            &[coupon_row(&t, "C1", "first"), coupon_row(&t, "C2", "x"), coupon_row(&t, "C1", "last")],
        )
        .await
        .unwrap();
    assert_eq!(written, 2);

    let name: Option<String> = sqlx::query_scalar("SELECT name FROM emea.coupons WHERE id = 'C1'")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("last"));
    assert_eq!(count(&pg, "SELECT count(*) FROM emea.coupons").await, 2);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_storage_error_rolls_back_whole_batch() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = tenant("emea");
    sink.ensure_schema(&t).await.unwrap();

    // 600 rows span two statements; the bad row sits in the second one
    let mut rows: Vec<UpsertRow> = (0..600)
        .map(|i| coupon_row(&t, &format!("C{i}"), "ok"))
        .collect();
    let used = COUPONS.columns.iter().position(|c| *c == "used").unwrap();
    rows[550].values[used] = ColumnValue::Text(Some("not a number".to_string()));

    let batch = tix_ingest::transform::TransformOutcome { rows, rejected: 0 };
    let err = sink.commit(&t, 0, &COUPONS, &batch).await.unwrap_err();
    assert!(!err.is_transient());

    assert_eq!(count(&pg, "SELECT count(*) FROM emea.coupons").await, 0);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_invalid_schema_name_is_rejected() {
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = Tenant {
        schema: "emea; DROP SCHEMA public".to_string(),
        ..tenant("emea")
    };
    assert!(sink.ensure_schema(&t).await.is_err());
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_recompute_summaries() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = tenant("apac");
    sink.ensure_schema(&t).await.unwrap();

    let transform = TicketTransform::as_of(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());
    let items = vec![
        ticket("T1", "HYROX Men", "tt-1", Some("2000-01-01")),
        ticket("T2", "HYROX Men", "tt-1", Some("1980-01-01")),
        ticket("T3", "HYROX Men", "tt-1", None),
        ticket("T4", "HYROX Relay", "tt-2", Some("1990-01-01")),
    ];
    let outcome = transform_all(&transform, &t, &items);
    assert_eq!(outcome.rejected, 0);
    sink.upsert(&t, &TICKETS, &outcome.rows).await.unwrap();

    let aggregator = PostgresAggregator::new(pg.pool().clone());
    let first_run = Uuid::new_v4();
    let summary = aggregator.recompute_summaries(&t, first_run).await.unwrap();
    assert_eq!(summary.ticket_types, 2);

    let total: i64 = sqlx::query_scalar(
        "SELECT total_count FROM apac.ticket_type_summary WHERE id = $1",
    )
    .bind(format!("{EVENT_ID}_tt-1"))
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(total, 3);

    let ranges: Vec<(String, i64)> = sqlx::query_as(
        "SELECT age_range, count FROM apac.ticket_age_groups
         WHERE ticket_group = 'HYROX Men' AND count > 0 ORDER BY age_range",
    )
    .fetch_all(pg.pool())
    .await
    .unwrap();
    assert_eq!(
        ranges,
        vec![
            ("25-29".to_string(), 1),
            ("45-49".to_string(), 1),
            ("Incomplete".to_string(), 1),
            ("Total".to_string(), 3),
        ]
    );

    let relay_total: i64 = sqlx::query_scalar(
        "SELECT count FROM apac.ticket_age_groups WHERE ticket_group = 'HYROX Relay' AND age_range = 'U40'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(relay_total, 1);

    // A ticket type that disappeared is dropped on the next recompute
    sqlx::query("DELETE FROM apac.tickets WHERE ticket_type_id = 'tt-2'")
        .execute(pg.pool())
        .await
        .unwrap();
    aggregator.recompute_summaries(&t, Uuid::new_v4()).await.unwrap();
    assert_eq!(count(&pg, "SELECT count(*) FROM apac.ticket_type_summary").await, 1);
    assert_eq!(
        count(&pg, "SELECT count(*) FROM apac.ticket_age_groups WHERE ticket_group = 'HYROX Relay'").await,
        0
    );
}

/// Serve `rows` as a paged resource honouring `skip` and `top`
async fn mount_resource(server: &MockServer, route: &str, rows: Vec<serde_json::Value>) {
    mount_resource_with(server, route, rows, |_| {}).await;
}

/// Like [`mount_resource`], calling `on_page` for every request first
async fn mount_resource_with<F>(
    server: &MockServer,
    route: &str,
    rows: Vec<serde_json::Value>,
    on_page: F,
) where
    F: Fn(&Request) + Send + Sync + 'static,
{
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(move |request: &Request| {
            on_page(request);
            let param = |name: &str| {
                request
                    .url
                    .query_pairs()
                    .find(|(key, _)| key == name)
                    .and_then(|(_, value)| value.parse::<usize>().ok())
            };
            let skip = param("skip").unwrap_or(0);
            let top = param("top").unwrap_or(rows.len());
            let page: Vec<_> = rows.iter().skip(skip).take(top).cloned().collect();
            ResponseTemplate::new(200).set_body_json(json!({ "rows": page, "total": rows.len() }))
        })
        .mount(server)
        .await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_tenant_pipeline_end_to_end() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{
                "_id": EVENT_ID,
                "name": "City Marathon 2026",
                "start": "2026-09-12T07:00:00Z",
                "tickets": [{"_id": "tt-1", "name": "HYROX Men", "price": 99}]
            }],
            "total": 1
        })))
        .mount(&server)
        .await;
    mount_resource(
        &server,
        "/tickets",
        vec![
            ticket("T1", "HYROX Men", "tt-1", Some("1995-05-05")),
            ticket("T2", "HYROX Men", "tt-1", None),
            // Wrong event: skipped and counted
            json!({"_id": "T3", "eventId": "elsewhere", "ticketName": "HYROX Men"}),
        ],
    )
    .await;
    mount_resource(
        &server,
        "/coupon/rich",
        vec![json!({"_id": "C1", "code": "A", "used": 2}), json!({"_id": "C2", "code": "B"})],
    )
    .await;

    let t = Tenant {
        base_url: server.uri(),
        ..tenant("emea")
    };
    let api = TicketApi::new(&HttpConfig {
        request_delay: Duration::ZERO,
        ..HttpConfig::default()
    })
    .unwrap();
    let pipeline = TenantPipeline::new(
        api,
        PostgresSink::new(pg.pool().clone()),
        Arc::new(PostgresAggregator::new(pg.pool().clone())),
        common::batch_config(2, 2),
        PipelineOptions::default(),
    );

    let report = pipeline.run_tenant(&t, Uuid::new_v4()).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.resources.len(), 2);
    let tickets = &report.resources[0];
    assert_eq!(tickets.planned_batches, 2);
    assert_eq!(tickets.stats.total_failed, 1);
    assert!(matches!(report.aggregation, AggregationOutcome::Completed(_)));

    assert_eq!(count(&pg, "SELECT count(*) FROM emea.events").await, 1);
    assert_eq!(count(&pg, "SELECT count(*) FROM emea.coupons WHERE is_used").await, 1);
    assert_eq!(
        count(&pg, "SELECT total_count FROM emea.ticket_type_summary").await,
        2
    );
    let event_name: Option<String> =
        sqlx::query_scalar("SELECT event_name FROM emea.ticket_type_summary")
            .fetch_one(pg.pool())
            .await
            .unwrap();
    assert_eq!(event_name.as_deref(), Some("City Marathon 2026"));
}

async fn mount_event(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{ "_id": EVENT_ID, "name": "City Marathon 2026" }],
            "total": 1
        })))
        .mount(server)
        .await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_cancel_between_resources_fails_tenant() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let server = MockServer::start().await;
    let cancel = CancellationToken::new();

    mount_event(&server).await;
    // Interrupt arrives while the only ticket chunk is in flight
    let trip = cancel.clone();
    mount_resource_with(
        &server,
        "/tickets",
        vec![ticket("T1", "HYROX Men", "tt-1", None), ticket("T2", "HYROX Men", "tt-1", None)],
        move |request| {
            if request.url.query_pairs().any(|(k, v)| k == "top" && v != "1") {
                trip.cancel();
            }
        },
    )
    .await;
    mount_resource(&server, "/coupon/rich", vec![json!({"_id": "C1", "code": "A"})]).await;

    let t = Tenant {
        base_url: server.uri(),
        ..tenant("emea")
    };
    let api = TicketApi::new(&HttpConfig {
        request_delay: Duration::ZERO,
        ..HttpConfig::default()
    })
    .unwrap();
    let pipeline = TenantPipeline::new(
        api,
        PostgresSink::new(pg.pool().clone()),
        Arc::new(PostgresAggregator::new(pg.pool().clone())),
        common::batch_config(10, 2),
        PipelineOptions::default(),
    )
    .with_cancellation(cancel);

    let summary = pipeline.run_all(&[t]).await;
    let report = &summary.tenants[0];

    assert_eq!(report.resources.len(), 1);
    assert!(report.resources[0].is_success());
    assert_eq!(report.cancelled_resources, vec![Resource::Coupons]);
    assert!(matches!(report.aggregation, AggregationOutcome::Skipped { .. }));
    assert!(!report.is_success());
    assert!(!summary.is_success());

    assert_eq!(count(&pg, "SELECT count(*) FROM emea.tickets").await, 2);
    assert_eq!(count(&pg, "SELECT count(*) FROM emea.coupons").await, 0);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_commit_counts_duplicate_ids_once() {
    init_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let sink = PostgresSink::new(pg.pool().clone());
    let t = tenant("emea");
    sink.ensure_schema(&t).await.unwrap();

    let batch = tix_ingest::transform::TransformOutcome {
        rows: vec![coupon_row(&t, "C1", "a"), coupon_row(&t, "C2", "b"), coupon_row(&t, "C1", "c")],
        rejected: 1,
    };
    let (processed, failed) = sink.commit(&t, 0, &COUPONS, &batch).await.unwrap();
    assert_eq!((processed, failed), (2, 1));
}
