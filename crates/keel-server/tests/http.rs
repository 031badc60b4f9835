//! HTTP surface tests driven through the router without a socket

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use keel_core::{ManualClock, MockDownstream, PartitionKey, SignalId};
use keel_ledger::{Ledger, LedgerConfig};
use keel_server::{AppState, router};

struct Harness {
    app: Router,
    downstream: Arc<MockDownstream>,
}

async fn harness() -> Harness {
    keel_logging::init_testing();

    let mut config = LedgerConfig::default();
    config.propagate_on_ingest = false;
    config.reconcile.retry_backoff_ms = 1;

    let downstream = Arc::new(MockDownstream::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 28, 12, 0, 0).unwrap(),
    ));
    let ledger = Ledger::in_memory(config, downstream.clone(), clock)
        .await
        .unwrap();

    Harness {
        app: router(AppState::new(Arc::new(ledger), CancellationToken::new())),
        downstream,
    }
}

fn envelope(id: &str) -> Value {
    json!({
        "signal_id": id,
        "source_event_id": "evt-1",
        "category": "anomaly",
        "probability": 0.8,
        "confidence_score": 0.6,
        "trace_id": "trace-1",
        "generated_at": "2026-01-28T09:30:00Z",
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn ingest(app: &Router, id: &str) -> (StatusCode, Value) {
    send(app, Method::POST, "/ingest", Some(envelope(id))).await
}

#[tokio::test]
async fn test_health() {
    let h = harness().await;
    let (status, body) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_accepted_then_duplicate() {
    let h = harness().await;

    let (status, first) = ingest(&h.app, "sig-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "accepted");
    assert_eq!(first["sequence"], 1);
    assert!(first["ack_id"].as_str().unwrap().starts_with("ack_"));

    let (status, second) = ingest(&h.app, "sig-1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["ack_id"], first["ack_id"]);

    let (_, detail) = send(&h.app, Method::GET, "/partitions/2026-01-28", None).await;
    assert_eq!(detail["record_count"], 1);
}

#[tokio::test]
async fn test_ingest_rejects_bad_input() {
    let h = harness().await;

    let mut out_of_range = envelope("sig-1");
    out_of_range["probability"] = json!(1.5);
    let (status, body) = send(&h.app, Method::POST, "/ingest", Some(out_of_range)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("probability"));

    let (status, _) = send(&h.app, Method::POST, "/ingest", Some(envelope(""))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, Method::POST, "/ingest", Some(json!({"signal_id": 7}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was opened by the rejected requests
    let (_, list) = send(&h.app, Method::GET, "/partitions", None).await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_partition_listing_and_lookup() {
    let h = harness().await;
    ingest(&h.app, "sig-1").await;

    let (status, list) = send(&h.app, Method::GET, "/partitions?status=open&type=main", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["type"], "MAIN");
    assert_eq!(list[0]["status"], "OPEN");

    let (_, sealed) = send(&h.app, Method::GET, "/partitions?status=sealed", None).await;
    assert!(sealed.as_array().unwrap().is_empty());

    let (status, _) = send(&h.app, Method::GET, "/partitions?status=closed", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, Method::GET, "/partitions/2026-01-27", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.app, Method::GET, "/partitions/yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, Method::GET, "/partitions/2026-01-28?type=weekly", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_diff_and_reconcile() {
    let h = harness().await;
    for i in 1..=4 {
        ingest(&h.app, &format!("sig-{i}")).await;
    }
    let key: PartitionKey = "2026-01-28.main".parse().unwrap();
    h.downstream.acknowledge(&key, SignalId::new("sig-2"));

    let (status, diff) = send(&h.app, Method::GET, "/partitions/2026-01-28/diff", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(diff["missing_ids"], json!(["sig-1", "sig-3", "sig-4"]));

    let (status, result) =
        send(&h.app, Method::POST, "/partitions/2026-01-28/reconcile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "COMPLETED");
    assert_eq!(result["missing_before"], 3);
    assert_eq!(result["missing_count"], 0);
    assert_eq!(result["replayed_ids"], json!(["sig-1", "sig-3", "sig-4"]));

    let (_, detail) = send(&h.app, Method::GET, "/partitions/2026-01-28", None).await;
    assert_eq!(detail["latest_reconcile"]["run_id"], result["run_id"]);

    let (_, diff) = send(&h.app, Method::GET, "/partitions/2026-01-28/diff", None).await;
    assert_eq!(diff["missing_ids"], json!([]));
}

#[tokio::test]
async fn test_reconcile_unreachable_downstream() {
    let h = harness().await;
    ingest(&h.app, "sig-1").await;
    h.downstream.set_reachable(false);

    let (status, result) =
        send(&h.app, Method::POST, "/partitions/2026-01-28/reconcile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "FAILED");

    let (status, _) = send(&h.app, Method::GET, "/partitions/2026-01-28/diff", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_seal_and_late_routing() {
    let h = harness().await;
    ingest(&h.app, "sig-1").await;
    ingest(&h.app, "sig-2").await;

    let (status, manifest) = send(&h.app, Method::POST, "/partitions/2026-01-28/seal", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(manifest["revision"], 1);
    assert_eq!(manifest["total_records"], 2);
    assert_eq!(manifest["highwater_sequence"], 2);

    // Same day after sealing lands in LATE
    let (status, receipt) = ingest(&h.app, "sig-3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["partition"]["kind"], "LATE");

    let (status, _) =
        send(&h.app, Method::POST, "/partitions/2026-01-28/seal?type=late", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, detail) = send(&h.app, Method::GET, "/partitions/2026-01-28", None).await;
    assert_eq!(detail["status"], "SEALED");
    assert_eq!(detail["manifest"]["revision"], 1);

    // LATE is skipped by default
    let (_, result) =
        send(&h.app, Method::POST, "/partitions/2026-01-28/reconcile?type=late", None).await;
    assert_eq!(result["status"], "SKIPPED");
}

#[tokio::test]
async fn test_segments_and_frames() {
    let h = harness().await;
    ingest(&h.app, "sig-1").await;
    ingest(&h.app, "sig-2").await;

    let (status, segments) =
        send(&h.app, Method::GET, "/partitions/2026-01-28/segments", None).await;
    assert_eq!(status, StatusCode::OK);
    let segments = segments.as_array().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0]["id"], "2026-01-28.main.000001");
    assert_eq!(segments[0]["record_count"], 2);

    let (status, frame) = send(
        &h.app,
        Method::GET,
        "/partitions/2026-01-28/segments/000001/frames/1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frame["crc_ok"], true);
    assert_eq!(frame["record"]["sequence"], 2);
    assert_eq!(frame["record"]["envelope"]["signal_id"], "sig-2");
    assert_eq!(frame["decode_error"], Value::Null);

    let (status, by_id) = send(
        &h.app,
        Method::GET,
        "/partitions/2026-01-28/segments/2026-01-28.main.000001/frames/0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_id["offset"], 0);

    let (status, _) = send(
        &h.app,
        Method::GET,
        "/partitions/2026-01-28/segments/1/frames/9",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &h.app,
        Method::GET,
        "/partitions/2026-01-28/segments/7/frames/0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
