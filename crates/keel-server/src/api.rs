//! Request handlers

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use keel_core::{PartitionKey, PartitionStatus, PartitionType, SignalEnvelope};
use keel_ledger::{
    FrameView, IngestReceipt, PartitionDetail, PartitionDiff, PartitionFilter, PartitionSummary,
};
use keel_storage::{Manifest, ReconcileResult, SegmentId, SegmentMeta};

use crate::AppState;
use crate::error::{ServerError, ServerResult};

/// `?status=&type=` on the partition list
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> ServerResult<PartitionFilter> {
        Ok(PartitionFilter {
            status: self
                .status
                .as_deref()
                .map(str::parse::<PartitionStatus>)
                .transpose()?,
            kind: self
                .kind
                .as_deref()
                .map(str::parse::<PartitionType>)
                .transpose()?,
        })
    }
}

/// `?type=` on single-partition routes; MAIN when absent
#[derive(Debug, Default, Deserialize)]
pub struct TypeQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl TypeQuery {
    fn key(&self, date: &str) -> ServerResult<PartitionKey> {
        let date = PartitionKey::parse_date(date)?;
        let kind = match self.kind.as_deref() {
            Some(kind) => kind.parse::<PartitionType>()?,
            None => PartitionType::Main,
        };
        Ok(PartitionKey::new(date, kind))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `POST /ingest`: 200 when accepted, 409 when the id is already in the
/// ledger. Both carry the same receipt body.
pub async fn ingest(
    State(state): State<AppState>,
    body: Result<Json<SignalEnvelope>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<IngestReceipt>)> {
    let Json(envelope) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let receipt = state.ledger.ingest(envelope).await?;
    let status = if receipt.is_duplicate() {
        debug!(ack_id = %receipt.ack_id, "Duplicate ingest");
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

pub async fn list_partitions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ServerResult<Json<Vec<PartitionSummary>>> {
    let filter = query.filter()?;
    Ok(Json(state.ledger.list_partitions(filter).await))
}

pub async fn partition_detail(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<PartitionDetail>> {
    let key = query.key(&date)?;
    Ok(Json(state.ledger.partition_detail(&key).await?))
}

pub async fn diff(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<PartitionDiff>> {
    let key = query.key(&date)?;
    Ok(Json(state.ledger.diff(&key).await?))
}

/// Runs to completion unless the server begins shutting down, in which
/// case the run ends `Partial`.
pub async fn reconcile(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<ReconcileResult>> {
    let key = query.key(&date)?;
    let result = state
        .ledger
        .reconcile_with_cancel(&key, state.shutdown.child_token())
        .await?;
    Ok(Json(result))
}

pub async fn seal(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<Manifest>> {
    let key = query.key(&date)?;
    let manifest = state.ledger.seal(&key).await?;
    info!(partition = %key, revision = manifest.revision, "Sealed via API");
    Ok(Json(manifest))
}

pub async fn segments(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<Vec<SegmentMeta>>> {
    let key = query.key(&date)?;
    Ok(Json(state.ledger.segments(&key).await?))
}

/// Segment given either as an ordinal (`1`, `000001`) or a full id
/// (`2026-01-28.main.000001`); a full id must belong to the partition.
fn segment_id(key: PartitionKey, segment: &str) -> ServerResult<SegmentId> {
    if let Ok(ordinal) = segment.parse::<u32>() {
        return Ok(SegmentId::new(key, ordinal));
    }
    let id: SegmentId = segment.parse()?;
    if id.partition != key {
        return Err(keel_ledger::LedgerError::SegmentNotFound(id).into());
    }
    Ok(id)
}

pub async fn frame(
    State(state): State<AppState>,
    Path((date, segment, index)): Path<(String, String, u64)>,
    Query(query): Query<TypeQuery>,
) -> ServerResult<Json<FrameView>> {
    let key = query.key(&date)?;
    let id = segment_id(key, &segment)?;
    Ok(Json(state.ledger.frame(&id, index).await?))
}
