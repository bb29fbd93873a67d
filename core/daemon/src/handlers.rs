//! HTTP request handlers.
//!
//! Handlers stay thin: they extract the request, call into `SharedState` and
//! serialize the result. All state rules live in `state` and `reducer`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kinetic_scan_protocol::{
    ActionResponse, ErrorInfo, FrameAccepted, HistoryResponse, RecordListResponse,
    SaveResultResponse, StatusResponse, SERVICE_MODE, SERVICE_NAME,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::DaemonError;
use crate::state::SharedState;

/// Application state shared across all handlers.
pub struct AppState {
    pub shared: SharedState,
    pub shutdown_token: CancellationToken,
}

impl AppState {
    pub fn new(shared: SharedState) -> (Arc<Self>, CancellationToken) {
        let shutdown_token = CancellationToken::new();
        let state = Arc::new(Self {
            shared,
            shutdown_token: shutdown_token.clone(),
        });
        (state, shutdown_token)
    }
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "app": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Mobile-first spectrometry with on-device analysis",
        "endpoints": {
            "status": "/status",
            "health": "/health",
            "history": "/history",
            "records": "/records",
        },
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let persistence = state.shared.persist_metrics();
    let status = if persistence.degraded { "degraded" } else { "ok" };
    let mut data = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "mode": SERVICE_MODE,
        "scan_count": state.shared.scan_count(),
    });
    if let Ok(value) = serde_json::to_value(persistence) {
        data["persistence"] = value;
    }
    Json(data)
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.shared.status())
}

pub async fn latest_frame(State(state): State<Arc<AppState>>) -> Result<Response, DaemonError> {
    let frame = state.shared.latest_frame().ok_or(DaemonError::NoFrame)?;
    Ok((
        [
            (header::CONTENT_TYPE, frame.content_type().to_string()),
            (HeaderName::from_static("x-frame-seq"), frame.seq.to_string()),
            (HeaderName::from_static("x-frame-received-at"), frame.received_at),
        ],
        frame.bytes,
    )
        .into_response())
}

pub async fn receive_frame(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<FrameAccepted>, DaemonError> {
    state.shared.ingest_frame(body).await.map(Json)
}

pub async fn handle_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Result<Json<ActionResponse>, DaemonError> {
    state.shared.apply_action(&action).await.map(Json)
}

pub async fn save_result(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SaveResultResponse>, DaemonError> {
    state.shared.save_result(body).await.map(Json)
}

pub async fn history(State(state): State<Arc<AppState>>) -> Json<HistoryResponse> {
    Json(state.shared.history())
}

pub async fn list_records(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RecordListResponse>, DaemonError> {
    let records = state.shared.record_ids().await?;
    Ok(Json(RecordListResponse {
        count: records.len(),
        records,
    }))
}

/// Returns the stored bytes untouched so clients get exactly what was saved.
pub async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Response, DaemonError> {
    let payload = state.shared.record(scan_id).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], payload).into_response())
}

pub async fn not_found() -> (StatusCode, Json<ErrorInfo>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorInfo::new("not_found", "Not Found")),
    )
}
