use crate::session::IngestDiagnostics;
use crate::summary::RequestSummary;
use crate::types::*;
use crate::AppState;
use axum::{
    extract::{Path, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub session_id: SessionId,
    pub requests: Vec<RequestSummary>,
    pub total_requests: usize,
    pub diagnostics: IngestDiagnostics,
}

#[derive(Debug, Serialize)]
pub struct RequestListResponse {
    pub requests: Vec<RequestSummary>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/logs/upload", post(upload_log))
        .route("/api/logs/:session_id/requests", get(list_requests))
        .route("/api/logs/:session_id/requests/:req_id", get(get_request))
        .route("/health", get(crate::health::liveness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(crate::logging::request_id_middleware))
        .with_state(state)
}

/// The request body is the log file itself.
pub async fn upload_log(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<UploadResponse>> {
    if body.is_empty() {
        return Err(RetraceError::InvalidUpload("No file uploaded".into()).into());
    }

    let engine = state.engine.clone();
    let (session_id, diagnostics) =
        tokio::task::spawn_blocking(move || engine.create_session(&body))
            .await
            .map_err(|e| RetraceError::Internal(format!("Failed to parse log file: {}", e)))?;

    let requests = state.engine.list_summaries(session_id.as_str());
    Ok(Json(UploadResponse {
        session_id,
        total_requests: requests.len(),
        requests,
        diagnostics,
    }))
}

pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<RequestListResponse> {
    Json(RequestListResponse {
        requests: state.engine.list_summaries(&session_id),
    })
}

pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path((session_id, req_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let record = state.engine.get_record(&session_id, &req_id)?;
    let mut value = serde_json::to_value(record.as_ref())?;
    if state.args.redact_secrets {
        crate::redaction::redact_record(&mut value);
    }
    Ok(Json(value))
}
