use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub sessions: usize,
}

pub async fn liveness(State(state): State<Arc<AppState>>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        sessions: state.engine.store().len(),
    })
}
