//! GET /queues/stats

use axum::{extract::State, routing::get, Json, Router};
use std::collections::BTreeMap;

use crate::error::ApiResult;
use crate::models::{QueueStats, Stage};
use crate::AppState;

/// Task counts per state, keyed by stage
pub async fn get_queue_stats(State(state): State<AppState>) -> ApiResult<Json<BTreeMap<Stage, QueueStats>>> {
    Ok(Json(state.orchestrator.queues().stats().await?))
}

pub fn queue_routes() -> Router<AppState> {
    Router::new().route("/queues/stats", get(get_queue_stats))
}
