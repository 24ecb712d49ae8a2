//! Pipeline status, cancel and re-submission

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::WorkItem;
use crate::orchestrator::{PipelineCancellation, PipelineStatus};
use crate::AppState;

/// GET /pipelines/:id/status
pub async fn get_pipeline_status(
    State(state): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> ApiResult<Json<PipelineStatus>> {
    Ok(Json(state.orchestrator.get_pipeline_status(work_item_id).await?))
}

/// POST /pipelines/:id/cancel
///
/// Idempotent. The item is Cancelled even when some task cleanup failed.
pub async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> ApiResult<Json<PipelineCancellation>> {
    Ok(Json(state.orchestrator.cancel_pipeline(work_item_id).await?))
}

/// POST /pipelines/:id/retry
///
/// 409 while the pipeline is still running.
pub async fn retry_pipeline(
    State(state): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> ApiResult<Json<WorkItem>> {
    Ok(Json(state.orchestrator.retry_pipeline(work_item_id).await?))
}

pub fn pipeline_routes() -> Router<AppState> {
    Router::new()
        .route("/pipelines/:id/status", get(get_pipeline_status))
        .route("/pipelines/:id/cancel", post(cancel_pipeline))
        .route("/pipelines/:id/retry", post(retry_pipeline))
}
