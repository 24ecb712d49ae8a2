//! POST /work-items, GET /work-items/:id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{NewWorkItem, WorkItem, WorkItemStatus};
use crate::AppState;

/// POST /work-items response
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub work_item_id: Uuid,
    pub status: WorkItemStatus,
    pub run: i64,
}

/// POST /work-items
///
/// Store a work item and start its pipeline. Returns 202 Accepted; the item
/// stays Scheduled if the pipeline could not be started yet.
pub async fn submit_work_item(
    State(state): State<AppState>,
    Json(request): Json<NewWorkItem>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let item = state.orchestrator.submit(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            work_item_id: item.id,
            status: item.status,
            run: item.run,
        }),
    ))
}

/// GET /work-items/:id
pub async fn get_work_item(
    State(state): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> ApiResult<Json<WorkItem>> {
    Ok(Json(state.orchestrator.get_work_item(work_item_id).await?))
}

pub fn work_item_routes() -> Router<AppState> {
    Router::new()
        .route("/work-items", post(submit_work_item))
        .route("/work-items/:id", get(get_work_item))
}
