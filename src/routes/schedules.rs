use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use tracing::info;

use crate::errors::AppError;
use crate::models::{ScheduleDescriptor, ScheduleJobRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_schedules).post(upsert_schedule))
        .route("/:job_id", delete(delete_schedule))
}

/// POST /api/schedules - Create or replace a schedule by job_id
async fn upsert_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleJobRequest>,
) -> Result<Json<ScheduleDescriptor>, AppError> {
    info!("POST /api/schedules - {} ({})", request.job_id, request.cron);
    let descriptor = state.schedules.add_or_update(request).await?;
    Ok(Json(descriptor))
}

/// GET /api/schedules
async fn list_schedules(State(state): State<AppState>) -> Json<Vec<ScheduleDescriptor>> {
    Json(state.schedules.list().await)
}

/// DELETE /api/schedules/:job_id
async fn delete_schedule(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    info!("DELETE /api/schedules/{}", job_id);
    state.schedules.remove(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
