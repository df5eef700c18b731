use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::errors::AppError;
use crate::models::BacktestRecord;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/by-task/:task_id", get(get_backtest_by_task))
}

/// GET /api/backtests/by-task/:task_id - Report and summaries of a backtest run
async fn get_backtest_by_task(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BacktestRecord>, AppError> {
    let record = state
        .repository
        .get_backtest_by_task(&task_id)
        .await?
        .ok_or_else(|| AppError::NotFound("backtest not found".to_string()))?;
    Ok(Json(record))
}
