use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::errors::AppError;
use crate::models::{
    BacktestRunRequest, CleanupRequest, DataDownloadRequest, PipelineRequest,
    SupplementHistoryRequest, TaskStatusEnvelope, TaskSubmission,
};
use crate::services::status_gateway::{RealtimeStatusGateway, StatusUpdate};
use crate::state::AppState;

type Accepted = (StatusCode, Json<TaskSubmission>);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/download", post(submit_download))
        .route("/supplement", post(submit_supplement))
        .route("/backtest", post(submit_backtest))
        .route("/pipeline", post(submit_pipeline))
        .route("/cleanup", post(submit_cleanup))
        .route("/:task_id", get(get_task_status))
}

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/:task_id", get(stream_task_status))
}

/// POST /api/tasks/download
async fn submit_download(
    State(state): State<AppState>,
    Json(request): Json<DataDownloadRequest>,
) -> Result<Accepted, AppError> {
    info!("POST /api/tasks/download - {} stock file(s)", request.stock_files.len());
    let submission = state.submission.submit_download(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// POST /api/tasks/supplement
async fn submit_supplement(
    State(state): State<AppState>,
    Json(request): Json<SupplementHistoryRequest>,
) -> Result<Accepted, AppError> {
    info!("POST /api/tasks/supplement - {} stock file(s)", request.stock_files.len());
    let submission = state.submission.submit_supplement(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// POST /api/tasks/backtest
async fn submit_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRunRequest>,
) -> Result<Accepted, AppError> {
    info!("POST /api/tasks/backtest - config {}", request.config_path);
    let submission = state.submission.submit_backtest(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// POST /api/tasks/pipeline
async fn submit_pipeline(
    State(state): State<AppState>,
    Json(request): Json<PipelineRequest>,
) -> Result<Accepted, AppError> {
    info!("POST /api/tasks/pipeline - config {}", request.config_path);
    let submission = state.submission.submit_pipeline(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// POST /api/tasks/cleanup
async fn submit_cleanup(
    State(state): State<AppState>,
    Json(request): Json<CleanupRequest>,
) -> Result<Accepted, AppError> {
    info!("POST /api/tasks/cleanup");
    let submission = state.submission.submit_cleanup(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// GET /api/tasks/:task_id
async fn get_task_status(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TaskStatusEnvelope>, AppError> {
    let envelope = state
        .gateway
        .poll(&task_id)
        .await?
        .ok_or_else(|| AppError::NotFound("task not found".to_string()))?;
    Ok(Json(envelope))
}

/// GET /ws/tasks/:task_id
async fn stream_task_status(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| stream_status(socket, gateway, task_id))
}

async fn stream_status(mut socket: WebSocket, gateway: RealtimeStatusGateway, task_id: String) {
    debug!(task_id = %task_id, "🔌 Status stream opened");
    let updates = gateway.watch(task_id.clone());
    tokio::pin!(updates);

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else { break };
                let frame = match serde_json::to_string(&update) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(task_id = %task_id, "⚠️  Failed to encode status frame: {}", e);
                        break;
                    }
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    debug!(task_id = %task_id, "Status stream peer went away");
                    return;
                }
                if matches!(update, StatusUpdate::NotFound { .. }) {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    debug!(task_id = %task_id, "🔌 Status stream closed by peer");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}
