use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;
use tracing::{info, warn};

use crate::db::TaskRepository;
use crate::errors::AppError;
use crate::external::broker::Broker;
use crate::models::{
    BacktestRunRequest, BrokerTaskState, CleanupRequest, DataDownloadRequest, PipelineRequest,
    SupplementHistoryRequest, TaskMessage, TaskMetadata, TaskRecord, TaskState, TaskSubmission,
    TaskType,
};

const SUBMITTED_DETAIL: &str = "task submitted";

/// Accepts validated requests, creates their durable record and enqueues them.
/// It never waits for the outcome.
#[derive(Clone)]
pub struct TaskSubmissionService {
    broker: Arc<dyn Broker>,
    repository: Arc<dyn TaskRepository>,
}

impl TaskSubmissionService {
    pub fn new(broker: Arc<dyn Broker>, repository: Arc<dyn TaskRepository>) -> Self {
        Self { broker, repository }
    }

    pub async fn submit_download(&self, request: &DataDownloadRequest) -> Result<TaskSubmission, AppError> {
        request.validate().map_err(AppError::Validation)?;
        self.submit(TaskType::DownloadData, request).await
    }

    pub async fn submit_supplement(&self, request: &SupplementHistoryRequest) -> Result<TaskSubmission, AppError> {
        request.validate().map_err(AppError::Validation)?;
        self.submit(TaskType::SupplementHistory, request).await
    }

    pub async fn submit_backtest(&self, request: &BacktestRunRequest) -> Result<TaskSubmission, AppError> {
        request.validate().map_err(AppError::Validation)?;
        self.submit(TaskType::Backtest, request).await
    }

    pub async fn submit_pipeline(&self, request: &PipelineRequest) -> Result<TaskSubmission, AppError> {
        request.validate().map_err(AppError::Validation)?;
        self.submit(TaskType::Pipeline, request).await
    }

    pub async fn submit_cleanup(&self, request: &CleanupRequest) -> Result<TaskSubmission, AppError> {
        request.validate().map_err(AppError::Validation)?;
        self.submit(TaskType::Cleanup, request).await
    }

    async fn submit<T: Serialize>(&self, task_type: TaskType, request: &T) -> Result<TaskSubmission, AppError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| AppError::Validation(format!("Failed to encode request: {}", e)))?;
        let message = TaskMessage::new(task_type.task_name(), vec![payload.clone()], Map::new());
        let task_id = message.id.clone();

        let record = TaskRecord::new(&task_id, task_type.task_name(), SUBMITTED_DETAIL, payload);
        self.repository.ensure_task(&record).await?;

        let pending = BrokerTaskState { state: TaskState::Pending, meta: TaskMetadata::new(SUBMITTED_DETAIL) };
        if let Err(e) = self.broker.store_state(&task_id, &pending).await {
            warn!(task_id = %task_id, "⚠️  Failed to publish pending state: {}", e);
        }

        self.broker.send_task(&message).await?;
        info!(task_id = %task_id, task_name = %message.task_name, "📨 Task submitted");

        Ok(TaskSubmission {
            task_id,
            state: TaskState::Pending,
            detail: SUBMITTED_DETAIL.to_string(),
        })
    }
}
