//! Retention reaper.
//!
//! Deletes FileAssets created before `now - retention_days` (physical object
//! first, best effort, then the row) and terminal TaskRecords that finished
//! before the same cutoff. Both selections are bounded by a row limit so one
//! pass never holds the store for long; the next pass picks up the rest.
//!
//! Rows may vanish under a concurrent writer between select and delete. That
//! race is logged and skipped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::db::TaskRepository;
use crate::errors::JobError;
use crate::models::{CleanupRequest, TaskType};
use crate::services::storage_service::ArtifactStorageGateway;
use crate::services::worker_runtime::{JobContext, JobRunner};

fn retention_cutoff(now: DateTime<Utc>, retention_days: i64) -> Result<DateTime<Utc>, JobError> {
    Duration::try_days(retention_days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| JobError::Validation(format!("retention_days out of range: {}", retention_days)))
}

pub struct CleanupJob {
    repository: Arc<dyn TaskRepository>,
    storage: ArtifactStorageGateway,
    defaults: RetentionConfig,
}

impl CleanupJob {
    pub fn new(repository: Arc<dyn TaskRepository>, storage: ArtifactStorageGateway, defaults: RetentionConfig) -> Self {
        Self { repository, storage, defaults }
    }
}

#[async_trait]
impl JobRunner for CleanupJob {
    fn task_name(&self) -> &'static str {
        TaskType::Cleanup.task_name()
    }

    fn started_detail(&self) -> &'static str {
        "retention cleanup started"
    }

    fn completed_detail(&self) -> &'static str {
        "retention cleanup finished"
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let request: CleanupRequest = if ctx.payload.is_null() {
            CleanupRequest::default()
        } else {
            ctx.parse_payload()?
        };
        request.validate().map_err(JobError::Validation)?;

        let retention_days = request.retention_days.unwrap_or(self.defaults.retention_days);
        let file_limit = request.file_limit.unwrap_or(self.defaults.file_limit);
        let task_limit = request.task_limit.unwrap_or(self.defaults.task_limit);
        let cutoff = retention_cutoff(Utc::now(), retention_days)?;
        ctx.info(format!("removing artifacts older than {}", cutoff.to_rfc3339()));

        // file assets
        let assets = self.repository.list_file_assets_before(cutoff, file_limit).await?;
        ctx.progress(format!("found {} expired file(s)", assets.len()), 0.2);

        let mut files_deleted = 0usize;
        let mut objects_failed = 0usize;
        for asset in &assets {
            if let Err(e) = self.storage.delete(&asset.storage_key).await {
                objects_failed += 1;
                warn!(file_id = %asset.id, key = %asset.storage_key, "⚠️  Failed to delete stored object: {}", e);
            }
            match self.repository.delete_file_asset(asset.id).await {
                Ok(true) => files_deleted += 1,
                Ok(false) => warn!(file_id = %asset.id, "⚠️  File record already removed"),
                Err(e) => warn!(file_id = %asset.id, "⚠️  Failed to delete file record: {}", e),
            }
        }

        // task records
        let tasks = self.repository.list_finished_tasks_before(cutoff, task_limit).await?;
        ctx.progress(format!("found {} expired task record(s)", tasks.len()), 0.6);

        let mut tasks_deleted = 0usize;
        for task in &tasks {
            if task.id == ctx.task_id {
                continue;
            }
            match self.repository.delete_task(&task.id).await {
                Ok(true) => tasks_deleted += 1,
                Ok(false) => warn!(task_id = %task.id, "⚠️  Task record already removed"),
                Err(e) => warn!(task_id = %task.id, "⚠️  Failed to delete task record: {}", e),
            }
        }

        info!(
            "🧹 Cleanup removed {} file(s) and {} task(s) (cutoff: {})",
            files_deleted, tasks_deleted, cutoff
        );

        Ok(json!({
            "cutoff": cutoff,
            "files_deleted": files_deleted,
            "objects_failed": objects_failed,
            "tasks_deleted": tasks_deleted,
        }))
    }
}
