//! Market-data download and history supplement jobs.
//!
//! Both jobs hand the request to the market-data collaborator and translate
//! its percentage callbacks into tracker progress. The download job then
//! publishes every CSV it finds for the requested period type through the
//! artifact storage gateway; a failed upload keeps a local reference for that
//! file and never fails the task.
//!
//! Connection-class failures are retried by the worker runtime with the
//! transient backoff policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::JobError;
use crate::external::collaborators::MarketDataClient;
use crate::models::{parse_trade_date, DataDownloadRequest, SupplementHistoryRequest, TaskType};
use crate::services::storage_service::{ArtifactStorageGateway, PeriodWindow};
use crate::services::worker_runtime::{JobContext, JobRunner, RetryPolicy};

pub struct DownloadDataJob {
    market_data: Arc<dyn MarketDataClient>,
    storage: ArtifactStorageGateway,
}

impl DownloadDataJob {
    pub fn new(market_data: Arc<dyn MarketDataClient>, storage: ArtifactStorageGateway) -> Self {
        Self { market_data, storage }
    }
}

#[async_trait]
impl JobRunner for DownloadDataJob {
    fn task_name(&self) -> &'static str {
        TaskType::DownloadData.task_name()
    }

    fn started_detail(&self) -> &'static str {
        "market data download started"
    }

    fn completed_detail(&self) -> &'static str {
        "market data download finished"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::transient())
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let request: DataDownloadRequest = ctx.parse_payload()?;
        request.validate().map_err(JobError::Validation)?;

        let target_dir = PathBuf::from(&request.local_data_path);
        tokio::fs::create_dir_all(&target_dir).await.map_err(|e| {
            JobError::Business(format!("Failed to create data directory {}: {}", target_dir.display(), e))
        })?;
        ctx.info(format!("data will be stored in {}", target_dir.display()));

        self.market_data
            .download(&request, &target_dir, ctx.forward("download"))
            .await?;

        let saved_files = collect_saved_files(&target_dir, request.period_type.as_str()).await?;
        info!(task_id = %ctx.task_id, files = saved_files.len(), "📥 Download produced files");

        let window = PeriodWindow {
            start: parse_trade_date(&request.start_date),
            end: parse_trade_date(&request.end_date),
        };
        let prefix = format!("downloads/{}", ctx.task_id);
        let uploads = self
            .storage
            .publish_outputs(&ctx.task_id, &saved_files, &prefix, window)
            .await;

        let saved: Vec<String> = saved_files.iter().map(|p| p.display().to_string()).collect();
        Ok(json!({
            "saved_files": saved,
            "local_data_path": target_dir.display().to_string(),
            "uploads": uploads,
        }))
    }
}

/// CSV files in `dir` whose name contains `period_type`, sorted by path.
pub async fn collect_saved_files(dir: &Path, period_type: &str) -> Result<Vec<PathBuf>, JobError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| JobError::Business(format!("Failed to list {}: {}", dir.display(), e)))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| JobError::Business(format!("Failed to list {}: {}", dir.display(), e)))?
    {
        let path = entry.path();
        let is_csv = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let matches_period = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains(period_type));
        if is_csv && matches_period && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub struct SupplementHistoryJob {
    market_data: Arc<dyn MarketDataClient>,
}

impl SupplementHistoryJob {
    pub fn new(market_data: Arc<dyn MarketDataClient>) -> Self {
        Self { market_data }
    }
}

#[async_trait]
impl JobRunner for SupplementHistoryJob {
    fn task_name(&self) -> &'static str {
        TaskType::SupplementHistory.task_name()
    }

    fn started_detail(&self) -> &'static str {
        "history supplement started"
    }

    fn completed_detail(&self) -> &'static str {
        "history supplement finished"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::transient())
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let request: SupplementHistoryRequest = ctx.parse_payload()?;
        request.validate().map_err(JobError::Validation)?;

        self.market_data
            .supplement(&request, ctx.forward("supplement"))
            .await?;

        Ok(json!({
            "message": "history supplement finished",
            "stock_files": request.stock_files,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collects_only_matching_csv_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_1d.csv", "a_1d.csv", "a_5m.csv", "notes_1d.txt"] {
            tokio::fs::write(dir.path().join(name), "x").await.unwrap();
        }
        tokio::fs::create_dir(dir.path().join("nested_1d.csv")).await.unwrap();

        let files = collect_saved_files(dir.path(), "1d").await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_1d.csv", "b_1d.csv"]);
    }
}
