use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::db::TaskRepository;
use crate::errors::RepositoryError;
use crate::models::{BacktestCompletion, BacktestRecord, FileAsset, TaskEvent, TaskMetadata, TaskRecord};

/// Process-local repository for tests and database-less embedded mode.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<String, TaskRecord>,
    backtests: DashMap<Uuid, BacktestRecord>,
    files: DashMap<Uuid, FileAsset>,
    events: Mutex<Vec<TaskEvent>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a task row as-is.
    pub fn insert_task(&self, record: TaskRecord) {
        self.tasks.insert(record.id.clone(), record);
    }

    pub fn insert_file_asset(&self, asset: FileAsset) {
        self.files.insert(asset.id, asset);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn file_assets(&self) -> Vec<FileAsset> {
        let mut assets: Vec<FileAsset> = self.files.iter().map(|e| e.value().clone()).collect();
        assets.sort_by_key(|a| a.created_at);
        assets
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn ensure_task(&self, record: &TaskRecord) -> Result<(), RepositoryError> {
        self.tasks
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RepositoryError> {
        Ok(self.tasks.get(id).map(|r| r.value().clone()))
    }

    async fn save_snapshot(
        &self,
        id: &str,
        meta: &TaskMetadata,
        result: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        match self.tasks.get_mut(id) {
            Some(mut record) => {
                record.apply_snapshot(meta, result);
                Ok(())
            }
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    async fn link_backtest(&self, task_id: &str, backtest_id: Uuid) -> Result<(), RepositoryError> {
        if let Some(mut record) = self.tasks.get_mut(task_id) {
            record.backtest_id = Some(backtest_id);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_finished_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, RepositoryError> {
        let mut rows: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|r| r.status.is_terminal() && r.finished_at.is_some_and(|f| f < cutoff))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.finished_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn delete_task(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.tasks.remove(id).is_some())
    }

    async fn create_backtest(&self, record: &BacktestRecord) -> Result<(), RepositoryError> {
        self.backtests.insert(record.id, record.clone());
        Ok(())
    }

    async fn complete_backtest(
        &self,
        id: Uuid,
        completion: &BacktestCompletion,
    ) -> Result<(), RepositoryError> {
        let mut record = self
            .backtests
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.status = completion.status.clone();
        record.detail = completion.detail.clone();
        record.result_path = completion.result_path.clone();
        record.cost_summary = completion.cost_summary.clone();
        record.performance_summary = completion.performance_summary.clone();
        record.report_payload = completion.report_payload.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_backtest_by_task(&self, task_id: &str) -> Result<Option<BacktestRecord>, RepositoryError> {
        Ok(self
            .backtests
            .iter()
            .find(|b| b.task_id == task_id)
            .map(|b| b.value().clone()))
    }

    async fn create_file_asset(&self, asset: &FileAsset) -> Result<(), RepositoryError> {
        self.files.insert(asset.id, asset.clone());
        Ok(())
    }

    async fn list_file_assets_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FileAsset>, RepositoryError> {
        let mut rows: Vec<FileAsset> = self
            .files
            .iter()
            .filter(|f| f.created_at < cutoff)
            .map(|f| f.value().clone())
            .collect();
        rows.sort_by_key(|f| f.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn delete_file_asset(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.files.remove(&id).is_some())
    }

    async fn record_event(&self, event: &TaskEvent) -> Result<(), RepositoryError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use chrono::Duration;

    fn finished(id: &str, finished_at: DateTime<Utc>) -> TaskRecord {
        let mut record = TaskRecord::new(id, "orchestrator.cleanup", "done", Value::Null);
        record.status = TaskStatus::Completed;
        record.finished_at = Some(finished_at);
        record
    }

    #[tokio::test]
    async fn test_ensure_task_does_not_overwrite() {
        let repo = InMemoryTaskRepository::new();
        let first = TaskRecord::new("t1", "orchestrator.backtest", "submitted", Value::Null);
        repo.ensure_task(&first).await.unwrap();

        let second = TaskRecord::new("t1", "orchestrator.backtest", "accepted", Value::Null);
        repo.ensure_task(&second).await.unwrap();

        let stored = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.detail.as_deref(), Some("submitted"));
    }

    #[tokio::test]
    async fn test_finished_tasks_before_cutoff_respect_limit() {
        let repo = InMemoryTaskRepository::new();
        let now = Utc::now();
        repo.insert_task(finished("old-1", now - Duration::days(40)));
        repo.insert_task(finished("old-2", now - Duration::days(35)));
        repo.insert_task(finished("fresh", now - Duration::days(1)));
        repo.insert_task(TaskRecord::new("running", "orchestrator.backtest", "x", Value::Null));

        let cutoff = now - Duration::days(30);
        let rows = repo.list_finished_tasks_before(cutoff, 10).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old-1", "old-2"]);

        let limited = repo.list_finished_tasks_before(cutoff, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "old-1");
    }

    #[tokio::test]
    async fn test_snapshot_on_missing_task_is_not_found() {
        let repo = InMemoryTaskRepository::new();
        let err = repo
            .save_snapshot("ghost", &TaskMetadata::new("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
