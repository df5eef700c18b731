pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::RepositoryError;
use crate::models::{BacktestCompletion, BacktestRecord, FileAsset, TaskEvent, TaskMetadata, TaskRecord};

pub use memory::InMemoryTaskRepository;
pub use postgres::PgTaskRepository;

/// Durable CRUD for task, backtest and file records.
///
/// Every TaskRecord has a single writer (its executing worker) except for
/// retention, so implementations need no row locking. Deletes report whether
/// a row was actually removed; a missing row is not an error.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts the record unless a row with the same id already exists.
    async fn ensure_task(&self, record: &TaskRecord) -> Result<(), RepositoryError>;
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RepositoryError>;
    /// Writes a lifecycle snapshot onto an existing record.
    async fn save_snapshot(
        &self,
        id: &str,
        meta: &TaskMetadata,
        result: Option<&Value>,
    ) -> Result<(), RepositoryError>;
    async fn link_backtest(&self, task_id: &str, backtest_id: Uuid) -> Result<(), RepositoryError>;
    /// Terminal tasks whose finished_at precedes the cutoff, oldest first.
    async fn list_finished_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, RepositoryError>;
    async fn delete_task(&self, id: &str) -> Result<bool, RepositoryError>;

    async fn create_backtest(&self, record: &BacktestRecord) -> Result<(), RepositoryError>;
    async fn complete_backtest(
        &self,
        id: Uuid,
        completion: &BacktestCompletion,
    ) -> Result<(), RepositoryError>;
    async fn get_backtest_by_task(&self, task_id: &str) -> Result<Option<BacktestRecord>, RepositoryError>;

    async fn create_file_asset(&self, asset: &FileAsset) -> Result<(), RepositoryError>;
    /// File assets created before the cutoff, oldest first.
    async fn list_file_assets_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FileAsset>, RepositoryError>;
    async fn delete_file_asset(&self, id: Uuid) -> Result<bool, RepositoryError>;

    async fn record_event(&self, event: &TaskEvent) -> Result<(), RepositoryError>;
}
