use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::TaskRepository;
use crate::errors::RepositoryError;
use crate::models::{
    BacktestCompletion, BacktestRecord, FileAsset, TaskEvent, TaskMetadata, TaskRecord, TaskStatus,
};

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    progress: f64,
    detail: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    payload: Json<Value>,
    meta: Option<Json<TaskMetadata>>,
    result: Option<Json<Value>>,
    backtest_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for TaskRecord {
    fn from(row: TaskRow) -> Self {
        TaskRecord {
            id: row.id,
            task_type: row.task_type,
            status: TaskStatus::parse(&row.status),
            progress: row.progress,
            detail: row.detail,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_seconds: row.duration_seconds,
            payload: row.payload.0,
            meta: row.meta.map(|m| m.0),
            result: row.result.map(|r| r.0),
            backtest_id: row.backtest_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BacktestRow {
    id: Uuid,
    task_id: String,
    status: String,
    detail: Option<String>,
    config_path: Option<String>,
    strategy_path: Option<String>,
    parameters: Json<Value>,
    result_path: Option<String>,
    cost_summary: Json<Value>,
    performance_summary: Json<Value>,
    report_payload: Json<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BacktestRow> for BacktestRecord {
    fn from(row: BacktestRow) -> Self {
        BacktestRecord {
            id: row.id,
            task_id: row.task_id,
            status: row.status,
            detail: row.detail,
            config_path: row.config_path,
            strategy_path: row.strategy_path,
            parameters: row.parameters.0,
            result_path: row.result_path,
            cost_summary: row.cost_summary.0,
            performance_summary: row.performance_summary.0,
            report_payload: row.report_payload.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct FileAssetRow {
    id: Uuid,
    task_id: Option<String>,
    backtest_id: Option<Uuid>,
    file_name: String,
    local_path: Option<String>,
    storage_key: String,
    storage_url: String,
    size: i64,
    checksum: Option<String>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    metadata: Json<Value>,
    created_at: DateTime<Utc>,
}

impl From<FileAssetRow> for FileAsset {
    fn from(row: FileAssetRow) -> Self {
        FileAsset {
            id: row.id,
            task_id: row.task_id,
            backtest_id: row.backtest_id,
            file_name: row.file_name,
            local_path: row.local_path,
            storage_key: row.storage_key,
            storage_url: row.storage_url,
            size: row.size,
            checksum: row.checksum,
            period_start: row.period_start,
            period_end: row.period_end,
            metadata: row.metadata.0,
            created_at: row.created_at,
        }
    }
}

pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("✅ Database connected and migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ==============================================================================
// Task Records
// ==============================================================================

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn ensure_task(&self, record: &TaskRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, status, progress, detail, payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.task_type)
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.detail)
        .bind(Json(&record.payload))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TaskRecord::from))
    }

    async fn save_snapshot(
        &self,
        id: &str,
        meta: &TaskMetadata,
        result: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        // duration is derived in SQL so a snapshot without started_at keeps the stored one
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                progress = $3,
                detail = $4,
                started_at = COALESCE($5, started_at),
                finished_at = COALESCE($6, finished_at),
                duration_seconds = CASE
                    WHEN COALESCE($5, started_at) IS NOT NULL AND COALESCE($6, finished_at) IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (COALESCE($6, finished_at) - COALESCE($5, started_at)))::DOUBLE PRECISION
                    ELSE duration_seconds
                END,
                meta = $7,
                result = COALESCE($8, result),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(meta.status.as_str())
        .bind(meta.progress)
        .bind(&meta.detail)
        .bind(meta.started_at)
        .bind(meta.finished_at)
        .bind(Json(meta))
        .bind(result.map(Json))
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn link_backtest(&self, task_id: &str, backtest_id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE tasks SET backtest_id = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(backtest_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_finished_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('completed', 'failed')
              AND finished_at IS NOT NULL
              AND finished_at < $1
            ORDER BY finished_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TaskRecord::from).collect())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, RepositoryError> {
        let outcome = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(outcome.rows_affected() > 0)
    }

    // ==========================================================================
    // Backtest Records
    // ==========================================================================

    async fn create_backtest(&self, record: &BacktestRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO backtests (
                id, task_id, status, detail, config_path, strategy_path, parameters,
                result_path, cost_summary, performance_summary, report_payload,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(&record.task_id)
        .bind(&record.status)
        .bind(&record.detail)
        .bind(&record.config_path)
        .bind(&record.strategy_path)
        .bind(Json(&record.parameters))
        .bind(&record.result_path)
        .bind(Json(&record.cost_summary))
        .bind(Json(&record.performance_summary))
        .bind(Json(&record.report_payload))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_backtest(
        &self,
        id: Uuid,
        completion: &BacktestCompletion,
    ) -> Result<(), RepositoryError> {
        let outcome = sqlx::query(
            r#"
            UPDATE backtests
            SET status = $2,
                detail = $3,
                result_path = $4,
                cost_summary = $5,
                performance_summary = $6,
                report_payload = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&completion.status)
        .bind(&completion.detail)
        .bind(&completion.result_path)
        .bind(Json(&completion.cost_summary))
        .bind(Json(&completion.performance_summary))
        .bind(Json(&completion.report_payload))
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_backtest_by_task(&self, task_id: &str) -> Result<Option<BacktestRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, BacktestRow>(
            r#"
            SELECT * FROM backtests WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BacktestRecord::from))
    }

    // ==========================================================================
    // File Assets
    // ==========================================================================

    async fn create_file_asset(&self, asset: &FileAsset) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, task_id, backtest_id, file_name, local_path, storage_key, storage_url,
                size, checksum, period_start, period_end, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(asset.id)
        .bind(&asset.task_id)
        .bind(asset.backtest_id)
        .bind(&asset.file_name)
        .bind(&asset.local_path)
        .bind(&asset.storage_key)
        .bind(&asset.storage_url)
        .bind(asset.size)
        .bind(&asset.checksum)
        .bind(asset.period_start)
        .bind(asset.period_end)
        .bind(Json(&asset.metadata))
        .bind(asset.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_file_assets_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FileAsset>, RepositoryError> {
        let rows = sqlx::query_as::<_, FileAssetRow>(
            r#"
            SELECT * FROM files
            WHERE created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FileAsset::from).collect())
    }

    async fn delete_file_asset(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let outcome = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn record_event(&self, event: &TaskEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, task_type, state, message, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.task_id)
        .bind(&event.task_type)
        .bind(event.state.as_str())
        .bind(&event.message)
        .bind(event.meta.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
