use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::RepositoryError;

/// Denormalized backtest outcome for real-time dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsEvent {
    pub backtest_id: Uuid,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub performance_summary: Value,
    pub cost_summary: Value,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, event: &MetricsEvent) -> Result<(), RepositoryError>;
}

/// Appends events to `<table> (backtest_id, event_time, payload)` in a SQL store.
pub struct SqlMetricsSink {
    pool: PgPool,
    insert_sql: String,
}

impl SqlMetricsSink {
    pub async fn connect(url: &str, table: &str) -> Result<Self, RepositoryError> {
        if !is_safe_identifier(table) {
            return Err(RepositoryError::Config(format!("invalid metrics table name '{}'", table)));
        }
        let pool = PgPoolOptions::new().max_connections(2).connect_lazy(url)?;
        let insert_sql = format!(
            "INSERT INTO {} (backtest_id, event_time, payload) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            table
        );
        Ok(Self { pool, insert_sql })
    }
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

#[async_trait]
impl MetricsSink for SqlMetricsSink {
    async fn publish(&self, event: &MetricsEvent) -> Result<(), RepositoryError> {
        sqlx::query(&self.insert_sql)
            .bind(event.backtest_id.to_string())
            .bind(event.timestamp)
            .bind(Json(event))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_restricted() {
        assert!(is_safe_identifier("realtime_metrics"));
        assert!(is_safe_identifier("analytics.realtime_metrics"));
        assert!(!is_safe_identifier("metrics; DROP TABLE tasks"));
        assert!(!is_safe_identifier(""));
    }
}
