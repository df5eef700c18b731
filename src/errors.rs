use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Schedule(ScheduleError::InvalidCron { .. })
            | AppError::Schedule(ScheduleError::InvalidTimezone(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Broker(_) => (StatusCode::SERVICE_UNAVAILABLE, "broker unavailable".to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string()),
        };

        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self);
        }

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        AppError::Validation(value)
    }
}

/// Outcome taxonomy of a job body. Only `Transient` is eligible for retry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Business(String),
    #[error("unexpected fault: {0}")]
    Unexpected(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

impl From<CollaboratorError> for JobError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::Connection(msg) => JobError::Transient(msg),
            CollaboratorError::Failed(msg) => JobError::Business(msg),
            CollaboratorError::Io(e) => JobError::Transient(e.to_string()),
            CollaboratorError::Protocol(msg) => JobError::Unexpected(msg),
        }
    }
}

impl From<RepositoryError> for JobError {
    fn from(value: RepositoryError) -> Self {
        JobError::Transient(value.to_string())
    }
}

/// Failures raised by external collaborators (engine, market-data client, trading framework).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Failed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid store configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("failed to persist schedules: {0}")]
    Persist(String),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("email error: {0}")]
    Email(String),
    #[error("webhook error: {0}")]
    Webhook(#[from] reqwest::Error),
    #[error("event log error: {0}")]
    EventLog(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_errors_map_to_job_taxonomy() {
        let transient: JobError = CollaboratorError::Connection("reset by peer".into()).into();
        assert!(transient.is_transient());

        let business: JobError = CollaboratorError::Failed("empty stock pool".into()).into();
        assert_eq!(business, JobError::Business("empty stock pool".into()));
        assert_eq!(business.to_string(), "empty stock pool");
    }

    #[test]
    fn test_validation_string_conversion() {
        let err: AppError = "start_date must be YYYYMMDD".to_string().into();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
