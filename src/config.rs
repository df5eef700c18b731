use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::errors::ConfigError;
use crate::models::MAX_RETENTION_DAYS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Api,
    Worker,
    All,
}

impl AppMode {
    pub fn runs_api(self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppMode::Api => "api",
            AppMode::Worker => "worker",
            AppMode::All => "all",
        }
    }
}

impl FromStr for AppMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(AppMode::Api),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(ConfigError::Invalid { key: "APP_MODE", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    Local,
    Http,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub local_root: PathBuf,
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender: String,
    pub use_tls: bool,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub retention_days: i64,
    pub file_limit: i64,
    pub task_limit: i64,
}

#[derive(Debug, Clone)]
pub struct CollaboratorCommands {
    pub engine: Option<String>,
    pub market_data: Option<String>,
    pub framework: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: AppMode,
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub broker_url: String,
    pub broker_queue: String,
    pub result_expires: Duration,
    pub worker_concurrency: usize,
    /// Names this worker's Redis processing list; keep it stable across restarts.
    pub worker_id: String,
    pub scheduler_timezone: Tz,
    pub schedule_config_path: PathBuf,
    pub misfire_grace: Duration,
    pub stream_interval: Duration,
    pub storage: StorageConfig,
    pub smtp: SmtpConfig,
    pub webhook_url: Option<String>,
    pub metrics_url: Option<String>,
    pub metrics_table: String,
    pub retention: RetentionConfig,
    pub commands: CollaboratorCommands,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn opt_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = var_or(key, default);
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid { key, value })
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = var_or("APP_MODE", "all").parse::<AppMode>()?;

        let timezone_name = var_or("SCHEDULER_TIMEZONE", "Asia/Taipei");
        let scheduler_timezone = timezone_name
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid { key: "SCHEDULER_TIMEZONE", value: timezone_name.clone() })?;

        let provider = match var_or("STORAGE_PROVIDER", "local").to_lowercase().as_str() {
            "local" => StorageProvider::Local,
            "http" => StorageProvider::Http,
            other => {
                return Err(ConfigError::Invalid { key: "STORAGE_PROVIDER", value: other.to_string() })
            }
        };

        let recipients = var_or("TASK_ALERT_EMAILS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let use_tls = matches!(
            var_or("SMTP_USE_TLS", "true").to_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        let config = Self {
            mode,
            bind_addr: parse_var("BIND_ADDR", "0.0.0.0:3000")?,
            database_url: opt_var("DATABASE_URL"),
            broker_url: var_or("BROKER_URL", "memory://"),
            broker_queue: var_or("BROKER_QUEUE", "orchestrator:tasks"),
            result_expires: Duration::from_secs(parse_var("RESULT_EXPIRES_SECS", "86400")?),
            worker_concurrency: parse_var("WORKER_CONCURRENCY", "4")?,
            worker_id: opt_var("WORKER_ID")
                .or_else(|| opt_var("HOSTNAME"))
                .unwrap_or_else(|| "worker".to_string()),
            scheduler_timezone,
            schedule_config_path: PathBuf::from(var_or("SCHEDULE_CONFIG_PATH", "data/schedules.json")),
            misfire_grace: Duration::from_secs(parse_var("SCHEDULER_MISFIRE_GRACE", "60")?),
            stream_interval: Duration::from_millis(parse_var("STATUS_STREAM_INTERVAL_MS", "1000")?),
            storage: StorageConfig {
                provider,
                local_root: PathBuf::from(var_or("STORAGE_LOCAL_ROOT", "data/uploads")),
                endpoint: opt_var("STORAGE_ENDPOINT"),
                bucket: opt_var("STORAGE_BUCKET"),
                token: opt_var("STORAGE_TOKEN"),
            },
            smtp: SmtpConfig {
                host: opt_var("SMTP_HOST"),
                port: parse_var("SMTP_PORT", "587")?,
                username: opt_var("SMTP_USERNAME"),
                password: opt_var("SMTP_PASSWORD"),
                sender: var_or("SMTP_SENDER", "no-reply@backtest.local"),
                use_tls,
                recipients,
            },
            webhook_url: opt_var("TASK_ALERT_WEBHOOK_URL"),
            metrics_url: opt_var("REALTIME_METRICS_URL"),
            metrics_table: var_or("REALTIME_METRICS_TABLE", "realtime_metrics"),
            retention: RetentionConfig {
                retention_days: parse_var("RETENTION_DAYS", "30")?,
                file_limit: parse_var("CLEANUP_FILE_LIMIT", "500")?,
                task_limit: parse_var("CLEANUP_TASK_LIMIT", "500")?,
            },
            commands: CollaboratorCommands {
                engine: opt_var("ENGINE_COMMAND"),
                market_data: opt_var("MARKET_DATA_COMMAND"),
                framework: opt_var("FRAMEWORK_COMMAND"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.provider == StorageProvider::Http && self.storage.endpoint.is_none() {
            return Err(ConfigError::Inconsistent(
                "STORAGE_PROVIDER is http but STORAGE_ENDPOINT is not set".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Inconsistent("WORKER_CONCURRENCY must be at least 1".to_string()));
        }
        if self.retention.retention_days < 0 {
            return Err(ConfigError::Inconsistent("RETENTION_DAYS must not be negative".to_string()));
        }
        if self.retention.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Inconsistent(format!(
                "RETENTION_DAYS must not exceed {}",
                MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }

    pub fn uses_redis_broker(&self) -> bool {
        self.broker_url.starts_with("redis://") || self.broker_url.starts_with("rediss://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_mode_parsing() {
        assert_eq!("API".parse::<AppMode>().unwrap(), AppMode::Api);
        assert!("worker".parse::<AppMode>().unwrap().runs_worker());
        assert!(!AppMode::Worker.runs_api());
        assert!("everything".parse::<AppMode>().is_err());
    }
}
