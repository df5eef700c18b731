use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::CollaboratorError;
use crate::models::{
    BacktestConfig, BacktestRunRequest, DataDownloadRequest, EngineOutcome, LogLevel,
    SupplementHistoryRequest,
};

/// Raw callback traffic from a collaborator. Progress is a percentage in [0, 100].
#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorEvent {
    Log { level: LogLevel, message: String },
    Percent(f64),
}

impl CollaboratorEvent {
    pub fn info(message: impl Into<String>) -> Self {
        CollaboratorEvent::Log { level: LogLevel::Info, message: message.into() }
    }
}

pub type CollaboratorEvents = mpsc::UnboundedSender<CollaboratorEvent>;

#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Writes CSV files for the requested window into `target_dir`.
    async fn download(
        &self,
        request: &DataDownloadRequest,
        target_dir: &Path,
        events: CollaboratorEvents,
    ) -> Result<(), CollaboratorError>;

    async fn supplement(
        &self,
        request: &SupplementHistoryRequest,
        events: CollaboratorEvents,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait BacktestEngine: Send + Sync {
    async fn run(
        &self,
        config: &BacktestConfig,
        request: &BacktestRunRequest,
        events: CollaboratorEvents,
    ) -> Result<EngineOutcome, CollaboratorError>;
}

/// Trading framework driven step by step by the pipeline job.
#[async_trait]
pub trait TradingFramework: Send + Sync {
    async fn open(
        &self,
        config_path: &Path,
        strategy_path: &Path,
    ) -> Result<Box<dyn FrameworkSession>, CollaboratorError>;
}

#[async_trait]
pub trait FrameworkSession: Send {
    async fn init_trader_and_account(&mut self) -> Result<(), CollaboratorError>;
    async fn init_data(&mut self) -> Result<(), CollaboratorError>;
    async fn run(&mut self, events: CollaboratorEvents) -> Result<(), CollaboratorError>;
    async fn stop(&mut self) -> Result<(), CollaboratorError>;
}

// ==============================================================================
// External Command Adapter
// ==============================================================================

/// One JSON line on a collaborator's stdout.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CommandLine {
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    Progress {
        percent: f64,
    },
    Result {
        #[serde(default)]
        result_path: Option<String>,
        #[serde(default)]
        report: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        kind: Option<String>,
    },
}

/// Runs an executable as `<program> <action>` with the JSON request on stdin
/// and translates its JSON-line stdout into callback events.
///
/// Non-JSON stdout lines are forwarded as INFO logs. An `error` line decides
/// the error class: `kind: "connection"` is retryable, anything else is a
/// business failure.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    program: PathBuf,
}

impl CommandCollaborator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    async fn invoke(
        &self,
        action: &str,
        request: Value,
        events: Option<&CollaboratorEvents>,
    ) -> Result<Option<EngineOutcome>, CollaboratorError> {
        let mut child = Command::new(&self.program)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CollaboratorError::Connection(format!("cannot start {}: {}", self.program.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let body = serde_json::to_vec(&request)
                .map_err(|e| CollaboratorError::Protocol(e.to_string()))?;
            stdin.write_all(&body).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CollaboratorError::Protocol("stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut outcome = None;
        let mut failure = None;
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<CommandLine>(trimmed) {
                Ok(CommandLine::Log { level, message }) => {
                    let level = level.as_deref().map(LogLevel::parse).unwrap_or(LogLevel::Info);
                    emit(events, CollaboratorEvent::Log { level, message });
                }
                Ok(CommandLine::Progress { percent }) => emit(events, CollaboratorEvent::Percent(percent)),
                Ok(CommandLine::Result { result_path, report }) => {
                    outcome = Some(EngineOutcome { result_path, report });
                }
                Ok(CommandLine::Error { message, kind }) => {
                    failure = Some(match kind.as_deref() {
                        Some("connection") => CollaboratorError::Connection(message),
                        Some("protocol") => CollaboratorError::Protocol(message),
                        _ => CollaboratorError::Failed(message),
                    });
                }
                Err(_) => emit(events, CollaboratorEvent::info(trimmed)),
            }
        }

        let status = child.wait().await?;
        if let Some(err) = failure {
            return Err(err);
        }
        if !status.success() {
            return Err(CollaboratorError::Failed(format!(
                "{} {} exited with {}",
                self.program.display(),
                action,
                status
            )));
        }
        Ok(outcome)
    }
}

fn emit(events: Option<&CollaboratorEvents>, event: CollaboratorEvent) {
    if let Some(events) = events {
        // receiver gone means the job already finished; nothing to report to
        let _ = events.send(event);
    }
}

#[async_trait]
impl MarketDataClient for CommandCollaborator {
    async fn download(
        &self,
        request: &DataDownloadRequest,
        target_dir: &Path,
        events: CollaboratorEvents,
    ) -> Result<(), CollaboratorError> {
        let mut body = serde_json::to_value(request).map_err(|e| CollaboratorError::Protocol(e.to_string()))?;
        body["local_data_path"] = json!(target_dir.to_string_lossy());
        self.invoke("download", body, Some(&events)).await.map(|_| ())
    }

    async fn supplement(
        &self,
        request: &SupplementHistoryRequest,
        events: CollaboratorEvents,
    ) -> Result<(), CollaboratorError> {
        let body = serde_json::to_value(request).map_err(|e| CollaboratorError::Protocol(e.to_string()))?;
        self.invoke("supplement", body, Some(&events)).await.map(|_| ())
    }
}

#[async_trait]
impl BacktestEngine for CommandCollaborator {
    async fn run(
        &self,
        config: &BacktestConfig,
        request: &BacktestRunRequest,
        events: CollaboratorEvents,
    ) -> Result<EngineOutcome, CollaboratorError> {
        let body = json!({ "config": config, "request": request });
        self.invoke("backtest", body, Some(&events))
            .await?
            .ok_or_else(|| CollaboratorError::Protocol("engine produced no result line".to_string()))
    }
}

#[async_trait]
impl TradingFramework for CommandCollaborator {
    async fn open(
        &self,
        config_path: &Path,
        strategy_path: &Path,
    ) -> Result<Box<dyn FrameworkSession>, CollaboratorError> {
        let session = CommandFrameworkSession {
            command: self.clone(),
            paths: json!({
                "config_path": config_path.to_string_lossy(),
                "strategy_path": strategy_path.to_string_lossy(),
            }),
        };
        session.command.invoke("framework-load", session.paths.clone(), None).await?;
        Ok(Box::new(session))
    }
}

struct CommandFrameworkSession {
    command: CommandCollaborator,
    paths: Value,
}

#[async_trait]
impl FrameworkSession for CommandFrameworkSession {
    async fn init_trader_and_account(&mut self) -> Result<(), CollaboratorError> {
        self.command.invoke("framework-init-account", self.paths.clone(), None).await.map(|_| ())
    }

    async fn init_data(&mut self) -> Result<(), CollaboratorError> {
        self.command.invoke("framework-init-data", self.paths.clone(), None).await.map(|_| ())
    }

    async fn run(&mut self, events: CollaboratorEvents) -> Result<(), CollaboratorError> {
        self.command.invoke("framework-run", self.paths.clone(), Some(&events)).await.map(|_| ())
    }

    async fn stop(&mut self) -> Result<(), CollaboratorError> {
        self.command.invoke("framework-stop", self.paths.clone(), None).await.map(|_| ())
    }
}

/// Stand-in used when no executable is configured for a collaborator.
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn error(&self) -> CollaboratorError {
        CollaboratorError::Failed(format!("{} is not configured", self.0))
    }
}

#[async_trait]
impl MarketDataClient for Unconfigured {
    async fn download(&self, _: &DataDownloadRequest, _: &Path, _: CollaboratorEvents) -> Result<(), CollaboratorError> {
        Err(self.error())
    }

    async fn supplement(&self, _: &SupplementHistoryRequest, _: CollaboratorEvents) -> Result<(), CollaboratorError> {
        Err(self.error())
    }
}

#[async_trait]
impl BacktestEngine for Unconfigured {
    async fn run(
        &self,
        _: &BacktestConfig,
        _: &BacktestRunRequest,
        _: CollaboratorEvents,
    ) -> Result<EngineOutcome, CollaboratorError> {
        Err(self.error())
    }
}

#[async_trait]
impl TradingFramework for Unconfigured {
    async fn open(&self, _: &Path, _: &Path) -> Result<Box<dyn FrameworkSession>, CollaboratorError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines_parse() {
        let line: CommandLine = serde_json::from_str(r#"{"type":"progress","percent":42}"#).unwrap();
        assert!(matches!(line, CommandLine::Progress { percent } if percent == 42.0));

        let line: CommandLine =
            serde_json::from_str(r#"{"type":"error","message":"empty stock pool"}"#).unwrap();
        assert!(matches!(line, CommandLine::Error { kind: None, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_events_and_result() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        tokio::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\n\
             echo '{\"type\":\"log\",\"level\":\"WARNING\",\"message\":\"slow feed\"}'\n\
             echo '{\"type\":\"progress\",\"percent\":50}'\n\
             echo 'plain output'\n\
             echo '{\"type\":\"result\",\"result_path\":\"/tmp/r\",\"report\":{}}'\n",
        )
        .await
        .unwrap();
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = CommandCollaborator::new(&script)
            .invoke("backtest", json!({}), Some(&tx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.result_path.as_deref(), Some("/tmp/r"));

        drop(tx);
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                CollaboratorEvent::Log { level: LogLevel::Warning, message: "slow feed".into() },
                CollaboratorEvent::Percent(50.0),
                CollaboratorEvent::info("plain output"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unconfigured_collaborator_fails_as_business_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = BacktestEngine::run(
            &Unconfigured("backtest engine"),
            &serde_json::from_value(json!({"stock_list": []})).unwrap(),
            &serde_json::from_value(json!({"config_path": "c", "strategy_path": "s"})).unwrap(),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CollaboratorError::Failed(_)));
    }
}
