use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ==============================================================================
// Lifecycle States
// ==============================================================================

/// State as seen through the broker's transient channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Progress,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    /// Fallback human status when a snapshot does not carry one.
    pub fn default_status(self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Started | TaskState::Progress => TaskStatus::Running,
            TaskState::Retry => TaskStatus::Retrying,
            TaskState::Success => TaskStatus::Completed,
            TaskState::Failure => TaskStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Progress => "PROGRESS",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }
}

/// Human-facing status stored in metadata snapshots and durable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => TaskStatus::Running,
            "retrying" => TaskStatus::Retrying,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    /// State to report when only the durable copy is available.
    pub fn as_state(self) -> TaskState {
        match self {
            TaskStatus::Pending => TaskState::Pending,
            TaskStatus::Running => TaskState::Progress,
            TaskStatus::Retrying => TaskState::Retry,
            TaskStatus::Completed => TaskState::Success,
            TaskStatus::Failed => TaskState::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Lenient parse for levels reported by external collaborators.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "DEBUG" | "TRACE" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warning,
            "ERROR" | "CRITICAL" | "FATAL" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ==============================================================================
// Metadata Snapshot
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Snapshot of a task attempt. Owned by the executing worker until flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub status: TaskStatus,
    pub detail: String,
    pub progress: f64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl TaskMetadata {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Pending,
            detail: detail.into(),
            progress: 0.0,
            logs: Vec::new(),
            started_at: None,
            finished_at: None,
            result: None,
            updated_at: Utc::now(),
        }
    }

    /// Appends a log line and makes it the current detail. Timestamps never go
    /// backwards even if the wall clock does.
    pub fn append_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let mut timestamp = Utc::now();
        if let Some(last) = self.logs.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.logs.push(LogEntry { timestamp, level, message: message.clone() });
        self.detail = message;
        self.updated_at = timestamp;
    }

    /// Clamps to [0, 1] and ignores regressions within the attempt.
    pub fn advance_progress(&mut self, progress: Option<f64>) {
        if let Some(value) = progress {
            if value.is_finite() {
                let bounded = value.clamp(0.0, 1.0);
                if bounded > self.progress {
                    self.progress = bounded;
                }
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn log_tail(&self, count: usize) -> &[LogEntry] {
        let start = self.logs.len().saturating_sub(count);
        &self.logs[start..]
    }
}

// ==============================================================================
// Task Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DownloadData,
    SupplementHistory,
    Backtest,
    Pipeline,
    Cleanup,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::DownloadData,
        TaskType::SupplementHistory,
        TaskType::Backtest,
        TaskType::Pipeline,
        TaskType::Cleanup,
    ];

    pub fn task_name(self) -> &'static str {
        match self {
            TaskType::DownloadData => "orchestrator.download_data",
            TaskType::SupplementHistory => "orchestrator.supplement_history",
            TaskType::Backtest => "orchestrator.backtest",
            TaskType::Pipeline => "orchestrator.pipeline",
            TaskType::Cleanup => "orchestrator.cleanup",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.task_name() == name)
    }
}

// ==============================================================================
// Durable Record
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub detail: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub payload: Value,
    pub meta: Option<TaskMetadata>,
    pub result: Option<Value>,
    pub backtest_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, detail: &str, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            detail: Some(detail.to_string()),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            payload,
            meta: None,
            result: None,
            backtest_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copies a lifecycle snapshot onto the record. Timestamps already set are
    /// kept when the snapshot does not carry them.
    pub fn apply_snapshot(&mut self, meta: &TaskMetadata, result: Option<&Value>) {
        self.status = meta.status;
        self.progress = meta.progress;
        self.detail = Some(meta.detail.clone());
        self.started_at = meta.started_at.or(self.started_at);
        self.finished_at = meta.finished_at.or(self.finished_at);
        if let (Some(started), Some(finished)) = (self.started_at, self.finished_at) {
            self.duration_seconds = Some((finished - started).num_milliseconds() as f64 / 1000.0);
        }
        if let Some(result) = result {
            self.result = Some(result.clone());
        }
        self.meta = Some(meta.clone());
        self.updated_at = Utc::now();
    }
}

// ==============================================================================
// Broker Messages
// ==============================================================================

/// A unit of work sent by name through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            args,
            kwargs,
            enqueued_at: Utc::now(),
        }
    }

    /// The job payload: first positional argument, a `payload` keyword, or all keywords.
    pub fn payload(&self) -> Value {
        if let Some(first) = self.args.first() {
            return first.clone();
        }
        if let Some(payload) = self.kwargs.get("payload") {
            return payload.clone();
        }
        Value::Object(self.kwargs.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerTaskState {
    pub state: TaskState,
    pub meta: TaskMetadata,
}

// ==============================================================================
// Observer Views
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEnvelope {
    pub id: String,
    pub state: TaskState,
    pub status: Option<TaskStatus>,
    pub detail: Option<String>,
    pub progress: Option<f64>,
    pub logs: Vec<LogEntry>,
    pub result: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_id: String,
    pub state: TaskState,
    pub detail: String,
}

/// Lifecycle event handed to notification sinks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    pub message: String,
    pub meta: Option<TaskMetadata>,
}

/// Progress/log callback contract every job body honors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub message: String,
    pub level: LogLevel,
    pub progress: Option<f64>,
}

impl JobEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: message.into(), level: LogLevel::Info, progress: None }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut meta = TaskMetadata::new("created");
        for value in [0.2, 1.7, -3.0, 0.5, f64::NAN, 0.9] {
            let before = meta.progress;
            meta.advance_progress(Some(value));
            assert!(meta.progress >= before);
            assert!((0.0..=1.0).contains(&meta.progress));
        }
        assert_eq!(meta.progress, 1.0);
    }

    #[test]
    fn test_append_log_updates_detail_in_order() {
        let mut meta = TaskMetadata::new("created");
        meta.append_log(LogLevel::Info, "first");
        meta.append_log(LogLevel::Warning, "second");
        assert_eq!(meta.detail, "second");
        assert_eq!(meta.logs.len(), 2);
        assert!(meta.logs[0].timestamp <= meta.logs[1].timestamp);
        assert_eq!(meta.log_tail(1)[0].message, "second");
        assert_eq!(meta.log_tail(10).len(), 2);
    }

    #[test]
    fn test_task_names_round_trip_through_registry_lookup() {
        for task_type in TaskType::ALL {
            assert_eq!(TaskType::from_task_name(task_type.task_name()), Some(task_type));
        }
        assert_eq!(TaskType::from_task_name("orchestrator.unknown"), None);
    }

    #[test]
    fn test_message_payload_prefers_first_arg() {
        let mut kwargs = Map::new();
        kwargs.insert("retention_days".into(), Value::from(7));
        let msg = TaskMessage::new("orchestrator.cleanup", vec![], kwargs.clone());
        assert_eq!(msg.payload()["retention_days"], 7);

        let msg = TaskMessage::new("orchestrator.cleanup", vec![serde_json::json!({"a": 1})], kwargs);
        assert_eq!(msg.payload()["a"], 1);
    }

    #[test]
    fn test_snapshot_sets_duration() {
        let mut record = TaskRecord::new("t1", "orchestrator.backtest", "submitted", Value::Null);
        let mut meta = TaskMetadata::new("running");
        let start = Utc::now();
        meta.started_at = Some(start);
        meta.finished_at = Some(start + chrono::Duration::seconds(3));
        meta.status = TaskStatus::Completed;
        record.apply_snapshot(&meta, None);
        assert_eq!(record.duration_seconds, Some(3.0));
        assert_eq!(record.status, TaskStatus::Completed);
    }
}
