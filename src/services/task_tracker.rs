use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::db::TaskRepository;
use crate::external::broker::Broker;
use crate::models::{
    BrokerTaskState, JobEvent, LogLevel, TaskEvent, TaskMetadata, TaskRecord, TaskState, TaskStatus,
};
use crate::services::notification_service::NotificationDispatcher;

/// In-worker state machine for one task.
///
/// ```text
/// Created -> Started -> Progress* -> Completed | Failed
///               ^            |
///               +- Retrying -+
/// ```
///
/// Every transition mutates the owned snapshot, publishes it to the broker's
/// transient channel and then flushes it to the durable record. Publish and
/// flush failures are logged and never propagate to the job body.
pub struct TaskLifecycleTracker {
    task_id: String,
    task_type: String,
    state: TaskState,
    meta: TaskMetadata,
    broker: Arc<dyn Broker>,
    repository: Arc<dyn TaskRepository>,
    notifier: NotificationDispatcher,
}

impl TaskLifecycleTracker {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        broker: Arc<dyn Broker>,
        repository: Arc<dyn TaskRepository>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            state: TaskState::Pending,
            meta: TaskMetadata::new("task created"),
            broker,
            repository,
            notifier,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn snapshot(&self) -> &TaskMetadata {
        &self.meta
    }

    /// Accepts the task: makes sure a durable record exists and publishes a
    /// zero-progress snapshot with an empty log.
    #[instrument(skip(self, payload), fields(task_id = %self.task_id))]
    pub async fn created(&mut self, detail: &str, payload: Value) {
        self.meta = TaskMetadata::new(detail);
        self.state = TaskState::Pending;

        let record = TaskRecord::new(&self.task_id, &self.task_type, detail, payload);
        if let Err(e) = self.repository.ensure_task(&record).await {
            warn!(task_id = %self.task_id, "⚠️  Failed to create task record: {}", e);
        }
        self.sync(None).await;
    }

    /// Begins an attempt. Progress restarts at zero; the first start time is kept.
    #[instrument(skip(self), fields(task_id = %self.task_id))]
    pub async fn started(&mut self, detail: &str, attempt: u32) {
        let started_at = self.meta.started_at.unwrap_or_else(Utc::now);
        self.meta.progress = 0.0;
        self.meta.started_at = Some(started_at);
        self.meta.finished_at = None;
        self.meta.set_status(TaskStatus::Running);
        let detail = if attempt > 1 {
            format!("{} (attempt {})", detail, attempt)
        } else {
            detail.to_string()
        };
        self.meta.append_log(LogLevel::Info, detail);
        self.state = TaskState::Started;
        self.sync(None).await;
    }

    /// Appends a log line and moves progress forward.
    pub async fn progress(&mut self, event: JobEvent) {
        if self.state.is_terminal() {
            return;
        }
        self.meta.append_log(event.level, event.message);
        self.meta.advance_progress(event.progress);
        self.meta.set_status(TaskStatus::Running);
        self.state = TaskState::Progress;
        self.sync(None).await;
    }

    #[instrument(skip(self, result), fields(task_id = %self.task_id))]
    pub async fn complete(&mut self, message: &str, result: Value) {
        let result = match result {
            Value::Object(_) => result,
            other => json!({ "result": other }),
        };
        self.meta.append_log(LogLevel::Info, message);
        self.meta.progress = 1.0;
        self.meta.set_status(TaskStatus::Completed);
        self.meta.result = Some(merge_result(self.meta.result.take(), result));
        self.meta.finished_at = Some(Utc::now());
        self.state = TaskState::Success;

        let result = self.meta.result.clone();
        self.sync(result.as_ref()).await;

        tracing::info!(task_id = %self.task_id, task_type = %self.task_type, "✅ Task completed");
        self.notifier.notify_success(&self.event(message)).await;
    }

    /// Terminal failure. `reason` becomes the detail verbatim.
    #[instrument(skip(self), fields(task_id = %self.task_id))]
    pub async fn fail(&mut self, reason: &str) {
        self.meta.append_log(LogLevel::Error, reason);
        self.meta.set_status(TaskStatus::Failed);
        self.meta.finished_at = Some(Utc::now());
        self.state = TaskState::Failure;
        self.sync(None).await;

        tracing::error!(task_id = %self.task_id, task_type = %self.task_type, "❌ Task failed: {}", reason);
        self.notifier.notify_failure(&self.event(reason)).await;
    }

    #[instrument(skip(self), fields(task_id = %self.task_id))]
    pub async fn retrying(&mut self, reason: &str, next_attempt: u32, delay_secs: f64) {
        self.meta.append_log(
            LogLevel::Warning,
            format!("task will retry in {:.1}s (attempt {}): {}", delay_secs, next_attempt, reason),
        );
        self.meta.set_status(TaskStatus::Retrying);
        self.state = TaskState::Retry;
        self.sync(None).await;

        warn!(task_id = %self.task_id, attempt = next_attempt, "🔄 Task retrying: {}", reason);
        self.notifier.notify_retry(&self.event(reason)).await;
    }

    fn event(&self, message: &str) -> TaskEvent {
        TaskEvent {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            state: self.state,
            message: message.to_string(),
            meta: Some(self.meta.clone()),
        }
    }

    async fn sync(&self, result: Option<&Value>) {
        let transient = BrokerTaskState { state: self.state, meta: self.meta.clone() };
        if let Err(e) = self.broker.store_state(&self.task_id, &transient).await {
            warn!(task_id = %self.task_id, "⚠️  Failed to publish task state: {}", e);
        }
        if let Err(e) = self.repository.save_snapshot(&self.task_id, &self.meta, result).await {
            warn!(task_id = %self.task_id, "⚠️  Failed to flush task snapshot: {}", e);
        }
    }
}

/// Shallow merge of object results; later keys win.
fn merge_result(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(extra)) => {
            base.extend(extra);
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTaskRepository;
    use crate::external::broker::InMemoryBroker;

    fn tracker() -> (TaskLifecycleTracker, Arc<InMemoryBroker>, Arc<InMemoryTaskRepository>) {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());
        let notifier = NotificationDispatcher::new(vec![Arc::new(
            crate::services::notification_service::EventLogSink::new(repository.clone()),
        )]);
        let tracker = TaskLifecycleTracker::new(
            "t1",
            "orchestrator.backtest",
            broker.clone(),
            repository.clone(),
            notifier,
        );
        (tracker, broker, repository)
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_completed_and_flushes() {
        let (mut tracker, broker, repository) = tracker();
        tracker.created("task created", json!({})).await;
        tracker.started("backtest started", 1).await;
        tracker.progress(JobEvent::info("halfway").with_progress(0.5)).await;
        tracker.progress(JobEvent::info("going back").with_progress(0.2)).await;
        assert_eq!(tracker.snapshot().progress, 0.5);

        tracker.complete("task finished", json!({"result_path": "/tmp/out"})).await;

        let transient = broker.load_state("t1").await.unwrap().unwrap();
        assert_eq!(transient.state, TaskState::Success);
        assert_eq!(transient.meta.progress, 1.0);

        let record = repository.get_task("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.unwrap()["result_path"], "/tmp/out");
        assert!(record.duration_seconds.is_some());

        let events = repository.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_failure_detail_is_reason_verbatim() {
        let (mut tracker, _broker, repository) = tracker();
        tracker.created("task created", json!({})).await;
        tracker.started("backtest started", 1).await;
        tracker.fail("empty stock pool").await;

        let record = repository.get_task("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.detail.as_deref(), Some("empty stock pool"));
        let meta = record.meta.unwrap();
        assert_eq!(meta.logs.last().unwrap().level, LogLevel::Error);
        assert!(meta.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_restarts_progress_for_next_attempt() {
        let (mut tracker, _broker, _repository) = tracker();
        tracker.created("task created", json!({})).await;
        tracker.started("download started", 1).await;
        tracker.progress(JobEvent::info("40%").with_progress(0.4)).await;
        tracker.retrying("connection reset", 2, 1.0).await;
        assert_eq!(tracker.snapshot().status, TaskStatus::Retrying);

        let first_start = tracker.snapshot().started_at;
        tracker.started("download started", 2).await;
        assert_eq!(tracker.snapshot().progress, 0.0);
        assert_eq!(tracker.snapshot().started_at, first_start);
    }

    #[tokio::test]
    async fn test_flush_failure_does_not_abort() {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());
        let mut tracker = TaskLifecycleTracker::new(
            "orphan",
            "orchestrator.cleanup",
            broker.clone(),
            repository,
            NotificationDispatcher::default(),
        );
        // no created() call, so every flush hits a missing row
        tracker.started("cleanup started", 1).await;
        tracker.complete("done", json!({"deleted": 0})).await;
        assert_eq!(tracker.state(), TaskState::Success);
        assert!(broker.load_state("orphan").await.unwrap().is_some());
    }

    #[test]
    fn test_merge_result_prefers_incoming_keys() {
        let merged = merge_result(Some(json!({"a": 1, "b": 1})), json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }
}
