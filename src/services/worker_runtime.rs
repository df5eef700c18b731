use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::TaskRepository;
use crate::errors::JobError;
use crate::external::broker::Broker;
use crate::external::collaborators::{CollaboratorEvent, CollaboratorEvents};
use crate::models::{JobEvent, LogLevel, TaskMessage, TaskState};
use crate::services::notification_service::NotificationDispatcher;
use crate::services::task_tracker::TaskLifecycleTracker;

// ==============================================================================
// Job Context
// ==============================================================================

/// Handle a job body uses to report progress. Events travel over a channel
/// to the tracker, so job logic never touches persistence.
pub struct JobContext {
    pub task_id: String,
    pub payload: Value,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl JobContext {
    pub fn new(task_id: impl Into<String>, payload: Value, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { task_id: task_id.into(), payload, events }
    }

    pub fn emit(&self, event: JobEvent) {
        // receiver lives until the attempt ends
        let _ = self.events.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(JobEvent::info(message));
    }

    pub fn progress(&self, message: impl Into<String>, progress: f64) {
        self.emit(JobEvent::info(message).with_progress(progress));
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::Validation(format!("invalid task payload: {}", e)))
    }

    /// Sender for a collaborator. Percentages are normalized to [0, 1] and
    /// reported as "`label` progress N%".
    pub fn forward(&self, label: &'static str) -> CollaboratorEvents {
        let (tx, mut rx) = mpsc::unbounded_channel::<CollaboratorEvent>();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let job_event = match event {
                    CollaboratorEvent::Log { level, message } => JobEvent { message, level, progress: None },
                    CollaboratorEvent::Percent(percent) => JobEvent {
                        message: format!("{} progress {:.0}%", label, percent),
                        level: LogLevel::Info,
                        progress: Some(percent / 100.0),
                    },
                };
                if events.send(job_event).is_err() {
                    break;
                }
            }
        });
        tx
    }
}

// ==============================================================================
// Job Runners
// ==============================================================================

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const fn transient() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(600),
            max_retries: 3,
        }
    }

    /// Ceiling for the `retry`-th retry (zero based), before jitter.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    fn task_name(&self) -> &'static str;

    fn started_detail(&self) -> &'static str;

    fn completed_detail(&self) -> &'static str {
        "task finished"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, JobError>;
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    runners: HashMap<&'static str, Arc<dyn JobRunner>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn JobRunner>) {
        self.runners.insert(runner.task_name(), runner);
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(task_name).cloned()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runners.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

// ==============================================================================
// Worker
// ==============================================================================

/// Pulls task messages off the broker and executes them under a tracker.
pub struct WorkerRuntime {
    broker: Arc<dyn Broker>,
    repository: Arc<dyn TaskRepository>,
    notifier: NotificationDispatcher,
    registry: JobRegistry,
    concurrency: usize,
    poll_wait: Duration,
}

impl WorkerRuntime {
    pub fn new(
        broker: Arc<dyn Broker>,
        repository: Arc<dyn TaskRepository>,
        notifier: NotificationDispatcher,
        registry: JobRegistry,
        concurrency: usize,
    ) -> Self {
        Self {
            broker,
            repository,
            notifier,
            registry,
            concurrency: concurrency.max(1),
            poll_wait: Duration::from_secs(1),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Consumes the queue until `shutdown` fires, then waits for in-flight tasks.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        match self.broker.recover().await {
            Ok(0) => {}
            Ok(n) => warn!("🔄 Re-queued {} task(s) left unfinished by a previous run", n),
            Err(e) => error!("❌ Failed to recover unacknowledged tasks: {}", e),
        }

        info!(
            "🚀 Worker started (concurrency: {}, tasks: {:?})",
            self.concurrency,
            self.registry.task_names()
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown.recv() => break,
                received = self.broker.receive(self.poll_wait) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let runtime = self.clone();
                    in_flight.spawn(async move {
                        let task_id = message.id.clone();
                        runtime.execute(message).await;
                        if let Err(e) = runtime.broker.ack(&task_id).await {
                            warn!(task_id = %task_id, "⚠️  Failed to acknowledge task: {}", e);
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("❌ Failed to receive from broker: {}", e);
                    tokio::time::sleep(self.poll_wait).await;
                }
            }

            while in_flight.try_join_next().is_some() {}
        }

        info!("🛑 Worker stopping, waiting for {} in-flight task(s)", in_flight.len());
        while in_flight.join_next().await.is_some() {}
    }

    /// Runs one message to a terminal state and returns it.
    pub async fn execute(&self, message: TaskMessage) -> TaskState {
        let payload = message.payload();
        let mut tracker = TaskLifecycleTracker::new(
            &message.id,
            &message.task_name,
            self.broker.clone(),
            self.repository.clone(),
            self.notifier.clone(),
        );
        tracker.created("task received", payload.clone()).await;

        let Some(runner) = self.registry.get(&message.task_name) else {
            warn!(task_id = %message.id, "⚠️  No runner registered for {}", message.task_name);
            tracker.fail(&format!("unknown task: {}", message.task_name)).await;
            return tracker.state();
        };

        let policy = runner.retry_policy();
        let mut attempt: u32 = 1;
        loop {
            tracker.started(runner.started_detail(), attempt).await;

            match self.run_attempt(runner.as_ref(), &mut tracker, payload.clone()).await {
                Ok(result) => {
                    tracker.complete(runner.completed_detail(), result).await;
                    break;
                }
                Err(err) => {
                    let reason = err.to_string();
                    let retry = policy.filter(|p| err.is_transient() && attempt <= p.max_retries);
                    match retry {
                        Some(policy) => {
                            let delay = policy.delay_for(attempt - 1);
                            tracker.retrying(&reason, attempt + 1, delay.as_secs_f64()).await;
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            tracker.fail(&reason).await;
                            break;
                        }
                    }
                }
            }
        }

        tracker.state()
    }

    /// Drives the job body while feeding its events into the tracker. A panic
    /// in the body is turned into an unexpected fault.
    async fn run_attempt(
        &self,
        runner: &dyn JobRunner,
        tracker: &mut TaskLifecycleTracker,
        payload: Value,
    ) -> Result<Value, JobError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = JobContext::new(tracker.task_id(), payload, tx);

        let body = AssertUnwindSafe(runner.run(ctx)).catch_unwind();
        tokio::pin!(body);

        let outcome = loop {
            tokio::select! {
                outcome = &mut body => break outcome,
                Some(event) = rx.recv() => tracker.progress(event).await,
            }
        };

        // forwarders hold senders until their collaborator call has returned
        while let Some(event) = rx.recv().await {
            tracker.progress(event).await;
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => Err(JobError::Unexpected(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTaskRepository;
    use crate::external::broker::InMemoryBroker;
    use crate::models::TaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyJob {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl JobRunner for FlakyJob {
        fn task_name(&self) -> &'static str {
            "orchestrator.download_data"
        }
        fn started_detail(&self) -> &'static str {
            "download started"
        }
        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy { base: Duration::from_millis(1), cap: Duration::from_millis(2), max_retries: 3 })
        }
        async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.progress("working", 0.5);
            if call < self.succeed_on {
                return Err(JobError::Transient("connection reset".into()));
            }
            Ok(json!({"calls": call}))
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl JobRunner for PanickingJob {
        fn task_name(&self) -> &'static str {
            "orchestrator.pipeline"
        }
        fn started_detail(&self) -> &'static str {
            "pipeline started"
        }
        async fn run(&self, _ctx: JobContext) -> Result<Value, JobError> {
            panic!("engine exploded");
        }
    }

    fn runtime(runner: Arc<dyn JobRunner>) -> (WorkerRuntime, Arc<InMemoryTaskRepository>) {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());
        let mut registry = JobRegistry::new();
        registry.register(runner);
        let runtime = WorkerRuntime::new(broker, repository.clone(), NotificationDispatcher::default(), registry, 2);
        (runtime, repository)
    }

    #[test]
    fn test_retry_ceiling_is_capped() {
        let policy = RetryPolicy::transient();
        assert_eq!(policy.ceiling(0), Duration::from_secs(1));
        assert_eq!(policy.ceiling(3), Duration::from_secs(8));
        assert_eq!(policy.ceiling(15), Duration::from_secs(600));
        for retry in 0..5 {
            assert!(policy.delay_for(retry) <= policy.ceiling(retry));
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_completes() {
        let job = Arc::new(FlakyJob { calls: AtomicU32::new(0), succeed_on: 3 });
        let (runtime, repository) = runtime(job.clone());
        let message = TaskMessage::new("orchestrator.download_data", vec![json!({})], Default::default());
        let id = message.id.clone();

        assert_eq!(runtime.execute(message).await, TaskState::Success);
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);

        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.unwrap()["calls"], 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let job = Arc::new(FlakyJob { calls: AtomicU32::new(0), succeed_on: u32::MAX });
        let (runtime, repository) = runtime(job.clone());
        let message = TaskMessage::new("orchestrator.download_data", vec![json!({})], Default::default());
        let id = message.id.clone();

        assert_eq!(runtime.execute(message).await, TaskState::Failure);
        assert_eq!(job.calls.load(Ordering::SeqCst), 4);
        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.detail.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_unexpected_fault() {
        let (runtime, repository) = runtime(Arc::new(PanickingJob));
        let message = TaskMessage::new("orchestrator.pipeline", vec![json!({})], Default::default());
        let id = message.id.clone();

        assert_eq!(runtime.execute(message).await, TaskState::Failure);
        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.detail.as_deref(), Some("unexpected fault: engine exploded"));
    }

    #[tokio::test]
    async fn test_unknown_task_name_is_failed() {
        let (runtime, repository) = runtime(Arc::new(PanickingJob));
        let message = TaskMessage::new("orchestrator.nope", vec![], Default::default());
        let id = message.id.clone();

        assert_eq!(runtime.execute(message).await, TaskState::Failure);
        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_worker_loop_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());
        let mut registry = JobRegistry::new();
        registry.register(Arc::new(FlakyJob { calls: AtomicU32::new(0), succeed_on: 1 }));
        let runtime = Arc::new(
            WorkerRuntime::new(broker.clone(), repository.clone(), NotificationDispatcher::default(), registry, 1)
                .with_poll_wait(Duration::from_millis(10)),
        );

        let message = TaskMessage::new("orchestrator.download_data", vec![json!({})], Default::default());
        let id = message.id.clone();
        broker.send_task(&message).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(runtime.run(shutdown_rx));

        for _ in 0..100 {
            if let Some(record) = repository.get_task(&id).await.unwrap() {
                if record.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(broker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_boot_redelivers_unacknowledged_task() {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());

        // a previous consumer took the message and died before finishing it
        let message = TaskMessage::new("orchestrator.download_data", vec![json!({})], Default::default());
        let id = message.id.clone();
        broker.send_task(&message).await.unwrap();
        let _lost = broker.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(broker.receive(Duration::from_millis(10)).await.unwrap().is_none());

        let mut registry = JobRegistry::new();
        registry.register(Arc::new(FlakyJob { calls: AtomicU32::new(0), succeed_on: 1 }));
        let runtime = Arc::new(
            WorkerRuntime::new(broker.clone(), repository.clone(), NotificationDispatcher::default(), registry, 1)
                .with_poll_wait(Duration::from_millis(10)),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(runtime.run(shutdown_rx));

        for _ in 0..100 {
            if broker.in_flight_count() == 0 {
                if let Some(record) = repository.get_task(&id).await.unwrap() {
                    if record.status.is_terminal() {
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let record = repository.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(broker.in_flight_count(), 0);
    }
}
