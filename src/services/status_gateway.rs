use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::Serialize;
use tracing::warn;

use crate::db::TaskRepository;
use crate::errors::RepositoryError;
use crate::external::broker::Broker;
use crate::models::{TaskRecord, TaskStatusEnvelope};

/// One frame of a status stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusUpdate {
    Status(TaskStatusEnvelope),
    NotFound { detail: String, task_id: String },
}

/// Read model merging broker-visible and durable task state.
#[derive(Clone)]
pub struct RealtimeStatusGateway {
    broker: Arc<dyn Broker>,
    repository: Arc<dyn TaskRepository>,
    interval: Duration,
}

impl RealtimeStatusGateway {
    pub fn new(broker: Arc<dyn Broker>, repository: Arc<dyn TaskRepository>, interval: Duration) -> Self {
        Self { broker, repository, interval }
    }

    /// Transient state first; the durable record fills in a missing result or
    /// stands in entirely when the broker has nothing. `None` means unknown.
    pub async fn poll(&self, task_id: &str) -> Result<Option<TaskStatusEnvelope>, RepositoryError> {
        let transient = match self.broker.load_state(task_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(task_id = %task_id, "⚠️  Broker state unavailable, using durable copy: {}", e);
                None
            }
        };

        let Some(transient) = transient else {
            let record = self.repository.get_task(task_id).await?;
            return Ok(record.map(|r| envelope_from_record(&r)));
        };

        let meta = transient.meta;
        let mut envelope = TaskStatusEnvelope {
            id: task_id.to_string(),
            state: transient.state,
            status: Some(meta.status),
            detail: Some(meta.detail),
            progress: Some(meta.progress),
            logs: meta.logs,
            result: meta.result,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
        };

        if envelope.result.is_none() {
            match self.repository.get_task(task_id).await {
                Ok(Some(record)) => {
                    envelope.result = record.result.or_else(|| record.meta.and_then(|m| m.result));
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, "⚠️  Durable lookup failed: {}", e),
            }
        }

        Ok(Some(envelope))
    }

    /// Streams envelopes until the task is terminal. Structurally identical
    /// consecutive envelopes are suppressed and only the latest state is ever
    /// read, so a slow consumer never builds a backlog.
    pub fn watch(&self, task_id: String) -> impl Stream<Item = StatusUpdate> + Send + 'static {
        struct WatchState {
            gateway: RealtimeStatusGateway,
            task_id: String,
            last: Option<TaskStatusEnvelope>,
            first: bool,
            done: bool,
        }

        let initial = WatchState {
            gateway: self.clone(),
            task_id,
            last: None,
            first: true,
            done: false,
        };

        stream::unfold(initial, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                if !st.first {
                    tokio::time::sleep(st.gateway.interval).await;
                }
                st.first = false;

                let envelope = match st.gateway.poll(&st.task_id).await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => {
                        st.done = true;
                        let frame = StatusUpdate::NotFound {
                            detail: "task not found".to_string(),
                            task_id: st.task_id.clone(),
                        };
                        return Some((frame, st));
                    }
                    Err(e) => {
                        warn!(task_id = %st.task_id, "⚠️  Status poll failed: {}", e);
                        continue;
                    }
                };

                let terminal = envelope.state.is_terminal();
                if st.last.as_ref() == Some(&envelope) {
                    if terminal {
                        return None;
                    }
                    continue;
                }

                st.last = Some(envelope.clone());
                st.done = terminal;
                return Some((StatusUpdate::Status(envelope), st));
            }
        })
    }
}

fn envelope_from_record(record: &TaskRecord) -> TaskStatusEnvelope {
    let meta = record.meta.as_ref();
    TaskStatusEnvelope {
        id: record.id.clone(),
        state: record.status.as_state(),
        status: Some(record.status),
        detail: record.detail.clone().or_else(|| meta.map(|m| m.detail.clone())),
        progress: Some(record.progress),
        logs: meta.map(|m| m.logs.clone()).unwrap_or_default(),
        result: record.result.clone().or_else(|| meta.and_then(|m| m.result.clone())),
        started_at: record.started_at,
        finished_at: record.finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTaskRepository;
    use crate::external::broker::InMemoryBroker;
    use crate::models::{BrokerTaskState, TaskMetadata, TaskState, TaskStatus};
    use serde_json::{json, Value};

    fn gateway() -> (RealtimeStatusGateway, Arc<InMemoryBroker>, Arc<InMemoryTaskRepository>) {
        let broker = Arc::new(InMemoryBroker::default());
        let repository = Arc::new(InMemoryTaskRepository::new());
        let gateway = RealtimeStatusGateway::new(broker.clone(), repository.clone(), Duration::from_millis(5));
        (gateway, broker, repository)
    }

    #[tokio::test]
    async fn test_poll_unknown_task_is_none() {
        let (gateway, _, _) = gateway();
        assert!(gateway.poll("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_fills_result_from_durable_record() {
        let (gateway, broker, repository) = gateway();
        let mut record = TaskRecord::new("t1", "orchestrator.backtest", "done", Value::Null);
        record.status = TaskStatus::Completed;
        record.result = Some(json!({"result_path": "/tmp/r"}));
        repository.insert_task(record);

        let mut meta = TaskMetadata::new("finished");
        meta.status = TaskStatus::Completed;
        broker
            .store_state("t1", &BrokerTaskState { state: TaskState::Success, meta })
            .await
            .unwrap();

        let envelope = gateway.poll("t1").await.unwrap().unwrap();
        assert_eq!(envelope.state, TaskState::Success);
        assert_eq!(envelope.result.unwrap()["result_path"], "/tmp/r");
    }

    #[tokio::test]
    async fn test_poll_falls_back_to_record_when_transient_expired() {
        let (gateway, _, repository) = gateway();
        let mut record = TaskRecord::new("t2", "orchestrator.cleanup", "failed hard", Value::Null);
        record.status = TaskStatus::Failed;
        repository.insert_task(record);

        let envelope = gateway.poll("t2").await.unwrap().unwrap();
        assert_eq!(envelope.state, TaskState::Failure);
        assert_eq!(envelope.detail.as_deref(), Some("failed hard"));
    }
}
