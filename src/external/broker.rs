use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::errors::BrokerError;
use crate::models::{BrokerTaskState, TaskMessage};

/// Message-queue layer: carries submissions to workers and transient state back.
///
/// Delivery is at-least-once: a received message stays reserved for its
/// consumer until `ack`, and `recover` puts unacknowledged reservations back
/// on the queue. `store_state` overwrites, so repeated publishes of the same
/// snapshot are harmless.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn send_task(&self, message: &TaskMessage) -> Result<(), BrokerError>;

    /// Waits at most `wait` for the next message and reserves it.
    async fn receive(&self, wait: Duration) -> Result<Option<TaskMessage>, BrokerError>;

    /// Releases the reservation once the task reached a terminal state.
    async fn ack(&self, task_id: &str) -> Result<(), BrokerError>;

    /// Re-queues reservations left by a consumer that never acknowledged them.
    async fn recover(&self) -> Result<usize, BrokerError>;

    async fn store_state(&self, task_id: &str, state: &BrokerTaskState) -> Result<(), BrokerError>;

    async fn load_state(&self, task_id: &str) -> Result<Option<BrokerTaskState>, BrokerError>;
}

/// Embedded broker backed by a tokio channel and an expiring state table.
pub struct InMemoryBroker {
    sender: mpsc::UnboundedSender<TaskMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<TaskMessage>>,
    states: DashMap<String, (BrokerTaskState, Instant)>,
    in_flight: DashMap<String, TaskMessage>,
    result_expires: Duration,
}

impl InMemoryBroker {
    pub fn new(result_expires: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            states: DashMap::new(),
            in_flight: DashMap::new(),
            result_expires,
        }
    }

    /// Drops a task's transient state, as if it had expired.
    pub fn forget_state(&self, task_id: &str) {
        self.states.remove(task_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(86_400))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send_task(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        self.sender
            .send(message.clone())
            .map_err(|_| BrokerError::Closed)?;
        tracing::debug!(task_id = %message.id, task_name = %message.task_name, "Message enqueued");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(message)) => {
                self.in_flight.insert(message.id.clone(), message.clone());
                Ok(Some(message))
            }
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, task_id: &str) -> Result<(), BrokerError> {
        self.in_flight.remove(task_id);
        Ok(())
    }

    async fn recover(&self) -> Result<usize, BrokerError> {
        let ids: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        let mut recovered = 0;
        for id in ids {
            if let Some((_, message)) = self.in_flight.remove(&id) {
                self.sender.send(message).map_err(|_| BrokerError::Closed)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn store_state(&self, task_id: &str, state: &BrokerTaskState) -> Result<(), BrokerError> {
        let now = Instant::now();
        // expired snapshots nobody polled would otherwise accumulate
        self.states.retain(|_, (_, expires_at)| *expires_at > now);
        self.states
            .insert(task_id.to_string(), (state.clone(), now + self.result_expires));
        Ok(())
    }

    async fn load_state(&self, task_id: &str) -> Result<Option<BrokerTaskState>, BrokerError> {
        let expired = match self.states.get(task_id) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.states.remove(task_id);
        }
        Ok(None)
    }
}
