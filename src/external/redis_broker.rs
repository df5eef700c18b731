use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client;

use crate::errors::BrokerError;
use crate::external::broker::Broker;
use crate::models::{BrokerTaskState, TaskMessage};

const STATE_KEY_PREFIX: &str = "orchestrator:task-meta:";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Redis list queue plus per-task state keys with expiry.
///
/// Each receive atomically moves the next body from the queue onto this
/// worker's processing list (`LMOVE`), polling so one multiplexed connection
/// can serve both the queue and state traffic. `ack` removes the body with
/// `LREM`; `recover` moves whatever a previous run of the same worker left
/// behind back onto the queue.
pub struct RedisBroker {
    connection: ConnectionManager,
    queue: String,
    processing: String,
    reserved: DashMap<String, String>,
    result_expires: Duration,
}

impl RedisBroker {
    pub async fn connect(
        url: &str,
        queue: &str,
        worker_id: &str,
        result_expires: Duration,
    ) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let processing = Self::processing_key(queue, worker_id);
        tracing::info!("✅ Connected to Redis broker, queue '{}' (processing list '{}')", queue, processing);
        Ok(Self {
            connection,
            queue: queue.to_string(),
            processing,
            reserved: DashMap::new(),
            result_expires,
        })
    }

    fn processing_key(queue: &str, worker_id: &str) -> String {
        format!("{}:processing:{}", queue, worker_id)
    }

    fn state_key(task_id: &str) -> String {
        format!("{}{}", STATE_KEY_PREFIX, task_id)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn send_task(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let body = serde_json::to_string(message)?;
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(task_id = %message.id, task_name = %message.task_name, "Message pushed to Redis");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.connection.clone();
        loop {
            let body: Option<String> = redis::cmd("LMOVE")
                .arg(&self.queue)
                .arg(&self.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if let Some(body) = body {
                let message: TaskMessage = match serde_json::from_str(&body) {
                    Ok(message) => message,
                    Err(e) => {
                        // an unreadable body would be recovered forever
                        let _: i64 = redis::cmd("LREM")
                            .arg(&self.processing)
                            .arg(1)
                            .arg(&body)
                            .query_async(&mut conn)
                            .await?;
                        return Err(e.into());
                    }
                };
                self.reserved.insert(message.id.clone(), body);
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, task_id: &str) -> Result<(), BrokerError> {
        let Some((_, body)) = self.reserved.remove(task_id) else {
            return Ok(());
        };
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, BrokerError> {
        let mut conn = self.connection.clone();
        let mut recovered = 0;
        loop {
            let body: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if body.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!("🔄 Re-queued {} unacknowledged message(s) from '{}'", recovered, self.processing);
        }
        Ok(recovered)
    }

    async fn store_state(&self, task_id: &str, state: &BrokerTaskState) -> Result<(), BrokerError> {
        let body = serde_json::to_string(state)?;
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::state_key(task_id))
            .arg(body)
            .arg("EX")
            .arg(self.result_expires.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_state(&self, task_id: &str) -> Result<Option<BrokerTaskState>, BrokerError> {
        let mut conn = self.connection.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(Self::state_key(task_id))
            .query_async(&mut conn)
            .await?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}
