use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::db::TaskRepository;
use crate::errors::NotificationError;
use crate::models::TaskEvent;

/// Log lines carried by a failure notification.
pub const FAILURE_LOG_TAIL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Failure,
    Retry,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Failure => "failure",
            NotificationKind::Retry => "retry",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn accepts(&self, kind: NotificationKind) -> bool;
    async fn deliver(&self, kind: NotificationKind, event: &TaskEvent) -> Result<(), NotificationError>;
}

// ==============================================================================
// Notification Dispatcher
// ==============================================================================

/// Fans lifecycle events out to every sink that accepts them.
///
/// Sink failures are logged and swallowed; a notification can never fail the
/// task that produced it.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Event log always; email and webhook only when configured.
    pub fn from_config(
        repository: Arc<dyn TaskRepository>,
        smtp: &SmtpConfig,
        webhook_url: Option<&str>,
    ) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(EventLogSink::new(repository))];

        match EmailSink::from_config(smtp) {
            Ok(Some(email)) => sinks.push(Arc::new(email)),
            Ok(None) => debug!("Email notifications disabled (no SMTP host or recipients)"),
            Err(e) => warn!("⚠️  Email notifications disabled: {}", e),
        }

        if let Some(url) = webhook_url {
            match WebhookSink::new(url) {
                Ok(webhook) => sinks.push(Arc::new(webhook)),
                Err(e) => warn!("⚠️  Webhook notifications disabled: {}", e),
            }
        }

        Self { sinks }
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub async fn notify_success(&self, event: &TaskEvent) {
        self.dispatch(NotificationKind::Success, event).await;
    }

    pub async fn notify_failure(&self, event: &TaskEvent) {
        let mut event = event.clone();
        if let Some(meta) = event.meta.as_mut() {
            let keep = meta.log_tail(FAILURE_LOG_TAIL).to_vec();
            meta.logs = keep;
        }
        self.dispatch(NotificationKind::Failure, &event).await;
    }

    pub async fn notify_retry(&self, event: &TaskEvent) {
        self.dispatch(NotificationKind::Retry, event).await;
    }

    async fn dispatch(&self, kind: NotificationKind, event: &TaskEvent) {
        for sink in self.sinks.iter().filter(|s| s.accepts(kind)) {
            if let Err(e) = sink.deliver(kind, event).await {
                warn!(
                    task_id = %event.task_id,
                    sink = sink.name(),
                    kind = kind.as_str(),
                    "⚠️  Notification delivery failed: {}",
                    e
                );
            }
        }
    }
}

// ==============================================================================
// Event Log Sink
// ==============================================================================

pub struct EventLogSink {
    repository: Arc<dyn TaskRepository>,
}

impl EventLogSink {
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl NotificationSink for EventLogSink {
    fn name(&self) -> &'static str {
        "event_log"
    }

    fn accepts(&self, _kind: NotificationKind) -> bool {
        true
    }

    async fn deliver(&self, _kind: NotificationKind, event: &TaskEvent) -> Result<(), NotificationError> {
        self.repository.record_event(event).await?;
        Ok(())
    }
}

// ==============================================================================
// Email Sink
// ==============================================================================

pub struct EmailSink {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailSink {
    /// `Ok(None)` when email delivery is not configured.
    pub fn from_config(config: &SmtpConfig) -> Result<Option<Self>, NotificationError> {
        let Some(host) = config.host.as_deref() else {
            return Ok(None);
        };
        if config.recipients.is_empty() {
            return Ok(None);
        }

        let sender = config
            .sender
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::Email(format!("invalid sender address: {}", e)))?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| {
                r.parse::<Mailbox>()
                    .map_err(|e| NotificationError::Email(format!("invalid recipient {}: {}", r, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| NotificationError::Email(format!("failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder.port(config.port).timeout(Some(Duration::from_secs(10)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Some(Self {
            mailer: builder.build(),
            sender,
            recipients,
        }))
    }
}

pub fn failure_subject(task_id: &str) -> String {
    format!("task failed - {}", task_id)
}

/// Plain-text failure summary followed by the recent log tail.
pub fn failure_body(event: &TaskEvent) -> String {
    let mut body = format!(
        "Task {} ({}) failed with state {}: {}\n",
        event.task_id,
        event.task_type,
        event.state.as_str(),
        event.message
    );
    if let Some(meta) = &event.meta {
        if !meta.logs.is_empty() {
            body.push_str("\nRecent log:\n");
            for entry in &meta.logs {
                body.push_str(&format!(
                    "{} [{:?}] {}\n",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    entry.level,
                    entry.message
                ));
            }
        }
    }
    body
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    fn accepts(&self, kind: NotificationKind) -> bool {
        kind == NotificationKind::Failure
    }

    async fn deliver(&self, _kind: NotificationKind, event: &TaskEvent) -> Result<(), NotificationError> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(failure_subject(&event.task_id))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let email = builder
            .body(failure_body(event))
            .map_err(|e| NotificationError::Email(format!("failed to build email: {}", e)))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| NotificationError::Email(format!("SMTP send failed: {}", e)))?;

        debug!(task_id = %event.task_id, "📧 Failure email sent to {} recipient(s)", self.recipients.len());
        Ok(())
    }
}

// ==============================================================================
// Webhook Sink
// ==============================================================================

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

pub fn webhook_payload(kind: NotificationKind, event: &TaskEvent) -> serde_json::Value {
    let mut payload = json!({
        "task_id": event.task_id,
        "state": event.state,
        "message": event.message,
        "meta": event.meta,
    });
    if kind == NotificationKind::Retry {
        payload["type"] = json!("retry");
    }
    payload
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn accepts(&self, kind: NotificationKind) -> bool {
        matches!(kind, NotificationKind::Failure | NotificationKind::Retry)
    }

    async fn deliver(&self, kind: NotificationKind, event: &TaskEvent) -> Result<(), NotificationError> {
        self.client
            .post(&self.url)
            .json(&webhook_payload(kind, event))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
