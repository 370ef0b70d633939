//! Notification queue.
//!
//! A single task owns the receiving end of a bounded channel and delivers
//! notifications one at a time, in enqueue order. A failing item is retried
//! in place (delaying everything behind it) and dropped once its budget is
//! spent. Enqueuing never reports delivery errors back to the caller.

use crate::config::NotifyConfig;
use crate::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    /// HTML body
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Transient mail failure: {0}")]
    Transient(String),

    #[error("Mail rejected: {0}")]
    Permanent(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transient(_))
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), MailError>;
}

/// Delivers through a transactional mail HTTP API.
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    sender: String,
}

impl HttpMailTransport {
    pub fn new(endpoint: &str, api_token: Option<String>, sender: &str) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MailError::Permanent(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_token,
            sender: sender.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, notification: &Notification) -> Result<(), MailError> {
        let payload = serde_json::json!({
            "from": self.sender,
            "to": notification.recipients,
            "subject": notification.subject,
            "html": notification.body,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_builder() {
                MailError::Permanent(e.to_string())
            } else {
                MailError::Transient(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(MailError::Transient(message))
        } else {
            Err(MailError::Permanent(message))
        }
    }
}

/// Writes notifications to the log; used when no mail endpoint is configured.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, notification: &Notification) -> Result<(), MailError> {
        info!(
            "Notification for {}: {}",
            notification.recipients.join(", "),
            notification.subject
        );
        Ok(())
    }
}

/// Pick the transport the configuration asks for.
pub fn transport_from_config(config: &NotifyConfig) -> Result<Arc<dyn MailTransport>, MailError> {
    match &config.endpoint {
        Some(endpoint) if !endpoint.is_empty() => Ok(Arc::new(HttpMailTransport::new(
            endpoint,
            config.api_token.clone(),
            &config.sender,
        )?)),
        _ => Ok(Arc::new(LogTransport)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub retry: RetryPolicy,
    /// Pause before the next item when one is already waiting
    pub inter_item_delay: Duration,
    pub capacity: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            inter_item_delay: Duration::from_secs(1),
            capacity: 64,
        }
    }
}

impl From<&NotifyConfig> for DeliveryPolicy {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            retry: RetryPolicy::new(config.max_attempts, Duration::from_secs(config.backoff_step_secs)),
            inter_item_delay: Duration::from_millis(config.inter_item_delay_ms),
            capacity: config.queue_capacity.max(1),
        }
    }
}

/// Handle to the delivery task. Cheap to clone.
///
/// The task exits once every handle is dropped and the backlog is drained.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn spawn(transport: Arc<dyn MailTransport>, policy: DeliveryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(policy.capacity);
        let handle = tokio::spawn(deliver_loop(rx, transport, policy));
        (Self { tx }, handle)
    }

    /// Append a notification without waiting. When the queue is full the
    /// notification is dropped and logged.
    pub fn enqueue(&self, notification: Notification) {
        if notification.recipients.is_empty() {
            debug!("Dropping notification without recipients: {}", notification.subject);
            return;
        }
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => warn!("Notification queue full, dropping: {}", n.subject),
            Err(TrySendError::Closed(n)) => warn!("Notification queue closed, dropping: {}", n.subject),
        }
    }
}

async fn deliver_loop(
    mut rx: mpsc::Receiver<Notification>,
    transport: Arc<dyn MailTransport>,
    policy: DeliveryPolicy,
) {
    let mut pending = rx.recv().await;

    while let Some(notification) = pending {
        deliver(transport.as_ref(), &policy.retry, &notification).await;

        pending = match rx.try_recv() {
            Ok(next) => {
                tokio::time::sleep(policy.inter_item_delay).await;
                Some(next)
            }
            Err(TryRecvError::Empty) => rx.recv().await,
            Err(TryRecvError::Disconnected) => None,
        };
    }

    debug!("Notification queue stopped");
}

async fn deliver(transport: &dyn MailTransport, policy: &RetryPolicy, notification: &Notification) {
    let label = format!("mail '{}'", notification.subject);
    let result = retry(policy, &label, MailError::is_transient, |_| transport.send(notification)).await;

    match result {
        Ok(()) => info!("Delivered notification '{}'", notification.subject),
        Err(e) => error!("Dropping notification '{}': {}", notification.subject, e),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn backup_succeeded(
    recipients: &[String],
    archive: &Path,
    downloaded: usize,
    failed_downloads: usize,
    encrypted: bool,
) -> Notification {
    let mut body = format!(
        "<h2>Media backup completed</h2>\
         <p>Archive: <code>{}</code></p>\
         <p>Assets downloaded: {}</p>",
        escape_html(&archive.display().to_string()),
        downloaded
    );
    if failed_downloads > 0 {
        body.push_str(&format!(
            "<p><strong>{} assets could not be downloaded.</strong></p>",
            failed_downloads
        ));
    }
    if encrypted {
        body.push_str("<p>The archive is encrypted. Keep the passphrase safe; it cannot be recovered.</p>");
    }

    Notification {
        subject: "Media backup completed".to_string(),
        body,
        recipients: recipients.to_vec(),
    }
}

pub fn backup_failed(recipients: &[String], error: &str) -> Notification {
    Notification {
        subject: "Media backup failed".to_string(),
        body: format!(
            "<h2>Media backup failed</h2><p>Error: {}</p>\
             <p>Re-run the backup once the cause is fixed.</p>",
            escape_html(error)
        ),
        recipients: recipients.to_vec(),
    }
}

pub fn passphrase_disclosure(recipients: &[String], passphrase: &str, archive: &Path) -> Notification {
    Notification {
        subject: "Media backup recovery key".to_string(),
        body: format!(
            "<h2>Backup recovery key</h2>\
             <p>The archive <code>{}</code> is encrypted with this passphrase:</p>\
             <pre>{}</pre>\
             <p>Store it offline and delete this message.</p>",
            escape_html(&archive.display().to_string()),
            escape_html(passphrase)
        ),
        recipients: recipients.to_vec(),
    }
}
