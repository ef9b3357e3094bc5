//! Operator notifications for server-side failures.
//!
//! Requests never wait on delivery: notifications are pushed onto a bounded
//! queue and a background task hands them to the configured [`Notifier`],
//! one at a time, each bounded by its own timeout.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notification rejected by `{target}` with status {status}")]
    Rejected { target: String, status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, message: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub message: String,
}

/// Handle for enqueueing notifications. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    /// Spawn the delivery task. It exits once every queue handle is dropped
    /// and the backlog is drained.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(deliver(notifier, receiver, timeout));
        (Self { sender }, handle)
    }

    /// Enqueue without waiting. Returns `false` when the notification was
    /// dropped.
    pub fn notify(&self, subject: impl Into<String>, message: impl Into<String>) -> bool {
        let notification = Notification {
            subject: subject.into(),
            message: message.into(),
        };
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                metrics::counter!("folio_notifications_dropped_total").increment(1);
                warn!(
                    target = "folio::notify",
                    subject = %dropped.subject,
                    "Notification queue full, dropping notification"
                );
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(
                    target = "folio::notify",
                    subject = %dropped.subject,
                    "Notification worker stopped, dropping notification"
                );
                false
            }
        }
    }
}

async fn deliver(
    notifier: Arc<dyn Notifier>,
    mut receiver: mpsc::Receiver<Notification>,
    timeout: Duration,
) {
    while let Some(notification) = receiver.recv().await {
        let sent = tokio::time::timeout(
            timeout,
            notifier.send(&notification.subject, &notification.message),
        )
        .await;
        match sent {
            Ok(Ok(())) => debug!(
                target = "folio::notify",
                subject = %notification.subject,
                "Notification delivered"
            ),
            Ok(Err(err)) => warn!(
                target = "folio::notify",
                subject = %notification.subject,
                error = %err,
                "Failed to deliver notification"
            ),
            Err(_) => warn!(
                target = "folio::notify",
                subject = %notification.subject,
                timeout_ms = timeout.as_millis() as u64,
                "Notification delivery timed out"
            ),
        }
    }
}
