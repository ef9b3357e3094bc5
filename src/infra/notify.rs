use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{error, info};

use crate::application::notify::{Notifier, NotifyError};

use super::error::InfraError;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    text: &'a str,
}

/// Posts `{"title", "text"}` JSON to every configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhooks: Vec<Url>,
}

impl WebhookNotifier {
    pub fn new(webhooks: Vec<Url>, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::configuration(format!("webhook client: {err}")))?;
        Ok(Self { client, webhooks })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, message: &str) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            title: subject,
            text: message,
        };

        let mut failures = Vec::new();
        for webhook in &self.webhooks {
            // Only the host is logged; webhook paths usually embed a secret.
            let target = webhook.host_str().unwrap_or("webhook").to_string();
            match self.client.post(webhook.clone()).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => failures.push(NotifyError::Rejected {
                    target,
                    status: resp.status().as_u16(),
                }),
                Err(err) => failures.push(NotifyError::Delivery(format!("{target}: {err}"))),
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(NotifyError::Delivery(
                failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

/// Fallback used when no webhook is configured: the notification is only
/// written to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, message: &str) -> Result<(), NotifyError> {
        error!(
            target = "folio::notify",
            subject,
            message,
            "Operator notification"
        );
        Ok(())
    }
}

/// Pick the notifier for the configured webhooks.
pub fn build_notifier(
    webhooks: &[Url],
    timeout: Duration,
) -> Result<Arc<dyn Notifier>, InfraError> {
    if webhooks.is_empty() {
        info!(target = "folio::notify", "Notifications: logging only");
        return Ok(Arc::new(LogNotifier));
    }
    info!(
        target = "folio::notify",
        webhooks = webhooks.len(),
        "Notifications: using webhooks"
    );
    Ok(Arc::new(WebhookNotifier::new(webhooks.to_vec(), timeout)?))
}
