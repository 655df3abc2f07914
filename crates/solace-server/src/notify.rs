//! Delivery of side-channel notifications.
//!
//! Email, SMS and push delivery belong to external providers; a [`Notifier`]
//! only hands the payload over.

use async_trait::async_trait;
use solace_types::NotificationPayload;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification provider unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &NotificationPayload) -> Result<(), NotifyError> {
        tracing::info!(
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            subject = notification.subject.as_deref().unwrap_or(""),
            "notification dispatched"
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notification: &NotificationPayload) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(NotifyError::Unavailable(format!("HTTP {}", status.as_u16())))
        } else {
            Err(NotifyError::Rejected(format!("HTTP {}", status.as_u16())))
        }
    }
}
