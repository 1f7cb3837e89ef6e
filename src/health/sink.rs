//! Notification sinks.
//!
//! The chat endpoint is an incoming webhook accepting `{"text": "..."}`. Without a
//! webhook configured, notifications only go to the log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::{AppResult, RunControlError};

/// Destination for operator notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Posts one message.
    async fn post(&self, message: &str) -> AppResult<()>;
}

/// Posts to `sink`, logging instead of failing when delivery does not work.
pub async fn deliver(sink: &dyn NotificationSink, message: &str) {
    if let Err(e) = sink.post(message).await {
        warn!(error = %e, %message, "Failed to deliver notification");
    }
}

/// Incoming-webhook sink.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// Creates a sink posting to `url` with the given request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn post(&self, message: &str) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| RunControlError::ExternalService {
                service: "Notification webhook",
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(RunControlError::ExternalService {
                service: "Notification webhook",
                detail: format!("status {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn post(&self, message: &str) -> AppResult<()> {
        info!(target: "notifications", "{message}");
        Ok(())
    }
}

/// Webhook sink if a URL is configured, log sink otherwise.
pub fn sink_from_settings(config: &NotificationConfig) -> Arc<dyn NotificationSink> {
    match &config.webhook_url {
        Some(url) if !url.is_empty() => Arc::new(WebhookSink::new(url.clone(), config.request_timeout)),
        _ => Arc::new(LogSink),
    }
}
