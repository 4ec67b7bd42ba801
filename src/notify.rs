//! Alert delivery

use crate::errors::{AlertError, MonitorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ALERT_TITLE: &str = "ThingSpeak Alarm";

/// Receives alarm notifications. Failures are reported to the caller but
/// never fail a refresh cycle.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, title: &str, message: &str) -> std::result::Result<(), AlertError>;
}

/// Writes alerts to the log at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, title: &str, message: &str) -> std::result::Result<(), AlertError> {
        warn!(alert = true, "{}: {}", title, message);
        Ok(())
    }
}

/// POSTs a JSON body `{title, message, timestamp}` to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("field_monitor/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MonitorError::Http)?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn raise(&self, title: &str, message: &str) -> std::result::Result<(), AlertError> {
        let body = json!({
            "title": title,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AlertError::new(format!("webhook returned {}: {}", status, text)));
        }

        debug!("Alert delivered to webhook {}", self.url);
        Ok(())
    }
}
