//! Status message delivery.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Notifier, RunStatus, StatusMessage};
use crate::error::{PipelineError, PipelineResult};

/// Writes status messages to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &StatusMessage) -> PipelineResult<()> {
        let body = serde_json::to_string(message)?;
        match message.status {
            RunStatus::Success | RunStatus::PartialSuccess => info!(
                run_id = %message.run_id,
                status = %message.status,
                subject = %message.subject,
                payload = %body,
                "Pipeline status"
            ),
            _ => warn!(
                run_id = %message.run_id,
                status = %message.status,
                subject = %message.subject,
                payload = %body,
                "Pipeline status"
            ),
        }
        Ok(())
    }
}

/// POSTs status messages as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &StatusMessage) -> PipelineResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| PipelineError::Notify(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Notify(format!("Status {}: {}", status, body)));
        }

        info!(run_id = %message.run_id, status = %message.status, url = %self.url, "Status delivered");
        Ok(())
    }
}
