use super::sink::{EventSink, RunEvent};
use crate::backup::RunRecord;
use crate::config::{WebhookConfig, WebhookFormat};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Posts the outcome of every finished cycle to an HTTP endpoint.
pub struct WebhookSink {
    config: WebhookConfig,
    client: Client,
}

impl WebhookSink {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pg-backup-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let response = self.client.post(&self.config.url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Notify(format!(
                "webhook returned {} - {}",
                status, text
            )));
        }
        debug!("Webhook notified: {}", status_line(&body));
        Ok(())
    }
}

fn status_line(body: &serde_json::Value) -> String {
    body.get("content")
        .and_then(|c| c.as_str())
        .and_then(|c| c.lines().next())
        .map(str::to_string)
        .unwrap_or_else(|| "json payload".to_string())
}

/// Chat-style message body (Discord / Slack-compatible `content` field).
pub fn message_content(record: &RunRecord) -> String {
    let status = if record.outcome.is_success() { "Success" } else { "FAILED" };
    let mut message = format!(
        "**Database Backup {}**\n\n\
         **Job:** `{}`\n\
         **Started:** {}\n\
         **Duration:** {} seconds\n\
         **Attempts:** {}",
        status,
        record.job,
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        record.duration_secs(),
        record.attempts,
    );

    if let Some(artifact) = &record.artifact {
        message.push_str(&format!(
            "\n**Artifact:** `{}`\n**Size:** {:.2} MB\n**SHA256:** `{}`",
            artifact.location,
            artifact.size as f64 / 1_048_576.0,
            artifact.checksum.as_deref().unwrap_or("N/A")
        ));
    }
    if !record.pruned.is_empty() {
        message.push_str(&format!("\n**Pruned:** {}", record.pruned.len()));
    }
    if !record.prune_failures.is_empty() {
        message.push_str(&format!("\n**Prune failures:** {}", record.prune_failures.len()));
    }
    if let Some(error) = &record.error {
        message.push_str(&format!("\n**Error:** {}", error));
    }
    message
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn emit(&self, event: &RunEvent) -> Result<()> {
        let RunEvent::Finished(record) = event else {
            return Ok(());
        };
        if record.outcome.is_success() && !self.config.notify_on_success {
            return Ok(());
        }

        let body = match self.config.format {
            WebhookFormat::Json => serde_json::to_value(record)
                .map_err(|e| BackupError::Serialization(e.to_string()))?,
            WebhookFormat::Discord => serde_json::json!({ "content": message_content(record) }),
        };
        self.post(body).await
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
