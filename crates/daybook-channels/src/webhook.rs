//! Chat-webhook reminder delivery.
//!
//! Reminder nudges go out as an HTTP POST to the configured chat-bot
//! webhook (the bot bridges to whatever surface the user paired — SMS or
//! chat). The webhook owns routing; we send user id and message.

use async_trait::async_trait;
use daybook_core::config::NotifyConfig;
use daybook_core::error::{DaybookError, Result};
use daybook_engine::worker::ReminderNotifier;

/// Delivers nudges to a chat-bot webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotifyConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ReminderNotifier for WebhookNotifier {
    async fn send_nudge(&self, user_id: &str, message: &str) -> Result<()> {
        if self.config.webhook_url.is_empty() {
            return Err(DaybookError::Config("notify.webhook_url not set".into()));
        }

        let mut req = self
            .client
            .post(&self.config.webhook_url)
            .json(&serde_json::json!({
                "user_id": user_id,
                "message": message,
            }))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DaybookError::Channel(format!("nudge webhook: {e}")))?;

        if resp.status().is_success() {
            tracing::info!(user_id, "reminder nudge delivered");
            Ok(())
        } else {
            let status = resp.status();
            Err(DaybookError::Channel(format!("nudge webhook {status}")))
        }
    }
}
