//! HTTP client for the AI polish service.
//!
//! Text in, text out. The service may be slow or down; callers treat every
//! failure as transient and fall back to the unpolished text.

use async_trait::async_trait;
use daybook_core::config::PolishConfig;
use daybook_core::error::{DaybookError, Result};
use daybook_engine::digest::Polisher;
use serde::Deserialize;

/// Client for the polish endpoint.
pub struct HttpPolisher {
    client: reqwest::Client,
    config: PolishConfig,
}

#[derive(Deserialize)]
struct PolishResponse {
    text: String,
}

impl HttpPolisher {
    pub fn new(config: PolishConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DaybookError::Config(format!("polish client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Polisher for HttpPolisher {
    async fn polish(&self, raw: &str, style: &str) -> Result<String> {
        let url = format!("{}/polish", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({ "text": raw, "style": style }))
            .send()
            .await
            .map_err(|e| DaybookError::Transient(format!("polish: {e}")))?;

        if !resp.status().is_success() {
            return Err(DaybookError::Transient(format!("polish {}", resp.status())));
        }
        let parsed: PolishResponse = resp
            .json()
            .await
            .map_err(|e| DaybookError::Transient(format!("polish response: {e}")))?;
        Ok(parsed.text)
    }
}
