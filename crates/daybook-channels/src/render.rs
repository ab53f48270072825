//! HTTP client for the document render service.
//!
//! Ships a period's entries to the render service and gets back a
//! print-ready PDF with its page count. Rendering itself is out of scope —
//! this adapter only owns the wire exchange.

use async_trait::async_trait;
use base64::Engine as _;
use daybook_core::config::RenderConfig;
use daybook_core::error::{DaybookError, Result};
use daybook_core::types::Entry;
use daybook_engine::vendor::{DocumentRenderer, RenderedDocument};
use serde::Deserialize;

/// Client for the render endpoint.
pub struct HttpRenderer {
    client: reqwest::Client,
    config: RenderConfig,
}

#[derive(Deserialize)]
struct RenderResponse {
    document_b64: String,
    page_count: u32,
}

impl HttpRenderer {
    pub fn new(config: RenderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DaybookError::Config(format!("render client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DocumentRenderer for HttpRenderer {
    async fn render(
        &self,
        user_id: &str,
        entries: &[Entry],
        color: bool,
    ) -> Result<RenderedDocument> {
        let url = format!("{}/render", self.config.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "user_id": user_id,
            "color": color,
            "entries": entries
                .iter()
                .map(|e| serde_json::json!({
                    "date": e.entry_date,
                    "type": e.entry_type.as_str(),
                    "body": e.body,
                }))
                .collect::<Vec<_>>(),
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DaybookError::Transient(format!("render: {e}")))?;

        if !resp.status().is_success() {
            return Err(DaybookError::Transient(format!("render {}", resp.status())));
        }
        let parsed: RenderResponse = resp
            .json()
            .await
            .map_err(|e| DaybookError::Transient(format!("render response: {e}")))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(&parsed.document_b64)
            .map_err(|e| DaybookError::Transient(format!("render payload: {e}")))?;

        tracing::debug!(user_id, pages = parsed.page_count, "document rendered");
        Ok(RenderedDocument {
            data,
            page_count: parsed.page_count,
        })
    }
}
