//! Print vendor gateway — submit rendered books, poll job status.
//!
//! The vendor's document rendering and shipping are opaque; this module owns
//! only the contract the order state machine depends on: what `submit`
//! returns, and how status reports map onto transitions. HTTP failures are
//! classified here so the pipeline sees the error taxonomy, not status codes.

use async_trait::async_trait;
use base64::Engine as _;
use daybook_core::error::{DaybookError, Result};
use daybook_core::types::Entry;
use serde::Deserialize;

/// A rendered, print-ready artifact.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub data: Vec<u8>,
    pub page_count: u32,
}

/// Renders a user's entries into a print-ready document. Opaque collaborator.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, user_id: &str, entries: &[Entry], color: bool)
    -> Result<RenderedDocument>;
}

/// Result of a successful job submission.
#[derive(Debug, Clone)]
pub struct VendorSubmission {
    pub job_id: String,
    pub cost_cents: Option<i64>,
    pub retail_cents: Option<i64>,
}

/// Vendor-side job progress, as reported by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorJobState {
    InProduction,
    Shipped,
    Delivered,
    Error,
}

impl VendorJobState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_production" | "accepted" | "printing" => Some(VendorJobState::InProduction),
            "shipped" => Some(VendorJobState::Shipped),
            "delivered" => Some(VendorJobState::Delivered),
            "error" | "rejected" | "canceled" => Some(VendorJobState::Error),
            _ => None,
        }
    }
}

/// One status report for a submitted job.
#[derive(Debug, Clone)]
pub struct VendorStatusReport {
    pub state: VendorJobState,
    pub tracking_url: Option<String>,
    pub cost_cents: Option<i64>,
    pub message: Option<String>,
}

/// The vendor's submit/status API.
#[async_trait]
pub trait VendorGateway: Send + Sync {
    /// Submit a rendered document for printing and shipping. Payment is
    /// captured by the vendor at acceptance.
    async fn submit(
        &self,
        document: &RenderedDocument,
        shipping_address: &str,
        color: bool,
    ) -> Result<VendorSubmission>;

    /// Poll the status of a previously submitted job.
    async fn poll_status(&self, job_id: &str) -> Result<VendorStatusReport>;
}

/// HTTP implementation of the vendor API.
pub struct HttpVendorGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
    #[serde(default)]
    cost_cents: Option<i64>,
    #[serde(default)]
    retail_cents: Option<i64>,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    tracking_url: Option<String>,
    #[serde(default)]
    cost_cents: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpVendorGateway {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| DaybookError::Config(format!("vendor client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Map an error response to the taxonomy the state machine expects.
    async fn classify_failure(resp: reqwest::Response) -> DaybookError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 402 {
            DaybookError::PaymentDeclined(body)
        } else if status.is_server_error() {
            DaybookError::Transient(format!("vendor {status}: {body}"))
        } else {
            DaybookError::VendorRejected(format!("vendor {status}: {body}"))
        }
    }
}

#[async_trait]
impl VendorGateway for HttpVendorGateway {
    async fn submit(
        &self,
        document: &RenderedDocument,
        shipping_address: &str,
        color: bool,
    ) -> Result<VendorSubmission> {
        let url = format!("{}/print-jobs", self.base_url);
        let payload = serde_json::json!({
            "document_b64": base64::engine::general_purpose::STANDARD.encode(&document.data),
            "page_count": document.page_count,
            "shipping_address": shipping_address,
            "color": color,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DaybookError::Transient(format!("vendor submit: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_failure(resp).await);
        }

        let parsed: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| DaybookError::VendorRejected(format!("vendor submit response: {e}")))?;
        tracing::info!("Vendor accepted print job {}", parsed.job_id);
        Ok(VendorSubmission {
            job_id: parsed.job_id,
            cost_cents: parsed.cost_cents,
            retail_cents: parsed.retail_cents,
        })
    }

    async fn poll_status(&self, job_id: &str) -> Result<VendorStatusReport> {
        let url = format!("{}/print-jobs/{job_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DaybookError::Transient(format!("vendor poll: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_failure(resp).await);
        }

        let parsed: StatusResponse = resp
            .json()
            .await
            .map_err(|e| DaybookError::Transient(format!("vendor status response: {e}")))?;
        let state = VendorJobState::parse(&parsed.status).ok_or_else(|| {
            DaybookError::Transient(format!("unknown vendor status '{}'", parsed.status))
        })?;
        Ok(VendorStatusReport {
            state,
            tracking_url: parsed.tracking_url,
            cost_cents: parsed.cost_cents,
            message: parsed.message,
        })
    }
}
