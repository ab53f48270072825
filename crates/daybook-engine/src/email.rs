//! Email fulfillment pipeline.
//!
//! The simple pipeline: select the period's entries per the subscription's
//! filter, hand them to the ReportSender collaborator, report the outcome.
//! No intermediate persisted state — a failed send is retried at the next
//! tick because the worker leaves the anchor untouched.

use async_trait::async_trait;
use chrono::NaiveDate;
use daybook_core::error::Result;
use daybook_core::types::Entry;
use std::sync::Arc;

use crate::obligations::{EmailSubscription, EntryFilter};
use crate::persistence::EngineDb;

/// The entry date range a report covers: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Formats and delivers one email report. Opaque collaborator — content
/// layout is not the engine's concern.
#[async_trait]
pub trait ReportSender: Send + Sync {
    async fn send_report(
        &self,
        user_id: &str,
        period: &ReportPeriod,
        entries: &[Entry],
        include_images: bool,
    ) -> Result<()>;
}

/// Executes one triggered email obligation.
pub struct EmailPipeline {
    db: Arc<EngineDb>,
    sender: Arc<dyn ReportSender>,
}

impl EmailPipeline {
    pub fn new(db: Arc<EngineDb>, sender: Arc<dyn ReportSender>) -> Self {
        Self { db, sender }
    }

    /// Select and send. Returns the number of entries included (0 means the
    /// period was empty and nothing was sent — still a success, the cycle
    /// advances).
    pub async fn fulfill(&self, sub: &EmailSubscription, period: ReportPeriod) -> Result<usize> {
        self.fulfill_filtered(
            &sub.user_id,
            period,
            sub.entry_filter,
            sub.include_images,
        )
        .await
    }

    /// Shared by the scheduled path and the manual "send now" path.
    pub async fn fulfill_filtered(
        &self,
        user_id: &str,
        period: ReportPeriod,
        filter: EntryFilter,
        include_images: bool,
    ) -> Result<usize> {
        let entries = self
            .db
            .entries_in_range(user_id, period.start, period.end, filter)?;
        if entries.is_empty() {
            tracing::debug!(
                user_id,
                start = %period.start,
                end = %period.end,
                "email period empty, nothing to send"
            );
            return Ok(0);
        }
        self.sender
            .send_report(user_id, &period, &entries, include_images)
            .await?;
        tracing::info!(
            user_id,
            entries = entries.len(),
            start = %period.start,
            end = %period.end,
            "email report sent"
        );
        Ok(entries.len())
    }
}
