//! Print fulfillment pipeline.
//!
//! Carries one triggered print obligation through the order state machine:
//! entry selection → document render → vendor submission, then applies
//! asynchronously arriving vendor status reports until the order is
//! terminal. Every persisted step goes through
//! [`PrintOrder::apply_status`], so an out-of-order report can never
//! corrupt an order.

use chrono::{DateTime, Utc};
use daybook_core::error::{DaybookError, Result};
use std::sync::Arc;

use crate::email::ReportPeriod;
use crate::obligations::{EntryFilter, OrderStatus, PrintOrder, TransitionOutcome};
use crate::persistence::EngineDb;
use crate::vendor::{DocumentRenderer, VendorGateway, VendorJobState, VendorStatusReport};

/// What a fulfillment attempt produced.
#[derive(Debug)]
pub enum PrintOutcome {
    /// Order accepted by the vendor; now tracked until terminal.
    Submitted(PrintOrder),
    /// The period had no entries — nothing to bind. The order records the
    /// fact and the cycle advances; an empty book should not retry forever.
    EmptyPeriod(PrintOrder),
}

/// Executes one triggered print obligation.
pub struct PrintPipeline {
    db: Arc<EngineDb>,
    renderer: Arc<dyn DocumentRenderer>,
    vendor: Arc<dyn VendorGateway>,
}

impl PrintPipeline {
    pub fn new(
        db: Arc<EngineDb>,
        renderer: Arc<dyn DocumentRenderer>,
        vendor: Arc<dyn VendorGateway>,
    ) -> Self {
        Self {
            db,
            renderer,
            vendor,
        }
    }

    /// Run generation and vendor submission for one order.
    ///
    /// The order row is persisted at every state change, so a crash leaves
    /// an inspectable trail instead of a phantom charge. Errors carry the
    /// taxonomy the worker uses to decide whether the subscription anchor
    /// advances.
    pub async fn fulfill(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        period: ReportPeriod,
        shipping_address: &str,
        color: bool,
        now: DateTime<Utc>,
    ) -> Result<PrintOutcome> {
        let mut order = PrintOrder::new(user_id, subscription_id, period.start, period.end, now);
        self.db.insert_order(&order)?;

        let entries =
            self.db
                .entries_in_range(user_id, period.start, period.end, EntryFilter::Both)?;
        if entries.is_empty() {
            order.fail("no entries in period", now)?;
            self.db.save_order(&order)?;
            tracing::info!(order_id = %order.id, user_id, "print period empty, order closed");
            return Ok(PrintOutcome::EmptyPeriod(order));
        }

        order.apply_status(OrderStatus::Generating, now)?;
        order.entry_count = entries.len() as u32;
        self.db.save_order(&order)?;

        let document = match self.renderer.render(user_id, &entries, color).await {
            Ok(doc) => doc,
            Err(e) => {
                // No vendor charge was incurred; the order is closed and the
                // worker decides whether the cycle retries.
                order.fail(&format!("render failed: {e}"), now)?;
                self.db.save_order(&order)?;
                return Err(e);
            }
        };

        order.apply_status(OrderStatus::Uploaded, now)?;
        order.page_count = document.page_count;
        self.db.save_order(&order)?;

        match self.vendor.submit(&document, shipping_address, color).await {
            Ok(submission) => {
                order.apply_status(OrderStatus::InProduction, now)?;
                order.vendor_job_id = Some(submission.job_id);
                order.cost_cents = submission.cost_cents;
                order.retail_cents = submission.retail_cents;
                self.db.save_order(&order)?;
                tracing::info!(
                    order_id = %order.id,
                    job_id = order.vendor_job_id.as_deref().unwrap_or(""),
                    pages = order.page_count,
                    "print order in production"
                );
                Ok(PrintOutcome::Submitted(order))
            }
            Err(e) => {
                match &e {
                    DaybookError::PaymentDeclined(msg) => {
                        order.apply_status(OrderStatus::PaymentFailed, now)?;
                        order.error_message = Some(msg.clone());
                    }
                    other => {
                        order.fail(&other.to_string(), now)?;
                    }
                }
                self.db.save_order(&order)?;
                tracing::warn!(order_id = %order.id, error = %e, "print submission failed");
                Err(e)
            }
        }
    }

    /// Poll the vendor for one open order and apply the report.
    pub async fn poll_order(&self, order: &mut PrintOrder, now: DateTime<Utc>) -> Result<()> {
        let job_id = order.vendor_job_id.clone().ok_or_else(|| {
            DaybookError::Validation(format!("order {} has no vendor job id", order.id))
        })?;
        let report = self.vendor.poll_status(&job_id).await?;
        self.apply_vendor_report(order, &report, now)?;
        Ok(())
    }

    /// Apply a vendor status report idempotently and persist the order.
    ///
    /// Duplicate/backward reports are no-ops; tracking URLs are taken even
    /// after terminal (vendors backfill them late).
    pub fn apply_vendor_report(
        &self,
        order: &mut PrintOrder,
        report: &VendorStatusReport,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let outcome = match report.state {
            VendorJobState::InProduction => order.apply_status(OrderStatus::InProduction, now)?,
            VendorJobState::Shipped => order.apply_status(OrderStatus::Shipped, now)?,
            VendorJobState::Delivered => order.apply_status(OrderStatus::Delivered, now)?,
            VendorJobState::Error => {
                let msg = report.message.as_deref().unwrap_or("vendor reported error");
                order.fail(msg, now)?
            }
        };

        if let Some(url) = &report.tracking_url {
            order.tracking_url = Some(url.clone());
        }
        if report.cost_cents.is_some() {
            order.cost_cents = report.cost_cents;
        }
        self.db.save_order(order)?;

        if outcome == TransitionOutcome::Applied {
            tracing::info!(
                order_id = %order.id,
                status = order.status.as_str(),
                "print order advanced"
            );
        }
        Ok(outcome)
    }
}
