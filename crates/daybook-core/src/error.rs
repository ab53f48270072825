//! Error taxonomy for the scheduling and fulfillment engine.
//!
//! The split that matters operationally: `Transient` failures leave the
//! obligation's anchor untouched so the next tick retries, while
//! `PaymentDeclined`/`VendorRejected` are terminal for the triggered order
//! and only resolve on the subscription's next natural cycle.

use thiserror::Error;

/// All errors produced by Daybook crates.
#[derive(Debug, Error)]
pub enum DaybookError {
    /// Dependency hiccup (vendor 5xx, polish timeout, send failure).
    /// Retried at tick granularity; never advances the obligation anchor.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Vendor declined payment for a print order. Terminal for the order.
    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    /// Vendor rejected the submitted job outright. Terminal for the order.
    #[error("vendor rejected job: {0}")]
    VendorRejected(String),

    /// Record failed boundary validation (e.g. weekly reminder without a
    /// weekday). Must be rejected where records are written.
    #[error("invalid record: {0}")]
    Validation(String),

    /// An order-status transition not permitted by the state machine.
    #[error("illegal order transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    /// Outbound delivery adapter failure (SMTP, chat webhook).
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<std::io::Error> for DaybookError {
    fn from(e: std::io::Error) -> Self {
        DaybookError::Storage(e.to_string())
    }
}

impl DaybookError {
    /// Whether the obligation should be retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaybookError::Transient(_) | DaybookError::Channel(_) | DaybookError::Storage(_)
        )
    }
}

/// Convenience result alias used across Daybook crates.
pub type Result<T> = std::result::Result<T, DaybookError>;
