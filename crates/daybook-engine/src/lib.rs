//! # Daybook Engine
//!
//! Recurring-schedule and fulfillment engine: the part of Daybook that
//! decides *when* an obligation is due — in the user's own timezone,
//! exactly once — and drives each triggered obligation through its
//! fulfillment pipeline with retries and idempotency.
//!
//! ## Architecture
//! ```text
//! DispatchWorker (periodic tick)
//!   ├── Reminders ──── recurrence::next_occurrence / is_smart_due
//!   │                    └── ReminderNotifier (chat webhook)
//!   ├── EmailSubscriptions ── next_email_date <= today
//!   │                    └── EmailPipeline → ReportSender (SMTP)
//!   ├── PrintSubscriptions ── next_print_date <= today
//!   │                    └── PrintPipeline → DocumentRenderer → VendorGateway
//!   │                          pending → generating → uploaded →
//!   │                          in_production → shipped → delivered
//!   ├── open PrintOrders ── VendorGateway.poll_status → apply_status
//!   └── daily digests ──── DigestBuilder → Polisher (AI, optional)
//!
//! EngineDb (SQLite, WAL)
//!   └── per-obligation lease: atomic conditional UPDATE, stale-claim
//!       reclaim — at-most-once across concurrently running workers
//! ```
//!
//! Every due decision takes "now" from an injected [`daybook_core::Clock`];
//! anchors advance by occurrence, never by dispatch wall clock.

pub mod digest;
pub mod email;
pub mod obligations;
pub mod persistence;
pub mod print;
pub mod recurrence;
pub mod vendor;
pub mod worker;

pub use digest::{DigestBuilder, Polisher};
pub use email::{EmailPipeline, ReportPeriod, ReportSender};
pub use obligations::{
    EmailSubscription, EntryFilter, Frequency, OrderStatus, PrintOrder, PrintSubscription,
    RecurrenceKind, Reminder, TransitionOutcome,
};
pub use persistence::{EngineDb, ObligationKind};
pub use print::{PrintOutcome, PrintPipeline};
pub use vendor::{
    DocumentRenderer, HttpVendorGateway, RenderedDocument, VendorGateway, VendorJobState,
    VendorStatusReport, VendorSubmission,
};
pub use worker::{DispatchWorker, ReminderNotifier, TickSummary, run_worker_loop};
