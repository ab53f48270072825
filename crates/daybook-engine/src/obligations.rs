//! Obligation definitions — the data model for recurring scheduled work.
//!
//! A Reminder, EmailSubscription, or PrintSubscription is an *obligation*:
//! a record the dispatch worker considers on every tick. A PrintOrder is one
//! triggered print fulfillment attempt, carried through its state machine.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use daybook_core::error::{DaybookError, Result};
use serde::{Deserialize, Serialize};

/// How a reminder recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
    /// Fires after N days of journaling inactivity. Evaluated at tick time
    /// against the activity signal, not precomputed.
    Smart,
}

impl RecurrenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceKind::Daily => "daily",
            RecurrenceKind::Weekly => "weekly",
            RecurrenceKind::Monthly => "monthly",
            RecurrenceKind::Smart => "smart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(RecurrenceKind::Daily),
            "weekly" => Some(RecurrenceKind::Weekly),
            "monthly" => Some(RecurrenceKind::Monthly),
            "smart" => Some(RecurrenceKind::Smart),
            _ => None,
        }
    }
}

/// Subscription cadence for email reports and print deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "quarterly" => Some(Frequency::Quarterly),
            "yearly" => Some(Frequency::Yearly),
            _ => None,
        }
    }
}

/// Which entries an email report includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryFilter {
    /// Combined daily digest entries only.
    Daily,
    /// Individual (non-digest) entries only.
    Individual,
    /// Everything.
    Both,
}

impl EntryFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryFilter::Daily => "daily",
            EntryFilter::Individual => "individual",
            EntryFilter::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(EntryFilter::Daily),
            "individual" => Some(EntryFilter::Individual),
            "both" => Some(EntryFilter::Both),
            _ => None,
        }
    }

    /// Whether an entry of the given type belongs in this report.
    pub fn matches(&self, entry_type: daybook_core::EntryType) -> bool {
        use daybook_core::EntryType;
        match self {
            EntryFilter::Daily => entry_type == EntryType::Digest,
            EntryFilter::Individual => entry_type != EntryType::Digest,
            EntryFilter::Both => true,
        }
    }
}

/// A reminder nudge obligation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub kind: RecurrenceKind,
    /// Local wall time to fire at. Required unless kind is smart.
    pub time_of_day: Option<NaiveTime>,
    /// 0 = Sunday .. 6 = Saturday. Required iff weekly.
    pub day_of_week: Option<u8>,
    /// 1..=28. Required iff monthly; capped at 28 so every month matches.
    pub day_of_month: Option<u8>,
    /// Days of inactivity before a smart reminder fires. Required iff smart.
    pub smart_threshold_days: Option<u32>,
    pub is_active: bool,
    /// Anchor: the occurrence instant of the last successful fire.
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Consecutive transient failures since the last success.
    pub failure_count: u32,
    /// Flagged for manual review; skipped by the worker until cleared.
    pub needs_attention: bool,
    /// In-flight lease. Set by the worker's claim, cleared on completion.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    fn base(user_id: &str, kind: RecurrenceKind, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            time_of_day: None,
            day_of_week: None,
            day_of_month: None,
            smart_threshold_days: None,
            is_active: true,
            last_sent_at: None,
            failure_count: 0,
            needs_attention: false,
            claimed_at: None,
            created_at: now,
        }
    }

    /// Fires every day at `time_of_day`.
    pub fn daily(user_id: &str, time_of_day: NaiveTime, now: DateTime<Utc>) -> Self {
        Self {
            time_of_day: Some(time_of_day),
            ..Self::base(user_id, RecurrenceKind::Daily, now)
        }
    }

    /// Fires every week on `day_of_week` (0 = Sunday) at `time_of_day`.
    pub fn weekly(
        user_id: &str,
        day_of_week: u8,
        time_of_day: NaiveTime,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            time_of_day: Some(time_of_day),
            day_of_week: Some(day_of_week),
            ..Self::base(user_id, RecurrenceKind::Weekly, now)
        }
    }

    /// Fires every month on `day_of_month` (1..=28) at `time_of_day`.
    pub fn monthly(
        user_id: &str,
        day_of_month: u8,
        time_of_day: NaiveTime,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            time_of_day: Some(time_of_day),
            day_of_month: Some(day_of_month),
            ..Self::base(user_id, RecurrenceKind::Monthly, now)
        }
    }

    /// Fires after `threshold_days` of journaling inactivity.
    pub fn smart(user_id: &str, threshold_days: u32, now: DateTime<Utc>) -> Self {
        Self {
            smart_threshold_days: Some(threshold_days),
            ..Self::base(user_id, RecurrenceKind::Smart, now)
        }
    }

    /// Boundary validation: exactly the fields required by the kind are
    /// populated. Records failing this never reach the scheduler.
    pub fn validate(&self) -> Result<()> {
        let extra = |field: &str| {
            Err(DaybookError::Validation(format!(
                "{} reminder must not set {field}",
                self.kind.as_str()
            )))
        };
        match self.kind {
            RecurrenceKind::Daily => {
                if self.time_of_day.is_none() {
                    return Err(DaybookError::Validation(
                        "daily reminder requires time_of_day".into(),
                    ));
                }
                if self.day_of_week.is_some() {
                    return extra("day_of_week");
                }
                if self.day_of_month.is_some() {
                    return extra("day_of_month");
                }
                if self.smart_threshold_days.is_some() {
                    return extra("smart_threshold_days");
                }
            }
            RecurrenceKind::Weekly => {
                if self.time_of_day.is_none() {
                    return Err(DaybookError::Validation(
                        "weekly reminder requires time_of_day".into(),
                    ));
                }
                match self.day_of_week {
                    None => {
                        return Err(DaybookError::Validation(
                            "weekly reminder requires day_of_week".into(),
                        ));
                    }
                    Some(d) if d > 6 => {
                        return Err(DaybookError::Validation(format!(
                            "day_of_week {d} out of range 0..=6"
                        )));
                    }
                    Some(_) => {}
                }
                if self.day_of_month.is_some() {
                    return extra("day_of_month");
                }
                if self.smart_threshold_days.is_some() {
                    return extra("smart_threshold_days");
                }
            }
            RecurrenceKind::Monthly => {
                if self.time_of_day.is_none() {
                    return Err(DaybookError::Validation(
                        "monthly reminder requires time_of_day".into(),
                    ));
                }
                match self.day_of_month {
                    None => {
                        return Err(DaybookError::Validation(
                            "monthly reminder requires day_of_month".into(),
                        ));
                    }
                    Some(d) if !(1..=28).contains(&d) => {
                        return Err(DaybookError::Validation(format!(
                            "day_of_month {d} out of range 1..=28"
                        )));
                    }
                    Some(_) => {}
                }
                if self.day_of_week.is_some() {
                    return extra("day_of_week");
                }
                if self.smart_threshold_days.is_some() {
                    return extra("smart_threshold_days");
                }
            }
            RecurrenceKind::Smart => {
                match self.smart_threshold_days {
                    None | Some(0) => {
                        return Err(DaybookError::Validation(
                            "smart reminder requires smart_threshold_days >= 1".into(),
                        ));
                    }
                    Some(_) => {}
                }
                if self.time_of_day.is_some() {
                    return extra("time_of_day");
                }
                if self.day_of_week.is_some() {
                    return extra("day_of_week");
                }
                if self.day_of_month.is_some() {
                    return extra("day_of_month");
                }
            }
        }
        Ok(())
    }
}

/// Periodic email report subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSubscription {
    pub id: String,
    pub user_id: String,
    pub frequency: Frequency,
    pub entry_filter: EntryFilter,
    pub include_images: bool,
    pub is_active: bool,
    /// Materialized next due date — the worker compares `date <= today`
    /// instead of recomputing the rule on every tick.
    pub next_email_date: Option<NaiveDate>,
    pub last_emailed_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub needs_attention: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EmailSubscription {
    pub fn new(
        user_id: &str,
        frequency: Frequency,
        entry_filter: EntryFilter,
        include_images: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            frequency,
            entry_filter,
            include_images,
            is_active: true,
            next_email_date: None,
            last_emailed_at: None,
            failure_count: 0,
            needs_attention: false,
            claimed_at: None,
            created_at: now,
        }
    }
}

/// Periodic physical-print subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintSubscription {
    pub id: String,
    pub user_id: String,
    pub frequency: Frequency,
    pub shipping_address: String,
    pub color: bool,
    pub is_active: bool,
    pub next_print_date: Option<NaiveDate>,
    pub last_printed_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub needs_attention: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PrintSubscription {
    pub fn new(
        user_id: &str,
        frequency: Frequency,
        shipping_address: &str,
        color: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            frequency,
            shipping_address: shipping_address.to_string(),
            color,
            is_active: true,
            next_print_date: None,
            last_printed_at: None,
            failure_count: 0,
            needs_attention: false,
            claimed_at: None,
            created_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shipping_address.trim().is_empty() {
            return Err(DaybookError::Validation(
                "print subscription requires a shipping address".into(),
            ));
        }
        Ok(())
    }
}

/// Print order lifecycle states.
///
/// Forward chain: pending → generating → uploaded → in_production →
/// shipped → delivered. `failed` is reachable from any non-terminal state;
/// `payment_failed` only from `uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Generating,
    Uploaded,
    InProduction,
    Shipped,
    Delivered,
    Failed,
    PaymentFailed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Generating => "generating",
            OrderStatus::Uploaded => "uploaded",
            OrderStatus::InProduction => "in_production",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Failed => "failed",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "generating" => Some(OrderStatus::Generating),
            "uploaded" => Some(OrderStatus::Uploaded),
            "in_production" => Some(OrderStatus::InProduction),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "failed" => Some(OrderStatus::Failed),
            "payment_failed" => Some(OrderStatus::PaymentFailed),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Failed | OrderStatus::PaymentFailed
        )
    }

    /// Position in the forward chain. Failure states have no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Generating => Some(1),
            OrderStatus::Uploaded => Some(2),
            OrderStatus::InProduction => Some(3),
            OrderStatus::Shipped => Some(4),
            OrderStatus::Delivered => Some(5),
            OrderStatus::Failed | OrderStatus::PaymentFailed => None,
        }
    }

    /// Whether the state machine permits `self -> to` as a fresh step.
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            OrderStatus::Failed => true,
            OrderStatus::PaymentFailed => *self == OrderStatus::Uploaded,
            _ => match (self.rank(), to.rank()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }
}

/// Outcome of applying a reported status to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The order advanced to the reported state.
    Applied,
    /// Duplicate or stale report; order unchanged.
    NoOp,
}

/// One triggered print fulfillment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintOrder {
    pub id: String,
    pub user_id: String,
    /// None for ad-hoc orders placed through the manual path.
    pub subscription_id: Option<String>,
    pub status: OrderStatus,
    /// Entry date range covered: `[period_start, period_end)`.
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub entry_count: u32,
    pub page_count: u32,
    pub cost_cents: Option<i64>,
    pub retail_cents: Option<i64>,
    pub vendor_job_id: Option<String>,
    pub tracking_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrintOrder {
    pub fn new(
        user_id: &str,
        subscription_id: Option<&str>,
        period_start: NaiveDate,
        period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            subscription_id: subscription_id.map(String::from),
            status: OrderStatus::Pending,
            period_start,
            period_end,
            entry_count: 0,
            page_count: 0,
            cost_cents: None,
            retail_cents: None,
            vendor_job_id: None,
            tracking_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status report idempotently.
    ///
    /// Duplicate and backward reports (vendor callbacks can arrive out of
    /// order) are no-ops. A forward skip — e.g. `delivered` reported while
    /// still `in_production` — is a contract violation and is rejected.
    pub fn apply_status(
        &mut self,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        if to == self.status {
            return Ok(TransitionOutcome::NoOp);
        }
        // Once terminal, everything further is a stale duplicate. Tracking
        // URLs are updated outside the state machine.
        if self.status.is_terminal() {
            return Ok(TransitionOutcome::NoOp);
        }
        if let (Some(from_rank), Some(to_rank)) = (self.status.rank(), to.rank())
            && to_rank < from_rank
        {
            return Ok(TransitionOutcome::NoOp);
        }
        if self.status.can_transition(to) {
            self.status = to;
            self.updated_at = now;
            Ok(TransitionOutcome::Applied)
        } else {
            Err(DaybookError::IllegalTransition {
                from: self.status.as_str().into(),
                to: to.as_str().into(),
            })
        }
    }

    /// Move to `failed` with a human-readable reason.
    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> Result<TransitionOutcome> {
        let outcome = self.apply_status(OrderStatus::Failed, now)?;
        if outcome == TransitionOutcome::Applied {
            self.error_message = Some(message.to_string());
        }
        Ok(outcome)
    }
}
