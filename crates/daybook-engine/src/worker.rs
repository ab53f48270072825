//! Dispatch worker — the scheduler tick.
//!
//! Each tick scans the obligation tables, decides dueness with the
//! occurrence calculator, claims each due item through the store's lease,
//! and fans the claimed items out to their pipelines under a bounded
//! concurrency limit. Obligations are independent: one failing item never
//! aborts the tick for the others.
//!
//! Anchor discipline: success advances the anchor to the *occurrence*
//! (instant or date), failure leaves it untouched so the next tick retries,
//! and a streak of transient failures flags the obligation for manual
//! review instead of retrying forever.

use chrono::{DateTime, Duration, Utc};
use daybook_core::clock::Clock;
use daybook_core::config::EngineConfig;
use daybook_core::error::{DaybookError, Result};
use futures::StreamExt;
use std::sync::Arc;

use crate::digest::DigestBuilder;
use crate::email::{EmailPipeline, ReportPeriod, ReportSender};
use crate::obligations::{
    EmailSubscription, EntryFilter, PrintSubscription, RecurrenceKind, Reminder,
};
use crate::persistence::{EngineDb, ObligationKind};
use crate::print::{PrintOutcome, PrintPipeline};
use crate::recurrence;
use crate::vendor::{DocumentRenderer, VendorGateway};

use async_trait::async_trait;

/// Delivers one reminder nudge to the user's preferred channel.
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    async fn send_nudge(&self, user_id: &str, message: &str) -> Result<()>;
}

/// What happened to one obligation during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Fired,
    NotDue,
    /// Claimed elsewhere, flagged, or missing prerequisites.
    Skipped,
    Failed,
}

/// Counters for one tick. Logged at the end of every pass with activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub reminders_sent: usize,
    pub emails_sent: usize,
    /// Print cycles completed (vendor submissions plus empty periods closed).
    pub prints_fulfilled: usize,
    pub orders_polled: usize,
    pub digests_built: usize,
    pub failures: usize,
    pub skipped: usize,
}

impl TickSummary {
    pub fn had_activity(&self) -> bool {
        self.reminders_sent
            + self.emails_sent
            + self.prints_fulfilled
            + self.digests_built
            + self.failures
            > 0
    }

    fn absorb(&mut self, outcome: ItemOutcome, fired: &mut usize) {
        match outcome {
            ItemOutcome::Fired => *fired += 1,
            ItemOutcome::NotDue => {}
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failures += 1,
        }
    }
}

/// The scheduler loop's tick handler.
pub struct DispatchWorker {
    db: Arc<EngineDb>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn ReminderNotifier>,
    email: EmailPipeline,
    print: PrintPipeline,
    digests: DigestBuilder,
    cfg: EngineConfig,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<EngineDb>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn ReminderNotifier>,
        reports: Arc<dyn ReportSender>,
        renderer: Arc<dyn DocumentRenderer>,
        vendor: Arc<dyn VendorGateway>,
        digests: DigestBuilder,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            email: EmailPipeline::new(db.clone(), reports),
            print: PrintPipeline::new(db.clone(), renderer, vendor),
            db,
            clock,
            notifier,
            digests,
            cfg,
        }
    }

    /// One scheduler pass over every obligation kind.
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now_utc();
        let mut summary = TickSummary::default();

        self.dispatch_reminders(now, &mut summary).await;
        self.dispatch_email_subscriptions(now, &mut summary).await;
        self.dispatch_print_subscriptions(now, &mut summary).await;
        self.poll_open_orders(now, &mut summary).await;
        if self.cfg.auto_digest {
            self.build_daily_digests(now, &mut summary).await;
        }

        if summary.had_activity() {
            tracing::info!(
                reminders = summary.reminders_sent,
                emails = summary.emails_sent,
                prints = summary.prints_fulfilled,
                polled = summary.orders_polled,
                digests = summary.digests_built,
                failures = summary.failures,
                skipped = summary.skipped,
                "tick complete"
            );
        }
        summary
    }

    // ─── Reminders ───────────────────────────────────────────

    async fn dispatch_reminders(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let reminders = match self.db.active_reminders() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "reminder scan failed");
                summary.failures += 1;
                return;
            }
        };
        let outcomes: Vec<ItemOutcome> =
            futures::stream::iter(reminders.into_iter().map(|r| self.process_reminder(r, now)))
                .buffer_unordered(self.cfg.concurrency)
                .collect()
                .await;
        let mut fired = 0;
        for outcome in outcomes {
            summary.absorb(outcome, &mut fired);
        }
        summary.reminders_sent += fired;
    }

    async fn process_reminder(&self, reminder: Reminder, now: DateTime<Utc>) -> ItemOutcome {
        let user = match self.db.get_user(&reminder.user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::error!(reminder_id = %reminder.id, user_id = %reminder.user_id, "reminder has no user");
                self.flag(ObligationKind::Reminder, &reminder.id);
                return ItemOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(reminder_id = %reminder.id, error = %e, "user lookup failed");
                return ItemOutcome::Failed;
            }
        };

        // Dueness plus the occurrence instant the anchor will take.
        let occurrence = match reminder.kind {
            RecurrenceKind::Smart => {
                let activity = match self.db.last_entry_at(&reminder.user_id) {
                    Ok(at) => at,
                    Err(e) => {
                        tracing::error!(reminder_id = %reminder.id, error = %e, "activity lookup failed");
                        return ItemOutcome::Failed;
                    }
                };
                match recurrence::is_smart_due(&reminder, activity, now) {
                    // Smart reminders have no precomputed occurrence; the
                    // fire time is the anchor.
                    Ok(true) => now,
                    Ok(false) => return ItemOutcome::NotDue,
                    Err(e) => return self.reject_malformed(&reminder.id, &e),
                }
            }
            _ => {
                let tz = match user.tz() {
                    Ok(tz) => tz,
                    Err(e) => return self.reject_malformed(&reminder.id, &e),
                };
                match recurrence::next_occurrence(&reminder, now, tz) {
                    Ok(Some(occ)) if occ <= now => occ,
                    Ok(_) => return ItemOutcome::NotDue,
                    Err(e) => return self.reject_malformed(&reminder.id, &e),
                }
            }
        };

        match self
            .db
            .claim(ObligationKind::Reminder, &reminder.id, now, self.cfg.lease_stale_secs)
        {
            Ok(true) => {}
            Ok(false) => return ItemOutcome::Skipped,
            Err(e) => {
                tracing::error!(reminder_id = %reminder.id, error = %e, "claim failed");
                return ItemOutcome::Failed;
            }
        }

        let message = nudge_message(&reminder);
        match self.notifier.send_nudge(&reminder.user_id, &message).await {
            Ok(()) => {
                if let Err(e) = self.db.mark_reminder_sent(&reminder.id, occurrence) {
                    tracing::error!(reminder_id = %reminder.id, error = %e, "anchor update failed");
                    return ItemOutcome::Failed;
                }
                tracing::info!(reminder_id = %reminder.id, user_id = %reminder.user_id, "reminder sent");
                ItemOutcome::Fired
            }
            Err(e) => {
                self.note_failure(ObligationKind::Reminder, &reminder.id, &e);
                ItemOutcome::Failed
            }
        }
    }

    // ─── Email subscriptions ─────────────────────────────────

    async fn dispatch_email_subscriptions(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let subs = match self.db.active_email_subscriptions() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "email subscription scan failed");
                summary.failures += 1;
                return;
            }
        };
        let outcomes: Vec<ItemOutcome> = futures::stream::iter(
            subs.into_iter().map(|s| self.process_email_subscription(s, now)),
        )
        .buffer_unordered(self.cfg.concurrency)
        .collect()
        .await;
        let mut fired = 0;
        for outcome in outcomes {
            summary.absorb(outcome, &mut fired);
        }
        summary.emails_sent += fired;
    }

    async fn process_email_subscription(
        &self,
        sub: EmailSubscription,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        let Some((_, tz)) = self.user_tz(&sub.user_id, ObligationKind::EmailSubscription, &sub.id)
        else {
            return ItemOutcome::Skipped;
        };
        let today = now.with_timezone(&tz).date_naive();

        let due_date = match sub.next_email_date {
            Some(date) if date <= today => date,
            Some(_) => return ItemOutcome::NotDue,
            None => {
                // Materialize the first due date; it fires on a later tick.
                let created_local = sub.created_at.with_timezone(&tz).date_naive();
                let initial = recurrence::initial_subscription_date(sub.frequency, created_local);
                if let Err(e) = self.db.set_next_email_date(&sub.id, initial) {
                    tracing::error!(sub_id = %sub.id, error = %e, "failed to materialize next date");
                }
                return ItemOutcome::NotDue;
            }
        };

        match self.db.claim(
            ObligationKind::EmailSubscription,
            &sub.id,
            now,
            self.cfg.lease_stale_secs,
        ) {
            Ok(true) => {}
            Ok(false) => return ItemOutcome::Skipped,
            Err(e) => {
                tracing::error!(sub_id = %sub.id, error = %e, "claim failed");
                return ItemOutcome::Failed;
            }
        }

        let period = ReportPeriod {
            start: recurrence::period_start(sub.frequency, due_date),
            end: due_date,
        };
        match self.email.fulfill(&sub, period).await {
            Ok(_) => {
                let next = recurrence::advance_subscription(sub.frequency, due_date, today);
                if let Err(e) = self.db.mark_email_sent(&sub.id, now, next) {
                    tracing::error!(sub_id = %sub.id, error = %e, "anchor update failed");
                    return ItemOutcome::Failed;
                }
                ItemOutcome::Fired
            }
            Err(e) => {
                self.note_failure(ObligationKind::EmailSubscription, &sub.id, &e);
                ItemOutcome::Failed
            }
        }
    }

    // ─── Print subscriptions ─────────────────────────────────

    async fn dispatch_print_subscriptions(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let subs = match self.db.active_print_subscriptions() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "print subscription scan failed");
                summary.failures += 1;
                return;
            }
        };
        let outcomes: Vec<ItemOutcome> = futures::stream::iter(
            subs.into_iter().map(|s| self.process_print_subscription(s, now)),
        )
        .buffer_unordered(self.cfg.concurrency)
        .collect()
        .await;
        let mut fired = 0;
        for outcome in outcomes {
            summary.absorb(outcome, &mut fired);
        }
        summary.prints_fulfilled += fired;
    }

    async fn process_print_subscription(
        &self,
        sub: PrintSubscription,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        let Some((_, tz)) = self.user_tz(&sub.user_id, ObligationKind::PrintSubscription, &sub.id)
        else {
            return ItemOutcome::Skipped;
        };
        let today = now.with_timezone(&tz).date_naive();

        let due_date = match sub.next_print_date {
            Some(date) if date <= today => date,
            Some(_) => return ItemOutcome::NotDue,
            None => {
                let created_local = sub.created_at.with_timezone(&tz).date_naive();
                let initial = recurrence::initial_subscription_date(sub.frequency, created_local);
                if let Err(e) = self.db.set_next_print_date(&sub.id, initial) {
                    tracing::error!(sub_id = %sub.id, error = %e, "failed to materialize next date");
                }
                return ItemOutcome::NotDue;
            }
        };

        match self.db.claim(
            ObligationKind::PrintSubscription,
            &sub.id,
            now,
            self.cfg.lease_stale_secs,
        ) {
            Ok(true) => {}
            Ok(false) => return ItemOutcome::Skipped,
            Err(e) => {
                tracing::error!(sub_id = %sub.id, error = %e, "claim failed");
                return ItemOutcome::Failed;
            }
        }

        let period = ReportPeriod {
            start: recurrence::period_start(sub.frequency, due_date),
            end: due_date,
        };
        let result = self
            .print
            .fulfill(
                &sub.user_id,
                Some(&sub.id),
                period,
                &sub.shipping_address,
                sub.color,
                now,
            )
            .await;
        match result {
            Ok(PrintOutcome::Submitted(_)) | Ok(PrintOutcome::EmptyPeriod(_)) => {
                let next = recurrence::advance_subscription(sub.frequency, due_date, today);
                if let Err(e) = self.db.mark_print_sent(&sub.id, now, next) {
                    tracing::error!(sub_id = %sub.id, error = %e, "anchor update failed");
                    return ItemOutcome::Failed;
                }
                ItemOutcome::Fired
            }
            Err(
                ref e @ (DaybookError::PaymentDeclined(_) | DaybookError::VendorRejected(_)),
            ) => {
                // Terminal business failure: the order stays in its error
                // state and a fresh order goes out on the next natural
                // cycle, so the anchor advances.
                let next = recurrence::advance_subscription(sub.frequency, due_date, today);
                if let Err(err) = self.db.set_next_print_date(&sub.id, next) {
                    tracing::error!(sub_id = %sub.id, error = %err, "anchor update failed");
                }
                if let Err(err) = self.db.release(ObligationKind::PrintSubscription, &sub.id) {
                    tracing::error!(sub_id = %sub.id, error = %err, "release failed");
                }
                tracing::warn!(sub_id = %sub.id, error = %e, "print cycle closed on business failure");
                ItemOutcome::Failed
            }
            Err(e) => {
                // Transient: anchor untouched, retried next tick.
                self.note_failure(ObligationKind::PrintSubscription, &sub.id, &e);
                ItemOutcome::Failed
            }
        }
    }

    // ─── Vendor polling ──────────────────────────────────────

    async fn poll_open_orders(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let orders = match self.db.open_orders() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "open order scan failed");
                summary.failures += 1;
                return;
            }
        };
        let results: Vec<bool> = futures::stream::iter(orders.into_iter().map(|mut order| {
            let pipeline = &self.print;
            async move {
                match pipeline.poll_order(&mut order, now).await {
                    Ok(()) => true,
                    Err(e) if e.is_transient() => {
                        tracing::debug!(order_id = %order.id, error = %e, "vendor poll deferred");
                        false
                    }
                    Err(e) => {
                        tracing::error!(order_id = %order.id, error = %e, "vendor poll rejected");
                        false
                    }
                }
            }
        }))
        .buffer_unordered(self.cfg.concurrency)
        .collect()
        .await;
        summary.orders_polled += results.iter().filter(|ok| **ok).count();
    }

    // ─── Daily digests ───────────────────────────────────────

    async fn build_daily_digests(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let users = match self.db.list_users() {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "user scan failed");
                return;
            }
        };
        for user in users {
            let Ok(tz) = user.tz() else {
                tracing::error!(user_id = %user.id, "bad timezone, skipping digest");
                continue;
            };
            let yesterday = now.with_timezone(&tz).date_naive() - Duration::days(1);
            match self.digests.build(&user.id, yesterday, now).await {
                Ok(Some(_)) => summary.digests_built += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "digest build failed");
                }
            }
        }
    }

    // ─── Manual "send now" path ──────────────────────────────

    /// User-triggered report over a trailing window. Bypasses the due check
    /// and the lease, and never touches the subscription anchors.
    pub async fn send_report_now(
        &self,
        user_id: &str,
        trailing_days: u32,
        filter: EntryFilter,
        include_images: bool,
    ) -> Result<usize> {
        let period = self.trailing_period(user_id, trailing_days)?;
        self.email
            .fulfill_filtered(user_id, period, filter, include_images)
            .await
    }

    /// User-triggered ad-hoc print order. The order carries no
    /// subscription id and no subscription bookkeeping changes.
    pub async fn order_print_now(
        &self,
        user_id: &str,
        trailing_days: u32,
        shipping_address: &str,
        color: bool,
    ) -> Result<PrintOutcome> {
        let period = self.trailing_period(user_id, trailing_days)?;
        self.print
            .fulfill(
                user_id,
                None,
                period,
                shipping_address,
                color,
                self.clock.now_utc(),
            )
            .await
    }

    fn trailing_period(&self, user_id: &str, trailing_days: u32) -> Result<ReportPeriod> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| DaybookError::Validation(format!("unknown user '{user_id}'")))?;
        let tz = user.tz()?;
        let today = self.clock.now_utc().with_timezone(&tz).date_naive();
        let end = today.succ_opt().unwrap_or(today); // include today
        Ok(ReportPeriod {
            start: end - Duration::days(i64::from(trailing_days)),
            end,
        })
    }

    // ─── Shared helpers ──────────────────────────────────────

    fn user_tz(
        &self,
        user_id: &str,
        kind: ObligationKind,
        obligation_id: &str,
    ) -> Option<(daybook_core::User, chrono_tz::Tz)> {
        match self.db.get_user(user_id) {
            Ok(Some(user)) => match user.tz() {
                Ok(tz) => Some((user, tz)),
                Err(e) => {
                    tracing::error!(obligation_id, error = %e, "bad timezone");
                    self.flag(kind, obligation_id);
                    None
                }
            },
            Ok(None) => {
                tracing::error!(obligation_id, user_id, "obligation has no user");
                self.flag(kind, obligation_id);
                None
            }
            Err(e) => {
                tracing::error!(obligation_id, error = %e, "user lookup failed");
                None
            }
        }
    }

    fn reject_malformed(&self, reminder_id: &str, e: &DaybookError) -> ItemOutcome {
        // Contract violation at dispatch time: validation should have caught
        // this at the write boundary. Flag and move on; never poison the tick.
        tracing::error!(reminder_id, error = %e, "malformed schedule record");
        self.flag(ObligationKind::Reminder, reminder_id);
        ItemOutcome::Skipped
    }

    fn flag(&self, kind: ObligationKind, id: &str) {
        if let Err(e) = self.db.flag_attention(kind, id) {
            tracing::error!(id, error = %e, "failed to flag obligation");
        }
    }

    fn note_failure(&self, kind: ObligationKind, id: &str, e: &DaybookError) {
        if e.is_transient() {
            match self.db.record_failure(kind, id, self.cfg.max_consecutive_failures) {
                Ok(true) => {
                    tracing::warn!(id, error = %e, "obligation flagged for manual review after repeated failures");
                }
                Ok(false) => {
                    tracing::warn!(id, error = %e, "obligation failed, retrying next tick");
                }
                Err(err) => {
                    tracing::error!(id, error = %err, "failure accounting failed");
                }
            }
        } else {
            tracing::error!(id, error = %e, "non-retryable failure, flagging obligation");
            self.flag(kind, id);
        }
    }
}

fn nudge_message(reminder: &Reminder) -> String {
    match reminder.kind {
        RecurrenceKind::Smart => {
            let days = reminder.smart_threshold_days.unwrap_or(0);
            format!("It's been {days} days since your last entry. A few lines keep the streak alive.")
        }
        _ => "Time to journal — what happened today?".to_string(),
    }
}

/// Run the worker on a fixed tick until the process exits.
pub async fn run_worker_loop(worker: Arc<DispatchWorker>, tick_interval_secs: u64) {
    tracing::info!("Dispatch worker started (tick every {tick_interval_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_interval_secs));
    loop {
        interval.tick().await;
        worker.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use daybook_core::clock::FixedClock;
    use daybook_core::types::{Entry, EntryType, User};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::obligations::{Frequency, OrderStatus};
    use crate::vendor::{RenderedDocument, VendorSubmission};

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReminderNotifier for CountingNotifier {
        async fn send_nudge(&self, _user_id: &str, _message: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DaybookError::Channel("webhook down".into()))
            } else {
                Ok(())
            }
        }
    }

    struct CountingSender {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReportSender for CountingSender {
        async fn send_report(
            &self,
            _user_id: &str,
            _period: &ReportPeriod,
            _entries: &[Entry],
            _include_images: bool,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OkRenderer;

    #[async_trait]
    impl DocumentRenderer for OkRenderer {
        async fn render(
            &self,
            _user_id: &str,
            entries: &[Entry],
            _color: bool,
        ) -> Result<RenderedDocument> {
            Ok(RenderedDocument {
                data: vec![1u8; 8],
                page_count: entries.len() as u32,
            })
        }
    }

    enum VendorMode {
        Accept,
        ServerError,
        Decline,
    }

    struct ScriptedVendor {
        mode: Mutex<VendorMode>,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl VendorGateway for ScriptedVendor {
        async fn submit(
            &self,
            _document: &RenderedDocument,
            _shipping_address: &str,
            _color: bool,
        ) -> Result<VendorSubmission> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            match *self.mode.lock().unwrap() {
                VendorMode::Accept => Ok(VendorSubmission {
                    job_id: format!("job-{}", self.submits.load(Ordering::SeqCst)),
                    cost_cents: Some(1900),
                    retail_cents: None,
                }),
                VendorMode::ServerError => Err(DaybookError::Transient("vendor 500".into())),
                VendorMode::Decline => Err(DaybookError::PaymentDeclined("card expired".into())),
            }
        }

        async fn poll_status(&self, _job_id: &str) -> Result<crate::vendor::VendorStatusReport> {
            Err(DaybookError::Transient("not scripted".into()))
        }
    }

    struct Harness {
        db: Arc<EngineDb>,
        notifier: Arc<CountingNotifier>,
        sender: Arc<CountingSender>,
        vendor: Arc<ScriptedVendor>,
        worker: DispatchWorker,
    }

    fn harness_at(now: DateTime<Utc>, notifier_fails: bool, vendor_mode: VendorMode) -> Harness {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: notifier_fails,
        });
        let sender = Arc::new(CountingSender {
            calls: AtomicUsize::new(0),
        });
        let vendor = Arc::new(ScriptedVendor {
            mode: Mutex::new(vendor_mode),
            submits: AtomicUsize::new(0),
        });
        let cfg = EngineConfig {
            max_consecutive_failures: 2,
            auto_digest: false,
            ..EngineConfig::default()
        };
        let worker = DispatchWorker::new(
            db.clone(),
            Arc::new(FixedClock(now)),
            notifier.clone(),
            sender.clone(),
            Arc::new(OkRenderer),
            vendor.clone(),
            DigestBuilder::new(db.clone(), None),
            cfg,
        );
        Harness {
            db,
            notifier,
            sender,
            vendor,
            worker,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn d(y: i32, m: u32, da: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, da).unwrap()
    }

    fn seed_user(db: &EngineDb, tz: &str) {
        db.upsert_user(&User::new("u1", tz, at(2024, 1, 1, 0, 0)))
            .unwrap();
    }

    fn seed_entries(db: &EngineDb) {
        for day in [15, 20, 25] {
            db.insert_entry(&Entry::new(
                "u1",
                EntryType::Text,
                "entry",
                d(2024, 1, day),
                at(2024, 1, day, 12, 0),
            ))
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_due_reminder_fires_exactly_once_across_ticks() {
        let now = at(2024, 3, 5, 10, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), at(2024, 3, 1, 0, 0));
        h.db.insert_reminder(&r).unwrap();

        let s1 = h.worker.tick().await;
        assert_eq!(s1.reminders_sent, 1);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 1);

        // Immediate re-run: anchor advanced, nothing fires.
        let s2 = h.worker.tick().await;
        assert_eq!(s2.reminders_sent, 0);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 1);

        // The anchor is the occurrence (09:00), not the dispatch instant.
        let stored = h.db.get_reminder(&r.id).unwrap().unwrap();
        assert_eq!(stored.last_sent_at, Some(at(2024, 3, 5, 9, 0)));
    }

    #[tokio::test]
    async fn test_not_yet_due_reminder_is_untouched() {
        let now = at(2024, 3, 5, 8, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), at(2024, 3, 1, 0, 0));
        h.db.insert_reminder(&r).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.reminders_sent, 0);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_claimed_obligation_is_skipped() {
        let now = at(2024, 3, 5, 10, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), at(2024, 3, 1, 0, 0));
        h.db.insert_reminder(&r).unwrap();

        // Another worker holds the lease.
        assert!(h.db.claim(ObligationKind::Reminder, &r.id, now, 1800).unwrap());

        let s = h.worker.tick().await;
        assert_eq!(s.reminders_sent, 0);
        assert_eq!(s.skipped, 1);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_anchor_then_flags() {
        let now = at(2024, 3, 5, 10, 0);
        let h = harness_at(now, true, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), at(2024, 3, 1, 0, 0));
        h.db.insert_reminder(&r).unwrap();

        let s1 = h.worker.tick().await;
        assert_eq!(s1.failures, 1);
        let stored = h.db.get_reminder(&r.id).unwrap().unwrap();
        assert!(stored.last_sent_at.is_none());
        assert_eq!(stored.failure_count, 1);

        // Second consecutive failure hits max_consecutive_failures = 2.
        let _ = h.worker.tick().await;
        let stored = h.db.get_reminder(&r.id).unwrap().unwrap();
        assert!(stored.needs_attention);

        // Flagged obligations are no longer attempted.
        let s3 = h.worker.tick().await;
        assert_eq!(s3.failures, 0);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_smart_reminder_through_tick() {
        let now = at(2024, 3, 10, 12, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        h.db.insert_entry(&Entry::new(
            "u1",
            EntryType::Text,
            "old entry",
            d(2024, 3, 6),
            at(2024, 3, 6, 10, 0),
        ))
        .unwrap();
        let r = Reminder::smart("u1", 3, at(2024, 3, 1, 0, 0));
        h.db.insert_reminder(&r).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.reminders_sent, 1);
        // Smart anchor is the fire instant.
        let stored = h.db.get_reminder(&r.id).unwrap().unwrap();
        assert_eq!(stored.last_sent_at, Some(now));

        let s2 = h.worker.tick().await;
        assert_eq!(s2.reminders_sent, 0);
    }

    #[tokio::test]
    async fn test_email_subscription_fires_and_advances_seven_days() {
        let now = at(2024, 1, 29, 9, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);
        let mut sub = EmailSubscription::new(
            "u1",
            Frequency::Weekly,
            EntryFilter::Both,
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_email_date = Some(d(2024, 1, 29));
        h.db.insert_email_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.emails_sent, 1);
        assert_eq!(h.sender.calls.load(Ordering::SeqCst), 1);

        // Exactly seven days on, across the month boundary.
        let stored = h.db.get_email_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_email_date, Some(d(2024, 2, 5)));
        assert_eq!(stored.last_emailed_at, Some(now));

        let s2 = h.worker.tick().await;
        assert_eq!(s2.emails_sent, 0);
    }

    #[tokio::test]
    async fn test_unmaterialized_subscription_gets_next_date_not_fired() {
        let now = at(2024, 1, 10, 9, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        let sub = EmailSubscription::new(
            "u1",
            Frequency::Weekly,
            EntryFilter::Both,
            true,
            at(2024, 1, 8, 0, 0),
        );
        h.db.insert_email_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.emails_sent, 0);
        let stored = h.db.get_email_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_email_date, Some(d(2024, 1, 15)));
    }

    #[tokio::test]
    async fn test_print_vendor_5xx_leaves_anchor_for_retry() {
        // The §8 shape: monthly print subscription due 2024-01-28, vendor
        // submit answers 5xx.
        let now = at(2024, 1, 28, 9, 0);
        let h = harness_at(now, false, VendorMode::ServerError);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);
        let mut sub = PrintSubscription::new(
            "u1",
            Frequency::Monthly,
            "1 Main St, Springfield",
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_print_date = Some(d(2024, 1, 28));
        h.db.insert_print_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.failures, 1);

        // Order is terminal-failed, subscription anchor unchanged.
        let orders = h.db.orders_for_user("u1").unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Failed);
        let stored = h.db.get_print_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_print_date, Some(d(2024, 1, 28)));

        // Vendor recovers: the next tick retries with a fresh order.
        *h.vendor.mode.lock().unwrap() = VendorMode::Accept;
        let s2 = h.worker.tick().await;
        assert_eq!(s2.prints_fulfilled, 1);
        let stored = h.db.get_print_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_print_date, Some(d(2024, 2, 28)));
        assert_eq!(h.db.orders_for_user("u1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_payment_declined_advances_to_next_cycle() {
        let now = at(2024, 1, 28, 9, 0);
        let h = harness_at(now, false, VendorMode::Decline);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);
        let mut sub = PrintSubscription::new(
            "u1",
            Frequency::Monthly,
            "1 Main St",
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_print_date = Some(d(2024, 1, 28));
        h.db.insert_print_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.failures, 1);

        let orders = h.db.orders_for_user("u1").unwrap();
        assert_eq!(orders[0].status, OrderStatus::PaymentFailed);
        // No immediate retry: the cycle moved on.
        let stored = h.db.get_print_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_print_date, Some(d(2024, 2, 28)));
        assert!(!stored.needs_attention);

        let s2 = h.worker.tick().await;
        assert_eq!(h.vendor.submits.load(Ordering::SeqCst), 1);
        assert_eq!(s2.failures, 0);
    }

    #[tokio::test]
    async fn test_deactivated_subscription_is_ignored() {
        let now = at(2024, 1, 29, 9, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);
        let mut sub = EmailSubscription::new(
            "u1",
            Frequency::Weekly,
            EntryFilter::Both,
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_email_date = Some(d(2024, 1, 29));
        sub.is_active = false;
        h.db.insert_email_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.emails_sent, 0);
        assert_eq!(h.sender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_send_now_bypasses_anchors() {
        let now = at(2024, 1, 29, 9, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);
        let mut sub = EmailSubscription::new(
            "u1",
            Frequency::Weekly,
            EntryFilter::Both,
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_email_date = Some(d(2024, 2, 5));
        h.db.insert_email_subscription(&sub).unwrap();

        let sent = h
            .worker
            .send_report_now("u1", 30, EntryFilter::Both, true)
            .await
            .unwrap();
        assert_eq!(sent, 3);

        // Outside the recurring cadence: no bookkeeping moved.
        let stored = h.db.get_email_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(stored.next_email_date, Some(d(2024, 2, 5)));
        assert!(stored.last_emailed_at.is_none());
    }

    #[tokio::test]
    async fn test_manual_print_order_has_no_subscription_id() {
        let now = at(2024, 1, 29, 9, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "UTC");
        seed_entries(&h.db);

        let outcome = h
            .worker
            .order_print_now("u1", 30, "1 Main St", false)
            .await
            .unwrap();
        let PrintOutcome::Submitted(order) = outcome else {
            panic!("expected submitted order");
        };
        assert!(order.subscription_id.is_none());
        assert_eq!(order.status, OrderStatus::InProduction);
    }

    #[tokio::test]
    async fn test_user_local_dueness_uses_their_timezone() {
        // 02:00 UTC on Jan 30 is still Jan 29 in New York; a subscription
        // due Jan 30 must not fire yet.
        let now = at(2024, 1, 30, 2, 0);
        let h = harness_at(now, false, VendorMode::Accept);
        seed_user(&h.db, "America/New_York");
        seed_entries(&h.db);
        let mut sub = EmailSubscription::new(
            "u1",
            Frequency::Weekly,
            EntryFilter::Both,
            true,
            at(2024, 1, 1, 0, 0),
        );
        sub.next_email_date = Some(d(2024, 1, 30));
        h.db.insert_email_subscription(&sub).unwrap();

        let s = h.worker.tick().await;
        assert_eq!(s.emails_sent, 0);
    }
}
