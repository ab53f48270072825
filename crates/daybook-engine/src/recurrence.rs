//! Occurrence calculation — pure local-calendar math.
//!
//! Turns a schedule definition, the last-fired anchor, and "now" into the
//! next due instant, interpreted in the user's IANA timezone. No function
//! here reads the system clock or touches storage.
//!
//! Anchoring rule: the search starts strictly after
//! `max(last_fired, now - one period)`. Computing from the last *occurrence*
//! (not the dispatch wall clock) prevents drift; flooring at one period back
//! bounds catch-up after worker downtime to a stale occurrence or two
//! instead of a storm.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use daybook_core::error::{DaybookError, Result};

use crate::obligations::{Frequency, RecurrenceKind, Reminder};

/// Next due instant for a calendar reminder (daily/weekly/monthly).
///
/// Returns `None` for smart reminders — those are evaluated at tick time
/// with [`is_smart_due`] because they depend on the mutable activity signal,
/// not a fixed calendar rule.
pub fn next_occurrence(
    reminder: &Reminder,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>> {
    let occurrence = match reminder.kind {
        RecurrenceKind::Smart => return Ok(None),
        RecurrenceKind::Daily => {
            let tod = require_time(reminder)?;
            let anchor = search_anchor(reminder.last_sent_at, now, Duration::days(1));
            next_daily(tod, anchor, tz)
        }
        RecurrenceKind::Weekly => {
            let tod = require_time(reminder)?;
            let dow = reminder.day_of_week.ok_or_else(|| {
                DaybookError::Validation("weekly reminder missing day_of_week".into())
            })?;
            let anchor = search_anchor(reminder.last_sent_at, now, Duration::days(7));
            next_weekly(dow, tod, anchor, tz)
        }
        RecurrenceKind::Monthly => {
            let tod = require_time(reminder)?;
            let dom = reminder.day_of_month.ok_or_else(|| {
                DaybookError::Validation("monthly reminder missing day_of_month".into())
            })?;
            if !(1..=28).contains(&dom) {
                return Err(DaybookError::Validation(format!(
                    "day_of_month {dom} out of range 1..=28"
                )));
            }
            let anchor = search_anchor(reminder.last_sent_at, now, Duration::days(32));
            next_monthly(dom, tod, anchor, tz)
        }
    };
    Ok(Some(occurrence))
}

/// Whether a calendar reminder is due at `now`.
pub fn is_due(reminder: &Reminder, now: DateTime<Utc>, tz: Tz) -> Result<bool> {
    Ok(next_occurrence(reminder, now, tz)?.is_some_and(|occ| occ <= now))
}

/// Smart reminder due check, evaluated against the activity signal.
///
/// The effective anchor is the latest of: last journaling activity, last
/// fire, and reminder creation. Due once `threshold_days` of silence have
/// elapsed from that anchor — so a fire re-arms the countdown, and a fresh
/// entry resets it.
pub fn is_smart_due(
    reminder: &Reminder,
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let threshold = reminder.smart_threshold_days.ok_or_else(|| {
        DaybookError::Validation("smart reminder missing smart_threshold_days".into())
    })?;
    let mut anchor = reminder.created_at;
    if let Some(activity) = last_activity {
        anchor = anchor.max(activity);
    }
    if let Some(sent) = reminder.last_sent_at {
        anchor = anchor.max(sent);
    }
    Ok(now - anchor >= Duration::days(i64::from(threshold)))
}

/// First materialized due date for a new subscription: one period after the
/// creation date.
pub fn initial_subscription_date(frequency: Frequency, created: NaiveDate) -> NaiveDate {
    add_period(frequency, created)
}

/// Advance a subscription's materialized date past `today`.
///
/// Steps whole periods from the previous due date (keeping phase — a weekly
/// subscription stays on its weekday across month boundaries) until the
/// result is strictly in the future.
pub fn advance_subscription(frequency: Frequency, from: NaiveDate, today: NaiveDate) -> NaiveDate {
    let mut next = add_period(frequency, from);
    while next <= today {
        next = add_period(frequency, next);
    }
    next
}

/// Start of the period that ends (exclusively) at `period_end`.
pub fn period_start(frequency: Frequency, period_end: NaiveDate) -> NaiveDate {
    match frequency {
        Frequency::Weekly => period_end - Duration::days(7),
        Frequency::Monthly => sub_months(period_end, 1),
        Frequency::Quarterly => sub_months(period_end, 3),
        Frequency::Yearly => sub_months(period_end, 12),
    }
}

fn add_period(frequency: Frequency, date: NaiveDate) -> NaiveDate {
    match frequency {
        Frequency::Weekly => date + Duration::days(7),
        Frequency::Monthly => add_months(date, 1),
        Frequency::Quarterly => add_months(date, 3),
        Frequency::Yearly => add_months(date, 12),
    }
}

fn add_months(date: NaiveDate, n: u32) -> NaiveDate {
    // chrono clamps to the end of a shorter month (Jan 31 + 1mo = Feb 29/28).
    date.checked_add_months(Months::new(n)).unwrap_or(date)
}

fn sub_months(date: NaiveDate, n: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(n)).unwrap_or(date)
}

fn require_time(reminder: &Reminder) -> Result<NaiveTime> {
    reminder.time_of_day.ok_or_else(|| {
        DaybookError::Validation(format!(
            "{} reminder missing time_of_day",
            reminder.kind.as_str()
        ))
    })
}

/// Strictly-after anchor: the last fire, floored at one period before now.
/// A reminder that never fired searches from now itself, which yields
/// "today if the time has not passed, else the next match".
fn search_anchor(
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    period: Duration,
) -> DateTime<Utc> {
    match last_fired {
        Some(fired) => fired.max(now - period),
        None => now,
    }
}

fn next_daily(tod: NaiveTime, anchor: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let anchor_local = anchor.with_timezone(&tz);
    let mut day = anchor_local.date_naive();
    loop {
        let candidate = resolve_local(tz, day, tod);
        if candidate > anchor {
            return candidate;
        }
        day = day.succ_opt().expect("date overflow");
    }
}

fn next_weekly(dow: u8, tod: NaiveTime, anchor: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let anchor_local = anchor.with_timezone(&tz);
    let mut day = anchor_local.date_naive();
    loop {
        // chrono: num_days_from_sunday is 0 for Sunday, matching our 0..=6.
        if day.weekday().num_days_from_sunday() == u32::from(dow) {
            let candidate = resolve_local(tz, day, tod);
            if candidate > anchor {
                return candidate;
            }
        }
        day = day.succ_opt().expect("date overflow");
    }
}

fn next_monthly(dom: u8, tod: NaiveTime, anchor: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let anchor_local = anchor.with_timezone(&tz);
    let mut year = anchor_local.year();
    let mut month = anchor_local.month();
    loop {
        // dom <= 28, so this date exists in every month, February included.
        let day = NaiveDate::from_ymd_opt(year, month, u32::from(dom))
            .expect("day_of_month capped at 28");
        let candidate = resolve_local(tz, day, tod);
        if candidate > anchor {
            return candidate;
        }
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
}

/// Resolve a local wall time to an instant.
///
/// A time inside the spring-forward gap resolves one hour later; an
/// ambiguous fall-back time resolves to the earlier instant.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    use chrono::offset::LocalResult;
    use chrono::TimeZone;

    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = date.and_time(time) + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) => dt.with_timezone(&Utc),
                LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&shifted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn tod(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_daily_never_fired_today_if_time_ahead() {
        let r = Reminder::daily("u1", tod(9, 0), at(2024, 3, 4, 0, 0));
        // 07:30 local in UTC zone, target 09:00 -> today.
        let next = next_occurrence(&r, at(2024, 3, 5, 7, 30), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 5, 9, 0));
    }

    #[test]
    fn test_daily_never_fired_tomorrow_if_time_passed() {
        let r = Reminder::daily("u1", tod(9, 0), at(2024, 3, 4, 0, 0));
        let next = next_occurrence(&r, at(2024, 3, 5, 10, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 6, 9, 0));
    }

    #[test]
    fn test_daily_respects_user_timezone() {
        let r = Reminder::daily("u1", tod(9, 0), at(2024, 6, 1, 0, 0));
        // 14:00 UTC = 10:00 in New York (EDT): 09:00 local already passed,
        // so next is tomorrow 09:00 EDT = 13:00 UTC.
        let next = next_occurrence(&r, at(2024, 6, 10, 14, 0), New_York)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 6, 11, 13, 0));

        // 12:00 UTC = 08:00 EDT: today still ahead.
        let next = next_occurrence(&r, at(2024, 6, 10, 12, 0), New_York)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 6, 10, 13, 0));
    }

    #[test]
    fn test_daily_fired_today_rolls_to_tomorrow() {
        let mut r = Reminder::daily("u1", tod(9, 0), at(2024, 3, 4, 0, 0));
        r.last_sent_at = Some(at(2024, 3, 5, 9, 0));
        let next = next_occurrence(&r, at(2024, 3, 5, 9, 5), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 6, 9, 0));
        assert!(!is_due(&r, at(2024, 3, 5, 23, 59), UTC).unwrap());
        assert!(is_due(&r, at(2024, 3, 6, 9, 0), UTC).unwrap());
    }

    #[test]
    fn test_daily_downtime_fires_at_most_one_stale_occurrence() {
        let mut r = Reminder::daily("u1", tod(9, 0), at(2024, 3, 1, 0, 0));
        // Last fired five days ago; worker was down since.
        r.last_sent_at = Some(at(2024, 3, 5, 9, 0));
        let next = next_occurrence(&r, at(2024, 3, 10, 12, 0), UTC)
            .unwrap()
            .unwrap();
        // Floored at now - 1 day: only today's occurrence is due, not the
        // four missed ones.
        assert_eq!(next, at(2024, 3, 10, 9, 0));
    }

    #[test]
    fn test_weekly_next_matching_weekday() {
        // 2024-03-05 is a Tuesday. Want Friday (dow 5) at 18:00.
        let r = Reminder::weekly("u1", 5, tod(18, 0), at(2024, 3, 1, 0, 0));
        let next = next_occurrence(&r, at(2024, 3, 5, 12, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 8, 18, 0));
    }

    #[test]
    fn test_weekly_today_included_if_time_ahead() {
        // 2024-03-08 is a Friday.
        let r = Reminder::weekly("u1", 5, tod(18, 0), at(2024, 3, 1, 0, 0));
        let next = next_occurrence(&r, at(2024, 3, 8, 9, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 8, 18, 0));
        // Time already passed -> next Friday.
        let next = next_occurrence(&r, at(2024, 3, 8, 19, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 15, 18, 0));
    }

    #[test]
    fn test_weekly_after_fire_advances_one_week() {
        let mut r = Reminder::weekly("u1", 5, tod(18, 0), at(2024, 3, 1, 0, 0));
        r.last_sent_at = Some(at(2024, 3, 8, 18, 0));
        let next = next_occurrence(&r, at(2024, 3, 8, 18, 10), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 3, 15, 18, 0));
    }

    #[test]
    fn test_monthly_handles_february() {
        let r = Reminder::monthly("u1", 28, tod(8, 0), at(2024, 1, 1, 0, 0));
        let next = next_occurrence(&r, at(2024, 2, 1, 0, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2024, 2, 28, 8, 0));

        // Non-leap year too.
        let next = next_occurrence(&r, at(2023, 2, 1, 0, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2023, 2, 28, 8, 0));
    }

    #[test]
    fn test_monthly_rolls_into_next_month_and_year() {
        let mut r = Reminder::monthly("u1", 15, tod(8, 0), at(2024, 1, 1, 0, 0));
        r.last_sent_at = Some(at(2024, 12, 15, 8, 0));
        let next = next_occurrence(&r, at(2024, 12, 20, 0, 0), UTC)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2025, 1, 15, 8, 0));
    }

    #[test]
    fn test_smart_due_after_threshold_of_inactivity() {
        let created = at(2024, 3, 1, 0, 0);
        let r = Reminder::smart("u1", 3, created);
        let last_activity = Some(at(2024, 3, 6, 10, 0));

        // Four days of silence, never fired -> due.
        assert!(is_smart_due(&r, last_activity, at(2024, 3, 10, 12, 0)).unwrap());
        // Two days of silence -> not due.
        assert!(!is_smart_due(&r, last_activity, at(2024, 3, 8, 10, 0)).unwrap());
    }

    #[test]
    fn test_smart_rearms_from_fire_anchor() {
        let created = at(2024, 3, 1, 0, 0);
        let mut r = Reminder::smart("u1", 3, created);
        let last_activity = Some(at(2024, 3, 6, 10, 0));

        // Fired at day 10; not due again until 3 more inactive days pass.
        r.last_sent_at = Some(at(2024, 3, 10, 12, 0));
        assert!(!is_smart_due(&r, last_activity, at(2024, 3, 12, 12, 0)).unwrap());
        assert!(is_smart_due(&r, last_activity, at(2024, 3, 13, 12, 0)).unwrap());

        // Fresh journaling resets the countdown.
        let new_activity = Some(at(2024, 3, 12, 9, 0));
        assert!(!is_smart_due(&r, new_activity, at(2024, 3, 13, 12, 0)).unwrap());
        assert!(is_smart_due(&r, new_activity, at(2024, 3, 15, 9, 0)).unwrap());
    }

    #[test]
    fn test_smart_without_entries_anchors_to_creation() {
        let r = Reminder::smart("u1", 3, at(2024, 3, 1, 0, 0));
        assert!(!is_smart_due(&r, None, at(2024, 3, 2, 0, 0)).unwrap());
        assert!(is_smart_due(&r, None, at(2024, 3, 4, 0, 0)).unwrap());
    }

    #[test]
    fn test_subscription_weekly_advance_is_exactly_seven_days() {
        // Crossing a month boundary changes nothing.
        let next = advance_subscription(Frequency::Weekly, date(2024, 1, 29), date(2024, 1, 29));
        assert_eq!(next, date(2024, 2, 5));
    }

    #[test]
    fn test_subscription_advance_skips_past_today_preserving_phase() {
        // Subscription lapsed for three weeks; next stays on the same weekday.
        let next = advance_subscription(Frequency::Weekly, date(2024, 1, 1), date(2024, 1, 22));
        assert_eq!(next, date(2024, 1, 29));
        assert_eq!(next.weekday(), date(2024, 1, 1).weekday());
    }

    #[test]
    fn test_subscription_monthly_quarterly_yearly() {
        assert_eq!(
            advance_subscription(Frequency::Monthly, date(2024, 1, 28), date(2024, 1, 28)),
            date(2024, 2, 28)
        );
        assert_eq!(
            advance_subscription(Frequency::Quarterly, date(2024, 1, 31), date(2024, 1, 31)),
            date(2024, 4, 30)
        );
        assert_eq!(
            advance_subscription(Frequency::Yearly, date(2024, 2, 29), date(2024, 2, 29)),
            date(2025, 2, 28)
        );
    }

    #[test]
    fn test_initial_subscription_date() {
        assert_eq!(
            initial_subscription_date(Frequency::Weekly, date(2024, 3, 4)),
            date(2024, 3, 11)
        );
        assert_eq!(
            initial_subscription_date(Frequency::Monthly, date(2024, 1, 31)),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn test_period_start_inverse_of_period() {
        assert_eq!(
            period_start(Frequency::Weekly, date(2024, 2, 5)),
            date(2024, 1, 29)
        );
        assert_eq!(
            period_start(Frequency::Monthly, date(2024, 3, 28)),
            date(2024, 2, 28)
        );
        assert_eq!(
            period_start(Frequency::Yearly, date(2025, 1, 15)),
            date(2024, 1, 15)
        );
    }

    #[test]
    fn test_spring_forward_gap_resolves_one_hour_later() {
        // US DST 2024: 02:30 local does not exist on March 10 in New York.
        let r = Reminder::daily("u1", tod(2, 30), at(2024, 3, 1, 0, 0));
        let next = next_occurrence(&r, at(2024, 3, 10, 5, 0), New_York)
            .unwrap()
            .unwrap();
        // Resolved to 03:30 EDT = 07:30 UTC.
        assert_eq!(next, at(2024, 3, 10, 7, 30));
    }

    #[test]
    fn test_smart_returns_no_calendar_occurrence() {
        let r = Reminder::smart("u1", 3, at(2024, 3, 1, 0, 0));
        assert!(
            next_occurrence(&r, at(2024, 3, 10, 0, 0), UTC)
                .unwrap()
                .is_none()
        );
    }
}
