//! Injected time source.
//!
//! The engine never reads ambient system time directly — every due-decision
//! takes the current instant from a [`Clock`] so ticks are deterministic in
//! tests and reproducible in incident analysis.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Supplies the current instant and user-local calendar views of it.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Today's calendar date as seen in the given timezone.
    fn today_in(&self, tz: Tz) -> NaiveDate {
        self.now_utc().with_timezone(&tz).date_naive()
    }
}

/// Production clock — reads the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant. For tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}
