//! SQLite-backed obligation store.
//!
//! One database holds users, entries, the three obligation tables, and
//! print orders. WAL mode allows concurrent readers alongside the worker.
//! The per-obligation lease lives here as a conditional UPDATE — never an
//! in-process lock — so horizontally-scaled workers stay correct.
//!
//! Timestamps persist as fixed-width RFC 3339 UTC text and calendar dates
//! as `YYYY-MM-DD`, both of which order lexicographically in SQL.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc};
use daybook_core::error::{DaybookError, Result};
use daybook_core::types::{Entry, EntryType, User};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;

use crate::obligations::{
    EmailSubscription, EntryFilter, Frequency, OrderStatus, PrintOrder, PrintSubscription,
    RecurrenceKind, Reminder,
};

/// Which obligation table a lease or failure operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationKind {
    Reminder,
    EmailSubscription,
    PrintSubscription,
}

impl ObligationKind {
    fn table(&self) -> &'static str {
        match self {
            ObligationKind::Reminder => "reminders",
            ObligationKind::EmailSubscription => "email_subscriptions",
            ObligationKind::PrintSubscription => "print_subscriptions",
        }
    }
}

/// Engine database — obligations, orders, entries, users.
pub struct EngineDb {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DaybookError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DaybookError::Storage(format!("bad date '{s}': {e}")))
}

fn opt_day(s: Option<String>) -> Result<Option<NaiveDate>> {
    s.as_deref().map(parse_day).transpose()
}

fn clock(t: NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

fn parse_clock(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .map_err(|e| DaybookError::Storage(format!("bad time '{s}': {e}")))
}

fn db_err(e: rusqlite::Error) -> DaybookError {
    DaybookError::Storage(e.to_string())
}

impl EngineDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database. For tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DaybookError::Storage(format!("connection lock poisoned: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                email TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                entry_type TEXT NOT NULL,        -- text, photo, audio, video, digest
                body TEXT NOT NULL DEFAULT '',
                entry_date TEXT NOT NULL,        -- journal day, YYYY-MM-DD
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_user_date
                ON entries(user_id, entry_date);

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,              -- daily, weekly, monthly, smart
                time_of_day TEXT,
                day_of_week INTEGER,
                day_of_month INTEGER,
                smart_threshold_days INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_sent_at TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                needs_attention INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS email_subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                frequency TEXT NOT NULL,         -- weekly, monthly, quarterly, yearly
                entry_filter TEXT NOT NULL DEFAULT 'both',
                include_images INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                next_email_date TEXT,
                last_emailed_at TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                needs_attention INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS print_subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                frequency TEXT NOT NULL,
                shipping_address TEXT NOT NULL,
                color INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                next_print_date TEXT,
                last_printed_at TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                needs_attention INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS print_orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subscription_id TEXT,            -- NULL for ad-hoc orders
                status TEXT NOT NULL DEFAULT 'pending',
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                entry_count INTEGER NOT NULL DEFAULT 0,
                page_count INTEGER NOT NULL DEFAULT 0,
                cost_cents INTEGER,
                retail_cents INTEGER,
                vendor_job_id TEXT,
                tracking_url TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status
                ON print_orders(status);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ─── Users ───────────────────────────────────────────────

    pub fn upsert_user(&self, user: &User) -> Result<()> {
        user.tz()?; // reject unknown zone names at the boundary
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO users (id, timezone, email, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user.id, user.timezone, user.email, ts(user.created_at)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, timezone, email, created_at FROM users WHERE id = ?1")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;
        match rows.next() {
            Some(row) => {
                let (id, timezone, email, created) = row.map_err(db_err)?;
                Ok(Some(User {
                    id,
                    timezone,
                    email,
                    created_at: parse_ts(&created)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, timezone, email, created_at FROM users ORDER BY created_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;
        let mut users = Vec::new();
        for row in rows {
            let (id, timezone, email, created) = row.map_err(db_err)?;
            users.push(User {
                id,
                timezone,
                email,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(users)
    }

    // ─── Entries ─────────────────────────────────────────────

    pub fn insert_entry(&self, entry: &Entry) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO entries (id, user_id, entry_type, body, entry_date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.user_id,
                    entry.entry_type.as_str(),
                    entry.body,
                    day(entry.entry_date),
                    ts(entry.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Entries whose journal day falls in `[start, end)`, filtered per the
    /// report preference, ordered by day ascending.
    pub fn entries_in_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        filter: EntryFilter,
    ) -> Result<Vec<Entry>> {
        let type_clause = match filter {
            EntryFilter::Daily => " AND entry_type = 'digest'",
            EntryFilter::Individual => " AND entry_type != 'digest'",
            EntryFilter::Both => "",
        };
        let sql = format!(
            "SELECT id, user_id, entry_type, body, entry_date, created_at FROM entries
             WHERE user_id = ?1 AND entry_date >= ?2 AND entry_date < ?3{type_clause}
             ORDER BY entry_date ASC, created_at ASC"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id, day(start), day(end)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, user_id, ty, body, date, created) = row.map_err(db_err)?;
            let entry_type = EntryType::parse(&ty)
                .ok_or_else(|| DaybookError::Storage(format!("unknown entry type '{ty}'")))?;
            entries.push(Entry {
                id,
                user_id,
                entry_type,
                body,
                entry_date: parse_day(&date)?,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(entries)
    }

    /// Activity signal: when the user last journaled. Digests are machine
    /// output and do not count.
    pub fn last_entry_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM entries
                 WHERE user_id = ?1 AND entry_type != 'digest'",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        opt_ts(latest)
    }

    pub fn has_digest(&self, user_id: &str, date: NaiveDate) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entries
                 WHERE user_id = ?1 AND entry_date = ?2 AND entry_type = 'digest'",
                params![user_id, day(date)],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Users who journaled on `date` but have no digest for it yet.
    pub fn users_missing_digest(&self, date: NaiveDate) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM entries e
                 WHERE entry_date = ?1 AND entry_type != 'digest'
                 AND NOT EXISTS (
                     SELECT 1 FROM entries d
                     WHERE d.user_id = e.user_id AND d.entry_date = ?1
                       AND d.entry_type = 'digest'
                 )",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![day(date)], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.map_err(db_err)?);
        }
        Ok(users)
    }

    // ─── Reminders ───────────────────────────────────────────

    pub fn insert_reminder(&self, reminder: &Reminder) -> Result<()> {
        reminder.validate()?;
        self.save_reminder(reminder)
    }

    fn save_reminder(&self, r: &Reminder) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO reminders
                 (id, user_id, kind, time_of_day, day_of_week, day_of_month,
                  smart_threshold_days, is_active, last_sent_at, failure_count,
                  needs_attention, claimed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    r.id,
                    r.user_id,
                    r.kind.as_str(),
                    r.time_of_day.map(clock),
                    r.day_of_week,
                    r.day_of_month,
                    r.smart_threshold_days,
                    r.is_active as i32,
                    r.last_sent_at.map(ts),
                    r.failure_count,
                    r.needs_attention as i32,
                    r.claimed_at.map(ts),
                    ts(r.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_reminder(&self, id: &str) -> Result<Option<Reminder>> {
        let mut list = self.query_reminders("WHERE id = ?1", params![id])?;
        Ok(list.pop())
    }

    /// Active reminders not flagged for manual review.
    pub fn active_reminders(&self) -> Result<Vec<Reminder>> {
        self.query_reminders(
            "WHERE is_active = 1 AND needs_attention = 0 ORDER BY created_at",
            params![],
        )
    }

    fn query_reminders(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Reminder>> {
        let sql = format!(
            "SELECT id, user_id, kind, time_of_day, day_of_week, day_of_month,
                    smart_threshold_days, is_active, last_sent_at, failure_count,
                    needs_attention, claimed_at, created_at
             FROM reminders {where_clause}"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        type ReminderRow = (
            String,
            String,
            String,
            Option<String>,
            Option<u8>,
            Option<u8>,
            Option<u32>,
            i32,
            Option<String>,
            u32,
            i32,
            Option<String>,
            String,
        );
        let rows = stmt
            .query_map(args, |row| {
                Ok::<ReminderRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                ))
            })
            .map_err(db_err)?;

        let mut reminders = Vec::new();
        for row in rows {
            let (
                id,
                user_id,
                kind,
                time_of_day,
                day_of_week,
                day_of_month,
                smart_threshold_days,
                is_active,
                last_sent_at,
                failure_count,
                needs_attention,
                claimed_at,
                created_at,
            ) = row.map_err(db_err)?;
            let kind = RecurrenceKind::parse(&kind)
                .ok_or_else(|| DaybookError::Storage(format!("unknown recurrence '{kind}'")))?;
            reminders.push(Reminder {
                id,
                user_id,
                kind,
                time_of_day: time_of_day.as_deref().map(parse_clock).transpose()?,
                day_of_week,
                day_of_month,
                smart_threshold_days,
                is_active: is_active != 0,
                last_sent_at: opt_ts(last_sent_at)?,
                failure_count,
                needs_attention: needs_attention != 0,
                claimed_at: opt_ts(claimed_at)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(reminders)
    }

    /// Record a successful fire: the anchor becomes the occurrence instant,
    /// never the dispatch wall clock.
    pub fn mark_reminder_sent(&self, id: &str, occurrence: DateTime<Utc>) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE reminders
                 SET last_sent_at = ?1, failure_count = 0, claimed_at = NULL
                 WHERE id = ?2",
                params![ts(occurrence), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_reminder_active(&self, id: &str, active: bool) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE reminders SET is_active = ?1 WHERE id = ?2",
                params![active as i32, id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ─── Email subscriptions ─────────────────────────────────

    pub fn insert_email_subscription(&self, sub: &EmailSubscription) -> Result<()> {
        self.save_email_subscription(sub)
    }

    fn save_email_subscription(&self, s: &EmailSubscription) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO email_subscriptions
                 (id, user_id, frequency, entry_filter, include_images, is_active,
                  next_email_date, last_emailed_at, failure_count, needs_attention,
                  claimed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    s.id,
                    s.user_id,
                    s.frequency.as_str(),
                    s.entry_filter.as_str(),
                    s.include_images as i32,
                    s.is_active as i32,
                    s.next_email_date.map(day),
                    s.last_emailed_at.map(ts),
                    s.failure_count,
                    s.needs_attention as i32,
                    s.claimed_at.map(ts),
                    ts(s.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_email_subscription(&self, id: &str) -> Result<Option<EmailSubscription>> {
        let mut list = self.query_email_subscriptions("WHERE id = ?1", params![id])?;
        Ok(list.pop())
    }

    pub fn active_email_subscriptions(&self) -> Result<Vec<EmailSubscription>> {
        self.query_email_subscriptions(
            "WHERE is_active = 1 AND needs_attention = 0 ORDER BY created_at",
            params![],
        )
    }

    fn query_email_subscriptions(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<EmailSubscription>> {
        let sql = format!(
            "SELECT id, user_id, frequency, entry_filter, include_images, is_active,
                    next_email_date, last_emailed_at, failure_count, needs_attention,
                    claimed_at, created_at
             FROM email_subscriptions {where_clause}"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        type SubRow = (
            String,
            String,
            String,
            String,
            i32,
            i32,
            Option<String>,
            Option<String>,
            u32,
            i32,
            Option<String>,
            String,
        );
        let rows = stmt
            .query_map(args, |row| {
                Ok::<SubRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            })
            .map_err(db_err)?;

        let mut subs = Vec::new();
        for row in rows {
            let (
                id,
                user_id,
                frequency,
                entry_filter,
                include_images,
                is_active,
                next_email_date,
                last_emailed_at,
                failure_count,
                needs_attention,
                claimed_at,
                created_at,
            ) = row.map_err(db_err)?;
            subs.push(EmailSubscription {
                id,
                user_id,
                frequency: Frequency::parse(&frequency).ok_or_else(|| {
                    DaybookError::Storage(format!("unknown frequency '{frequency}'"))
                })?,
                entry_filter: EntryFilter::parse(&entry_filter).ok_or_else(|| {
                    DaybookError::Storage(format!("unknown entry filter '{entry_filter}'"))
                })?,
                include_images: include_images != 0,
                is_active: is_active != 0,
                next_email_date: opt_day(next_email_date)?,
                last_emailed_at: opt_ts(last_emailed_at)?,
                failure_count,
                needs_attention: needs_attention != 0,
                claimed_at: opt_ts(claimed_at)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(subs)
    }

    pub fn set_next_email_date(&self, id: &str, date: NaiveDate) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE email_subscriptions SET next_email_date = ?1 WHERE id = ?2",
                params![day(date), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a successful send and advance the materialized date.
    pub fn mark_email_sent(
        &self,
        id: &str,
        sent_at: DateTime<Utc>,
        next_date: NaiveDate,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE email_subscriptions
                 SET last_emailed_at = ?1, next_email_date = ?2,
                     failure_count = 0, claimed_at = NULL
                 WHERE id = ?3",
                params![ts(sent_at), day(next_date), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ─── Print subscriptions ─────────────────────────────────

    pub fn insert_print_subscription(&self, sub: &PrintSubscription) -> Result<()> {
        sub.validate()?;
        self.save_print_subscription(sub)
    }

    fn save_print_subscription(&self, s: &PrintSubscription) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO print_subscriptions
                 (id, user_id, frequency, shipping_address, color, is_active,
                  next_print_date, last_printed_at, failure_count, needs_attention,
                  claimed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    s.id,
                    s.user_id,
                    s.frequency.as_str(),
                    s.shipping_address,
                    s.color as i32,
                    s.is_active as i32,
                    s.next_print_date.map(day),
                    s.last_printed_at.map(ts),
                    s.failure_count,
                    s.needs_attention as i32,
                    s.claimed_at.map(ts),
                    ts(s.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_print_subscription(&self, id: &str) -> Result<Option<PrintSubscription>> {
        let mut list = self.query_print_subscriptions("WHERE id = ?1", params![id])?;
        Ok(list.pop())
    }

    pub fn active_print_subscriptions(&self) -> Result<Vec<PrintSubscription>> {
        self.query_print_subscriptions(
            "WHERE is_active = 1 AND needs_attention = 0 ORDER BY created_at",
            params![],
        )
    }

    fn query_print_subscriptions(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<PrintSubscription>> {
        let sql = format!(
            "SELECT id, user_id, frequency, shipping_address, color, is_active,
                    next_print_date, last_printed_at, failure_count, needs_attention,
                    claimed_at, created_at
             FROM print_subscriptions {where_clause}"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        type SubRow = (
            String,
            String,
            String,
            String,
            i32,
            i32,
            Option<String>,
            Option<String>,
            u32,
            i32,
            Option<String>,
            String,
        );
        let rows = stmt
            .query_map(args, |row| {
                Ok::<SubRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            })
            .map_err(db_err)?;

        let mut subs = Vec::new();
        for row in rows {
            let (
                id,
                user_id,
                frequency,
                shipping_address,
                color,
                is_active,
                next_print_date,
                last_printed_at,
                failure_count,
                needs_attention,
                claimed_at,
                created_at,
            ) = row.map_err(db_err)?;
            subs.push(PrintSubscription {
                id,
                user_id,
                frequency: Frequency::parse(&frequency).ok_or_else(|| {
                    DaybookError::Storage(format!("unknown frequency '{frequency}'"))
                })?,
                shipping_address,
                color: color != 0,
                is_active: is_active != 0,
                next_print_date: opt_day(next_print_date)?,
                last_printed_at: opt_ts(last_printed_at)?,
                failure_count,
                needs_attention: needs_attention != 0,
                claimed_at: opt_ts(claimed_at)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(subs)
    }

    pub fn set_next_print_date(&self, id: &str, date: NaiveDate) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE print_subscriptions SET next_print_date = ?1 WHERE id = ?2",
                params![day(date), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn mark_print_sent(
        &self,
        id: &str,
        sent_at: DateTime<Utc>,
        next_date: NaiveDate,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE print_subscriptions
                 SET last_printed_at = ?1, next_print_date = ?2,
                     failure_count = 0, claimed_at = NULL
                 WHERE id = ?3",
                params![ts(sent_at), day(next_date), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ─── Lease & failure accounting ──────────────────────────

    /// Claim an obligation for this tick.
    ///
    /// Single conditional UPDATE: succeeds only if the row is unclaimed or
    /// its claim is older than the staleness window (an abandoned lease from
    /// a crashed worker). Safe across concurrently running workers.
    pub fn claim(
        &self,
        kind: ObligationKind,
        id: &str,
        now: DateTime<Utc>,
        stale_secs: u64,
    ) -> Result<bool> {
        let cutoff = now - Duration::seconds(stale_secs as i64);
        let sql = format!(
            "UPDATE {} SET claimed_at = ?1
             WHERE id = ?2 AND (claimed_at IS NULL OR claimed_at < ?3)",
            kind.table()
        );
        let changed = self
            .lock()?
            .execute(&sql, params![ts(now), id, ts(cutoff)])
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Release a claim without touching the anchor (failure path).
    pub fn release(&self, kind: ObligationKind, id: &str) -> Result<()> {
        let sql = format!("UPDATE {} SET claimed_at = NULL WHERE id = ?1", kind.table());
        self.lock()?.execute(&sql, params![id]).map_err(db_err)?;
        Ok(())
    }

    /// Count a consecutive transient failure; flag the obligation for manual
    /// review once `max_failures` is reached. Returns whether it was flagged.
    pub fn record_failure(&self, kind: ObligationKind, id: &str, max_failures: u32) -> Result<bool> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE {} SET failure_count = failure_count + 1, claimed_at = NULL,
                 needs_attention = CASE WHEN failure_count + 1 >= ?1 THEN 1
                                        ELSE needs_attention END
             WHERE id = ?2",
            kind.table()
        );
        conn.execute(&sql, params![max_failures, id]).map_err(db_err)?;
        let flagged: i32 = conn
            .query_row(
                &format!("SELECT needs_attention FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(flagged != 0)
    }

    /// Flag immediately (contract violations found at dispatch time).
    pub fn flag_attention(&self, kind: ObligationKind, id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET needs_attention = 1, claimed_at = NULL WHERE id = ?1",
            kind.table()
        );
        self.lock()?.execute(&sql, params![id]).map_err(db_err)?;
        Ok(())
    }

    /// Manual reset after review: clears the flag and the failure streak.
    pub fn clear_attention(&self, kind: ObligationKind, id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET needs_attention = 0, failure_count = 0 WHERE id = ?1",
            kind.table()
        );
        self.lock()?.execute(&sql, params![id]).map_err(db_err)?;
        Ok(())
    }

    // ─── Print orders ────────────────────────────────────────

    pub fn insert_order(&self, order: &PrintOrder) -> Result<()> {
        self.save_order(order)
    }

    pub fn save_order(&self, o: &PrintOrder) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO print_orders
                 (id, user_id, subscription_id, status, period_start, period_end,
                  entry_count, page_count, cost_cents, retail_cents, vendor_job_id,
                  tracking_url, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    o.id,
                    o.user_id,
                    o.subscription_id,
                    o.status.as_str(),
                    day(o.period_start),
                    day(o.period_end),
                    o.entry_count,
                    o.page_count,
                    o.cost_cents,
                    o.retail_cents,
                    o.vendor_job_id,
                    o.tracking_url,
                    o.error_message,
                    ts(o.created_at),
                    ts(o.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_order(&self, id: &str) -> Result<Option<PrintOrder>> {
        let mut list = self.query_orders("WHERE id = ?1", params![id])?;
        Ok(list.pop())
    }

    /// Orders awaiting vendor progress: submitted, not yet terminal.
    pub fn open_orders(&self) -> Result<Vec<PrintOrder>> {
        self.query_orders(
            "WHERE vendor_job_id IS NOT NULL
             AND status IN ('in_production', 'shipped')
             ORDER BY created_at",
            params![],
        )
    }

    pub fn orders_for_user(&self, user_id: &str) -> Result<Vec<PrintOrder>> {
        self.query_orders("WHERE user_id = ?1 ORDER BY created_at DESC", params![user_id])
    }

    fn query_orders(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<PrintOrder>> {
        let sql = format!(
            "SELECT id, user_id, subscription_id, status, period_start, period_end,
                    entry_count, page_count, cost_cents, retail_cents, vendor_job_id,
                    tracking_url, error_message, created_at, updated_at
             FROM print_orders {where_clause}"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        type OrderRow = (
            String,
            String,
            Option<String>,
            String,
            String,
            String,
            u32,
            u32,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
        );
        let rows = stmt
            .query_map(args, |row| {
                Ok::<OrderRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                    row.get(14)?,
                ))
            })
            .map_err(db_err)?;

        let mut orders = Vec::new();
        for row in rows {
            let (
                id,
                user_id,
                subscription_id,
                status,
                period_start,
                period_end,
                entry_count,
                page_count,
                cost_cents,
                retail_cents,
                vendor_job_id,
                tracking_url,
                error_message,
                created_at,
                updated_at,
            ) = row.map_err(db_err)?;
            orders.push(PrintOrder {
                id,
                user_id,
                subscription_id,
                status: OrderStatus::parse(&status)
                    .ok_or_else(|| DaybookError::Storage(format!("unknown status '{status}'")))?,
                period_start: parse_day(&period_start)?,
                period_end: parse_day(&period_end)?,
                entry_count,
                page_count,
                cost_cents,
                retail_cents,
                vendor_job_id,
                tracking_url,
                error_message,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn d(y: i32, m: u32, da: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, da).unwrap()
    }

    fn seed_user(db: &EngineDb) {
        db.upsert_user(&User::new("u1", "America/New_York", now()))
            .unwrap();
    }

    #[test]
    fn test_user_roundtrip_and_bad_timezone() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let user = db.get_user("u1").unwrap().unwrap();
        assert_eq!(user.timezone, "America/New_York");
        assert!(user.tz().is_ok());
        assert!(db.get_user("nobody").unwrap().is_none());

        let bad = User::new("u2", "Mars/Olympus_Mons", now());
        assert!(db.upsert_user(&bad).is_err());
    }

    #[test]
    fn test_entries_in_range_filters_and_orders() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        for (ty, date) in [
            (EntryType::Text, d(2024, 3, 1)),
            (EntryType::Photo, d(2024, 3, 2)),
            (EntryType::Digest, d(2024, 3, 2)),
            (EntryType::Text, d(2024, 3, 8)), // outside range
        ] {
            db.insert_entry(&Entry::new("u1", ty, "body", date, now()))
                .unwrap();
        }

        let all = db
            .entries_in_range("u1", d(2024, 3, 1), d(2024, 3, 8), EntryFilter::Both)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].entry_date <= w[1].entry_date));

        let digests = db
            .entries_in_range("u1", d(2024, 3, 1), d(2024, 3, 8), EntryFilter::Daily)
            .unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].entry_type, EntryType::Digest);

        let individual = db
            .entries_in_range("u1", d(2024, 3, 1), d(2024, 3, 8), EntryFilter::Individual)
            .unwrap();
        assert_eq!(individual.len(), 2);
    }

    #[test]
    fn test_activity_signal_ignores_digests() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        assert!(db.last_entry_at("u1").unwrap().is_none());

        let early = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        db.insert_entry(&Entry::new("u1", EntryType::Text, "hi", d(2024, 3, 1), early))
            .unwrap();
        db.insert_entry(&Entry::new(
            "u1",
            EntryType::Digest,
            "digest",
            d(2024, 3, 9),
            now(),
        ))
        .unwrap();

        assert_eq!(db.last_entry_at("u1").unwrap(), Some(early));
    }

    #[test]
    fn test_reminder_roundtrip() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let r = Reminder::weekly("u1", 5, NaiveTime::from_hms_opt(18, 0, 0).unwrap(), now());
        db.insert_reminder(&r).unwrap();

        let loaded = db.get_reminder(&r.id).unwrap().unwrap();
        assert_eq!(loaded.kind, RecurrenceKind::Weekly);
        assert_eq!(loaded.day_of_week, Some(5));
        assert_eq!(loaded.time_of_day, r.time_of_day);
        assert!(loaded.last_sent_at.is_none());

        // Invalid records are rejected at the boundary.
        let mut bad = Reminder::monthly("u1", 28, NaiveTime::from_hms_opt(8, 0, 0).unwrap(), now());
        bad.day_of_month = Some(31);
        assert!(db.insert_reminder(&bad).is_err());
    }

    #[test]
    fn test_mark_reminder_sent_sets_occurrence_anchor() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), now());
        db.insert_reminder(&r).unwrap();

        let occurrence = Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap();
        db.claim(ObligationKind::Reminder, &r.id, now(), 1800).unwrap();
        db.mark_reminder_sent(&r.id, occurrence).unwrap();

        let loaded = db.get_reminder(&r.id).unwrap().unwrap();
        assert_eq!(loaded.last_sent_at, Some(occurrence));
        assert!(loaded.claimed_at.is_none());
        assert_eq!(loaded.failure_count, 0);
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), now());
        db.insert_reminder(&r).unwrap();

        assert!(db.claim(ObligationKind::Reminder, &r.id, now(), 1800).unwrap());
        // Second claim within the staleness window loses.
        assert!(!db.claim(ObligationKind::Reminder, &r.id, now(), 1800).unwrap());

        db.release(ObligationKind::Reminder, &r.id).unwrap();
        assert!(db.claim(ObligationKind::Reminder, &r.id, now(), 1800).unwrap());
    }

    #[test]
    fn test_stale_claim_is_reclaimable() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), now());
        db.insert_reminder(&r).unwrap();

        assert!(db.claim(ObligationKind::Reminder, &r.id, now(), 1800).unwrap());
        // A later tick, past the staleness window, takes over the abandoned
        // lease.
        let later = now() + Duration::seconds(3600);
        assert!(db.claim(ObligationKind::Reminder, &r.id, later, 1800).unwrap());
    }

    #[test]
    fn test_failure_streak_flags_for_attention() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let r = Reminder::daily("u1", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), now());
        db.insert_reminder(&r).unwrap();

        assert!(!db.record_failure(ObligationKind::Reminder, &r.id, 3).unwrap());
        assert!(!db.record_failure(ObligationKind::Reminder, &r.id, 3).unwrap());
        assert!(db.record_failure(ObligationKind::Reminder, &r.id, 3).unwrap());

        // Flagged obligations disappear from the active scan.
        assert!(db.active_reminders().unwrap().is_empty());

        db.clear_attention(ObligationKind::Reminder, &r.id).unwrap();
        let loaded = db.get_reminder(&r.id).unwrap().unwrap();
        assert!(!loaded.needs_attention);
        assert_eq!(loaded.failure_count, 0);
    }

    #[test]
    fn test_email_subscription_anchor_advance() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let mut sub =
            EmailSubscription::new("u1", Frequency::Weekly, EntryFilter::Both, true, now());
        sub.next_email_date = Some(d(2024, 3, 11));
        db.insert_email_subscription(&sub).unwrap();

        db.mark_email_sent(&sub.id, now(), d(2024, 3, 18)).unwrap();
        let loaded = db.get_email_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(loaded.next_email_date, Some(d(2024, 3, 18)));
        assert_eq!(loaded.last_emailed_at, Some(now()));
    }

    #[test]
    fn test_print_order_roundtrip_and_open_scan() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        let mut order = PrintOrder::new("u1", None, d(2024, 2, 1), d(2024, 3, 1), now());
        db.insert_order(&order).unwrap();

        // Not yet submitted: not in the open scan.
        assert!(db.open_orders().unwrap().is_empty());

        order.status = OrderStatus::InProduction;
        order.vendor_job_id = Some("job-42".into());
        order.cost_cents = Some(2350);
        db.save_order(&order).unwrap();

        let open = db.open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].vendor_job_id.as_deref(), Some("job-42"));

        order.status = OrderStatus::Delivered;
        db.save_order(&order).unwrap();
        assert!(db.open_orders().unwrap().is_empty());

        let history = db.orders_for_user("u1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Delivered);
    }

    #[test]
    fn test_users_missing_digest() {
        let db = EngineDb::open_in_memory().unwrap();
        seed_user(&db);
        db.upsert_user(&User::new("u2", "UTC", now())).unwrap();

        db.insert_entry(&Entry::new("u1", EntryType::Text, "a", d(2024, 3, 9), now()))
            .unwrap();
        db.insert_entry(&Entry::new("u2", EntryType::Text, "b", d(2024, 3, 9), now()))
            .unwrap();
        db.insert_entry(&Entry::new(
            "u2",
            EntryType::Digest,
            "done",
            d(2024, 3, 9),
            now(),
        ))
        .unwrap();

        let missing = db.users_missing_digest(d(2024, 3, 9)).unwrap();
        assert_eq!(missing, vec!["u1".to_string()]);
        assert!(db.has_digest("u2", d(2024, 3, 9)).unwrap());
        assert!(!db.has_digest("u1", d(2024, 3, 9)).unwrap());
    }
}
