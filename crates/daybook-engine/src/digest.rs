//! Daily digest aggregation.
//!
//! Rolls one user's individual entries for a calendar day into a single
//! synthetic `digest` entry, optionally run through the AI polish service.
//! The polish call is an opaque collaborator that may fail or time out; a
//! digest is never lost to it — the unpolished aggregate is stored instead.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use daybook_core::error::Result;
use daybook_core::types::{Entry, EntryType};
use std::sync::Arc;

use crate::obligations::EntryFilter;
use crate::persistence::EngineDb;

/// Opaque text-in/text-out polishing service.
#[async_trait]
pub trait Polisher: Send + Sync {
    async fn polish(&self, raw: &str, style: &str) -> Result<String>;
}

/// Builds daily digest entries.
pub struct DigestBuilder {
    db: Arc<EngineDb>,
    polisher: Option<Arc<dyn Polisher>>,
}

impl DigestBuilder {
    pub fn new(db: Arc<EngineDb>, polisher: Option<Arc<dyn Polisher>>) -> Self {
        Self { db, polisher }
    }

    /// Build the digest for `date` if the user journaled that day and no
    /// digest exists yet. Idempotent: a second call is a no-op.
    pub async fn build(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<Entry>> {
        if self.db.has_digest(user_id, date)? {
            return Ok(None);
        }
        let entries = self.db.entries_in_range(
            user_id,
            date,
            date.succ_opt().unwrap_or(date),
            EntryFilter::Individual,
        )?;
        if entries.is_empty() {
            return Ok(None);
        }

        let raw = aggregate(&entries);
        let body = match &self.polisher {
            Some(polisher) => match polisher.polish(&raw, "daily-digest").await {
                Ok(polished) => polished,
                Err(e) => {
                    tracing::warn!(user_id, %date, error = %e, "polish failed, storing raw digest");
                    raw
                }
            },
            None => raw,
        };

        let digest = Entry::new(user_id, EntryType::Digest, &body, date, now);
        self.db.insert_entry(&digest)?;
        tracing::info!(user_id, %date, entries = entries.len(), "daily digest built");
        Ok(Some(digest))
    }
}

fn aggregate(entries: &[Entry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        match entry.entry_type {
            EntryType::Text => out.push_str(&entry.body),
            other => {
                // Media entries contribute their caption, tagged with the
                // medium so the digest reads coherently.
                out.push_str(&format!("[{}] {}", other.as_str(), entry.body));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use daybook_core::error::DaybookError;
    use daybook_core::types::User;

    struct StubPolisher {
        fail: bool,
    }

    #[async_trait]
    impl Polisher for StubPolisher {
        async fn polish(&self, raw: &str, _style: &str) -> Result<String> {
            if self.fail {
                return Err(DaybookError::Transient("polish timeout".into()));
            }
            Ok(format!("polished: {raw}"))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 4, 0, 0).unwrap()
    }

    fn d(y: i32, m: u32, da: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, da).unwrap()
    }

    fn seeded_db() -> Arc<EngineDb> {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        db.upsert_user(&User::new("u1", "UTC", now())).unwrap();
        db.insert_entry(&Entry::new(
            "u1",
            EntryType::Text,
            "walked the coast",
            d(2024, 3, 9),
            now(),
        ))
        .unwrap();
        db.insert_entry(&Entry::new(
            "u1",
            EntryType::Photo,
            "sunset over the pier",
            d(2024, 3, 9),
            now(),
        ))
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_build_polishes_and_stores_digest() {
        let db = seeded_db();
        let builder = DigestBuilder::new(db.clone(), Some(Arc::new(StubPolisher { fail: false })));

        let digest = builder.build("u1", d(2024, 3, 9), now()).await.unwrap().unwrap();
        assert_eq!(digest.entry_type, EntryType::Digest);
        assert!(digest.body.starts_with("polished:"));
        assert!(digest.body.contains("walked the coast"));
        assert!(digest.body.contains("[photo] sunset over the pier"));
        assert!(db.has_digest("u1", d(2024, 3, 9)).unwrap());
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let db = seeded_db();
        let builder = DigestBuilder::new(db.clone(), None);

        assert!(builder.build("u1", d(2024, 3, 9), now()).await.unwrap().is_some());
        assert!(builder.build("u1", d(2024, 3, 9), now()).await.unwrap().is_none());

        let digests = db
            .entries_in_range("u1", d(2024, 3, 9), d(2024, 3, 10), EntryFilter::Daily)
            .unwrap();
        assert_eq!(digests.len(), 1);
    }

    #[tokio::test]
    async fn test_polish_failure_falls_back_to_raw() {
        let db = seeded_db();
        let builder = DigestBuilder::new(db, Some(Arc::new(StubPolisher { fail: true })));

        let digest = builder.build("u1", d(2024, 3, 9), now()).await.unwrap().unwrap();
        assert!(!digest.body.starts_with("polished:"));
        assert!(digest.body.contains("walked the coast"));
    }

    #[tokio::test]
    async fn test_no_entries_no_digest() {
        let db = seeded_db();
        let builder = DigestBuilder::new(db, None);
        assert!(builder.build("u1", d(2024, 3, 1), now()).await.unwrap().is_none());
    }
}
