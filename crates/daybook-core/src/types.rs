//! Journal entry and user data model shared across the workspace.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{DaybookError, Result};

/// Account owner of entries and obligations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// IANA timezone name, e.g. "America/New_York". All of the user's
    /// calendar math happens in this zone.
    pub timezone: String,
    /// Delivery address for email reports.
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: &str, timezone: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            timezone: timezone.to_string(),
            email: None,
            created_at,
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Parse the stored timezone name.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| DaybookError::Validation(format!("unknown timezone '{}'", self.timezone)))
    }
}

/// What kind of content an entry holds.
///
/// `Digest` is synthetic: an auto-generated aggregation of one user's
/// individual entries for a single calendar day. Report pipelines filter on
/// it to avoid sending the same content twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Text,
    Photo,
    Audio,
    Video,
    Digest,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Text => "text",
            EntryType::Photo => "photo",
            EntryType::Audio => "audio",
            EntryType::Video => "video",
            EntryType::Digest => "digest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(EntryType::Text),
            "photo" => Some(EntryType::Photo),
            "audio" => Some(EntryType::Audio),
            "video" => Some(EntryType::Video),
            "digest" => Some(EntryType::Digest),
            _ => None,
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub user_id: String,
    pub entry_type: EntryType,
    /// Text body (caption for media entries, aggregate text for digests).
    pub body: String,
    /// The journal day this entry belongs to, in the user's calendar.
    pub entry_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Create a new entry with a fresh id.
    pub fn new(
        user_id: &str,
        entry_type: EntryType,
        body: &str,
        entry_date: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            entry_type,
            body: body.to_string(),
            entry_date,
            created_at,
        }
    }
}
