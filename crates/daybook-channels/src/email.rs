//! SMTP report delivery via async lettre.
//!
//! Formats one period's entries as a plain-text email and sends it through
//! the configured relay. Formatting stays simple on purpose — layout beyond
//! this is the web frontend's concern, not the engine's.

use async_trait::async_trait;
use daybook_core::config::SmtpConfig;
use daybook_core::error::{DaybookError, Result};
use daybook_core::types::{Entry, EntryType};
use daybook_engine::email::{ReportPeriod, ReportSender};
use daybook_engine::persistence::EngineDb;
use std::sync::Arc;

/// Sends email reports over SMTP.
pub struct SmtpReportSender {
    db: Arc<EngineDb>,
    config: SmtpConfig,
}

impl SmtpReportSender {
    pub fn new(db: Arc<EngineDb>, config: SmtpConfig) -> Self {
        Self { db, config }
    }

    async fn send_smtp(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        use lettre::message::Mailbox;
        use lettre::message::header::ContentType;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message};

        let from_mailbox: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| DaybookError::Channel(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| DaybookError::Channel(format!("Invalid to: {e}")))?;

        let email = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DaybookError::Channel(format!("Build email: {e}")))?;

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        let mailer = AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| DaybookError::Channel(format!("SMTP relay: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| DaybookError::Channel(format!("SMTP send: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ReportSender for SmtpReportSender {
    async fn send_report(
        &self,
        user_id: &str,
        period: &ReportPeriod,
        entries: &[Entry],
        include_images: bool,
    ) -> Result<()> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| DaybookError::Validation(format!("unknown user '{user_id}'")))?;
        let to = user.email.as_deref().ok_or_else(|| {
            DaybookError::Validation(format!("user '{user_id}' has no email address"))
        })?;

        let subject = format!("Your journal: {} to {}", period.start, period.end);
        let body = format_report(entries, include_images);
        self.send_smtp(to, &subject, &body).await?;
        tracing::info!(user_id, to, entries = entries.len(), "report email sent");
        Ok(())
    }
}

fn format_report(entries: &[Entry], include_images: bool) -> String {
    let mut body = String::new();
    let mut current_day = None;
    for entry in entries {
        if !include_images && entry.entry_type == EntryType::Photo {
            continue;
        }
        if current_day != Some(entry.entry_date) {
            if current_day.is_some() {
                body.push('\n');
            }
            body.push_str(&format!("── {} ──\n", entry.entry_date.format("%A, %B %-d")));
            current_day = Some(entry.entry_date);
        }
        match entry.entry_type {
            EntryType::Text | EntryType::Digest => body.push_str(&entry.body),
            other => body.push_str(&format!("[{}] {}", other.as_str(), entry.body)),
        }
        body.push('\n');
    }
    body
}
