//! Reminder digests for open tickets left unread or unanswered.
//!
//! A run collects candidates from the store, mails one digest listing them
//! and stamps each as reminded. Tickets reminded within the cooldown are not
//! listed again, so repeated runs inside that window send nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::compose::Digest;
use crate::error::{Error, Result};
use crate::provider::MailProvider;
use crate::store::TicketStore;

/// Minimum gap between two reminders for the same ticket.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Tickets listed in one digest.
pub const DIGEST_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    /// Threads included in the digest, oldest activity first.
    pub reminded: Vec<String>,
    /// Provider id of the digest, `None` when nothing was due.
    pub message_id: Option<String>,
}

pub struct Reminders {
    store: Arc<dyn TicketStore>,
    provider: Arc<dyn MailProvider>,
    to: String,
    cooldown: Duration,
    limit: usize,
    running: Mutex<()>,
}

impl Reminders {
    /// Digests go to `to`, or to the mailbox itself when unset.
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        provider: Arc<dyn MailProvider>,
        to: Option<String>,
        cooldown: Duration,
    ) -> Self {
        let to = to.unwrap_or_else(|| provider.mailbox().to_string());
        Self {
            store,
            provider,
            to,
            cooldown,
            limit: DIGEST_LIMIT,
            running: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.to
    }

    /// Send one digest of tickets due a reminder at `now`.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReminderReport> {
        // Overlapping runs would list the same tickets twice.
        let _running = self.running.lock().await;

        let cooldown = chrono::Duration::from_std(self.cooldown)
            .map_err(|e| Error::Config(format!("reminder cooldown {:?}: {e}", self.cooldown)))?;
        let cutoff = now.checked_sub_signed(cooldown).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let tickets = self.store.reminder_candidates(cutoff, self.limit)?;
        if tickets.is_empty() {
            tracing::debug!("no tickets due a reminder");
            return Ok(ReminderReport::default());
        }

        let raw = Digest {
            from: self.provider.mailbox(),
            to: &self.to,
            tickets: &tickets,
        }
        .render()?;
        let message_id = self.provider.send_raw(None, &raw).await?;

        let reminded: Vec<String> = tickets.into_iter().map(|t| t.thread_id).collect();
        self.store.mark_reminded(&reminded, now)?;
        tracing::info!(
            "sent reminder digest {message_id} to {} covering {} tickets",
            self.to,
            reminded.len()
        );
        Ok(ReminderReport {
            reminded,
            message_id: Some(message_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::model::TicketStatus;
    use crate::normalize::Normalizer;
    use crate::policy::TriagePolicy;
    use crate::provider::MemoryMailbox;
    use crate::retry::RetryPolicy;
    use crate::sqlite_store::SqliteStore;
    use crate::sync::SyncService;
    use crate::testing::{inbox_thread, DAY, JAN_1, ME};
    use mail_parser::MessageParser;
    use tokio::sync::broadcast;

    async fn setup(
        to: Option<&str>,
    ) -> (tempfile::TempDir, Arc<MemoryMailbox>, Arc<SqliteStore>, Reminders) {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(16);
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db"), tx).unwrap());
        let mailbox = Arc::new(MemoryMailbox::new(ME));
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        mailbox.put_thread(inbox_thread("t2", JAN_1 + DAY));
        let sync = SyncService::new(
            mailbox.clone(),
            store.clone(),
            Normalizer::new([ME], Arc::new(TriagePolicy::default())),
            RetryPolicy::immediate(1),
        );
        sync.check_updates(50).await.unwrap();
        let reminders = Reminders::new(
            store.clone(),
            mailbox.clone(),
            to.map(String::from),
            DEFAULT_COOLDOWN,
        );
        (dir, mailbox, store, reminders)
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[tokio::test]
    async fn digest_is_sent_once_per_cooldown() {
        let (_dir, mailbox, _store, reminders) = setup(Some("manager@agency.example")).await;
        let now = at(JAN_1 + 3 * DAY);

        let report = reminders.run(now).await.unwrap();
        assert_eq!(report.reminded, vec!["t1", "t2"]);
        let sent = mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].thread_id, None);
        assert_eq!(report.message_id.as_deref(), Some(sent[0].id.as_str()));
        let parsed = MessageParser::default().parse(&sent[0].raw).unwrap();
        assert_eq!(
            parsed.to().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("manager@agency.example")
        );
        assert!(parsed.body_text(0).unwrap().contains("| About t1 |"));

        let again = reminders.run(now + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(again, ReminderReport::default());
        assert_eq!(mailbox.sent().len(), 1);

        let later = reminders.run(now + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(later.reminded.len(), 2);
        assert_eq!(mailbox.sent().len(), 2);
    }

    #[tokio::test]
    async fn resolved_tickets_are_not_reminded() {
        let (_dir, mailbox, store, reminders) = setup(None).await;
        store.set_status("t1", TicketStatus::Responded).unwrap();

        let report = reminders.run(at(JAN_1 + 3 * DAY)).await.unwrap();
        assert_eq!(report.reminded, vec!["t2"]);
        assert_eq!(reminders.recipient(), ME);
        assert_eq!(mailbox.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_tickets_due() {
        let (_dir, mailbox, _store, reminders) = setup(None).await;
        let now = at(JAN_1 + 3 * DAY);
        mailbox.fail_next(ProviderError::RateLimited);

        assert!(matches!(reminders.run(now).await, Err(Error::Provider(_))));
        assert!(mailbox.sent().is_empty());
        let report = reminders.run(now).await.unwrap();
        assert_eq!(report.reminded.len(), 2);
    }
}
