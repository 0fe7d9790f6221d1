//! Ticket storage interface.
//!
//! Sync batches go through [`TicketStore::write_batch`], which hands the
//! reconciler a [`BatchWriter`] scoped to one transaction: either every row and
//! the cursor land together or nothing does.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{
    AttachmentRecord, AuditEntry, BlacklistEntry, MessageRecord, SyncCursor, Ticket,
    TicketCategory, TicketStatus,
};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Listing tabs of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tab {
    /// Actionable tickets: pending or in progress.
    #[default]
    All,
    NotReplied,
    Pending,
    InProgress,
    Responded,
    NoReplyNeeded,
    /// Escalated and still unresolved.
    Escalated,
}

impl Tab {
    pub const ALL: &'static [Self] = &[
        Self::All,
        Self::NotReplied,
        Self::Pending,
        Self::InProgress,
        Self::Responded,
        Self::NoReplyNeeded,
        Self::Escalated,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::NotReplied => "not_replied",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Responded => "responded",
            Self::NoReplyNeeded => "no_reply_needed",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown tab '{s}'")))
    }
}

/// Ticket listing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub tab: Tab,
    /// Case-insensitive substring of subject, snippet or sender.
    pub query: Option<String>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
    /// Inclusive bounds on the date of the last message.
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            tab: Tab::All,
            query: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            start: None,
            end: None,
        }
    }
}

impl ListQuery {
    pub fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(Error::InvalidInput("page starts at 1".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let in_range = (self.page - 1)
            .checked_mul(self.page_size)
            .is_some_and(|offset| i64::try_from(offset).is_ok());
        if !in_range {
            return Err(Error::InvalidInput(format!("page {} is out of range", self.page)));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(Error::InvalidInput(format!(
                    "end date {end} is before start date {start}"
                )));
            }
        }
        Ok(())
    }

    /// Rows skipped before this page. Saturates on queries that failed validation.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

/// Visible ticket count per tab, blacklisted senders excluded.
pub type TabCounts = std::collections::BTreeMap<&'static str, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketPage {
    pub items: Vec<Ticket>,
    pub counts: TabCounts,
    /// Matches for the tab and filters before paging.
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// Writes available inside one sync transaction.
pub trait BatchWriter {
    fn load_ticket(&self, thread_id: &str) -> Result<Option<Ticket>>;

    fn insert_ticket(&self, ticket: &Ticket) -> Result<()>;

    fn update_ticket(&self, ticket: &Ticket) -> Result<()>;

    /// Returns whether the message was new.
    fn insert_message(&self, message: &MessageRecord) -> Result<bool>;

    /// Insert if absent; otherwise refresh only the provider handle.
    fn upsert_attachment(&self, attachment: &AttachmentRecord) -> Result<()>;

    fn put_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    /// Refresh `last_synced_at` of an existing cursor. No-op without one.
    fn touch_cursor(&self, mailbox: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Durable ticket store.
pub trait TicketStore: Send + Sync {
    /// Run `batch` in one transaction. An error rolls every write back.
    fn write_batch(&self, batch: &mut dyn FnMut(&dyn BatchWriter) -> Result<()>) -> Result<()>;

    fn cursor(&self, mailbox: &str) -> Result<Option<SyncCursor>>;

    fn list_tickets(&self, query: &ListQuery) -> Result<TicketPage>;

    fn ticket(&self, thread_id: &str) -> Result<Option<Ticket>>;

    /// Stored messages of a thread, oldest first.
    fn messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>>;

    fn attachment(
        &self,
        thread_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Option<AttachmentRecord>>;

    fn attachment_by_cid(
        &self,
        thread_id: &str,
        message_id: &str,
        content_id: &str,
    ) -> Result<Option<AttachmentRecord>>;

    /// Resolved statuses also clear `is_not_replied`.
    fn set_status(&self, thread_id: &str, status: TicketStatus) -> Result<Ticket>;

    fn set_category(&self, thread_id: &str, category: TicketCategory) -> Result<Ticket>;

    fn assign(&self, thread_id: &str, assignee_user_id: Option<i64>) -> Result<Ticket>;

    /// Record an outgoing reply sent through the provider.
    fn record_reply(&self, thread_id: &str, sent_message_id: &str, mark_responded: bool)
        -> Result<Ticket>;

    /// Escalate unresolved tickets whose SLA passed before `now`.
    fn escalate_overdue(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Open tickets still unread or unanswered that were never reminded, or
    /// last reminded before `cutoff`. Oldest activity first.
    fn reminder_candidates(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Ticket>>;

    /// Stamp tickets as included in a reminder sent at `at`.
    fn mark_reminded(&self, thread_ids: &[String], at: DateTime<Utc>) -> Result<()>;

    fn audit(&self, thread_id: &str) -> Result<Vec<AuditEntry>>;

    fn blacklist(&self) -> Result<Vec<BlacklistEntry>>;

    fn add_blacklist(&self, email: &str) -> Result<BlacklistEntry>;

    /// Returns whether an entry was removed.
    fn remove_blacklist(&self, email: &str) -> Result<bool>;

    /// Drop tickets, messages, attachments, audit, reminders and cursors.
    fn flush(&self) -> Result<()>;

    fn setting(&self, key: &str) -> Result<Option<String>>;

    fn put_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Flush pending writes before shutdown.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tabs() {
        assert_eq!("not_replied".parse::<Tab>().unwrap(), Tab::NotReplied);
        assert_eq!(" ALL ".parse::<Tab>().unwrap(), Tab::All);
        assert!(matches!("archive".parse::<Tab>(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn validates_paging() {
        assert!(ListQuery::default().validate().is_ok());
        let zero = ListQuery {
            page: 0,
            ..ListQuery::default()
        };
        assert!(zero.validate().is_err());
        let huge = ListQuery {
            page_size: MAX_PAGE_SIZE + 1,
            ..ListQuery::default()
        };
        assert!(huge.validate().is_err());
        let third = ListQuery {
            page: 3,
            page_size: 20,
            ..ListQuery::default()
        };
        assert_eq!(third.offset(), 40);
    }

    #[test]
    fn rejects_pages_past_the_addressable_range() {
        let last = ListQuery {
            page: usize::MAX,
            page_size: MAX_PAGE_SIZE,
            ..ListQuery::default()
        };
        assert!(matches!(last.validate(), Err(Error::InvalidInput(_))));
        assert_eq!(last.offset(), usize::MAX);

        let far = ListQuery {
            page: usize::MAX / 2 + 2,
            page_size: 1,
            ..ListQuery::default()
        };
        assert!(matches!(far.validate(), Err(Error::InvalidInput(_))));
    }
}
