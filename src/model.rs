//! Ticket, message and sync-state records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// wire form is the SCREAMING_SNAKE_CASE variant name.
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Stored and serialized representation.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} '{other}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

/// Human-driven workflow state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    #[default]
    Pending,
    InProgress,
    Responded,
    NoReplyNeeded,
}

wire_enum!(TicketStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Responded => "RESPONDED",
    NoReplyNeeded => "NO_REPLY_NEEDED",
});

impl TicketStatus {
    /// Resolved tickets need no further reply.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Responded | Self::NoReplyNeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketCategory {
    Maintenance,
    RentArrears,
    Leasing,
    Compliance,
    Sales,
    #[default]
    General,
}

wire_enum!(TicketCategory {
    Maintenance => "MAINTENANCE",
    RentArrears => "RENT_ARREARS",
    Leasing => "LEASING",
    Compliance => "COMPLIANCE",
    Sales => "SALES",
    General => "GENERAL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

wire_enum!(Priority {
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    StatusChanged,
    CategorySet,
    Assigned,
    Escalated,
    Replied,
}

wire_enum!(AuditAction {
    StatusChanged => "STATUS_CHANGED",
    CategorySet => "CATEGORY_SET",
    Assigned => "ASSIGNED",
    Escalated => "ESCALATED",
    Replied => "REPLIED",
});

/// One ticket per provider thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub thread_id: String,
    pub subject: String,
    pub snippet: String,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub last_message_id: Option<String>,
    pub status: TicketStatus,
    pub category: TicketCategory,
    pub priority: Priority,
    pub assignee_user_id: Option<i64>,
    pub is_unread: bool,
    pub is_not_replied: bool,
    pub last_from_me: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub sla_due_at: Option<DateTime<Utc>>,
    pub escalation_level: u32,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored message. Never modified after the first insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    /// `Message-ID` header, used for `In-Reply-To` on replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfc822_message_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub date: DateTime<Utc>,
    pub body_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
}

impl MessageRecord {
    /// Attachments offered for download; inline parts are reached by content id.
    pub fn downloadable_attachments(&self) -> impl Iterator<Item = &AttachmentRecord> {
        self.attachments.iter().filter(|a| !a.is_inline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// MIME part id; stable across fetches of the same message.
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub is_inline: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Provider handle for fetching the bytes; refreshed on every sync.
    #[serde(skip)]
    pub provider_ref: Option<String>,
}

/// Persisted position of the last successful sync for one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub mailbox: String,
    pub history_id: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub thread_id: String,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Lower-cases and trims an address for comparisons and blacklist keys.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
