//! Idempotent merge of normalized threads into the store.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::error::Result;
use crate::fetch::CursorUpdate;
use crate::model::{SyncCursor, Ticket, TicketStatus};
use crate::normalize::{NormalizedThread, TicketProjection};
use crate::store::BatchWriter;

/// Result of merging one projection into an optional stored ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    Create(Ticket),
    Update(Ticket),
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub new_messages: usize,
}

fn new_ticket(p: &TicketProjection, now: DateTime<Utc>) -> Ticket {
    Ticket {
        thread_id: p.thread_id.clone(),
        subject: p.subject.clone(),
        snippet: p.snippet.clone(),
        from_name: p.from_name.clone(),
        from_email: p.from_email.clone(),
        last_message_id: Some(p.last_message_id.clone()),
        status: TicketStatus::Pending,
        category: p.category,
        priority: p.priority,
        assignee_user_id: None,
        is_unread: p.is_unread,
        is_not_replied: p.is_not_replied,
        last_from_me: p.last_from_me,
        last_message_at: Some(p.last_message_at),
        due_at: Some(p.due_at),
        sla_due_at: Some(p.sla_due_at),
        escalation_level: 0,
        escalated_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Merge `incoming` into `existing`.
///
/// Human-owned fields (status, category, assignee, escalation) are never
/// touched; the suggested category only seeds a new ticket. A projection
/// older than the stored one changes nothing; an equal one refreshes
/// presentation but leaves `is_not_replied` alone on resolved tickets; a
/// newer one refreshes every derived field.
#[must_use]
pub fn merge_ticket(existing: Option<&Ticket>, incoming: &TicketProjection, now: DateTime<Utc>) -> Merge {
    let Some(existing) = existing else {
        return Merge::Create(new_ticket(incoming, now));
    };

    let order = existing
        .last_message_at
        .map_or(Ordering::Greater, |stored| incoming.last_message_at.cmp(&stored));
    if order == Ordering::Less {
        return Merge::Unchanged;
    }

    let mut merged = existing.clone();
    merged.subject.clone_from(&incoming.subject);
    merged.snippet.clone_from(&incoming.snippet);
    merged.from_name.clone_from(&incoming.from_name);
    merged.from_email.clone_from(&incoming.from_email);
    merged.last_message_id = Some(incoming.last_message_id.clone());
    merged.is_unread = incoming.is_unread;
    merged.last_from_me = incoming.last_from_me;
    merged.priority = incoming.priority;
    merged.due_at = Some(incoming.due_at);
    merged.sla_due_at = Some(incoming.sla_due_at);
    merged.last_message_at = Some(incoming.last_message_at);
    if order == Ordering::Greater || !existing.status.is_resolved() {
        merged.is_not_replied = incoming.is_not_replied;
    }

    if merged == *existing {
        Merge::Unchanged
    } else {
        merged.updated_at = now;
        Merge::Update(merged)
    }
}

/// Write a batch and move the cursor. Must run inside one store transaction.
pub fn apply_batch(
    writer: &dyn BatchWriter,
    batch: &[NormalizedThread],
    mailbox: &str,
    cursor: &CursorUpdate,
    now: DateTime<Utc>,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();

    for thread in batch {
        let existing = writer.load_ticket(&thread.ticket.thread_id)?;
        match merge_ticket(existing.as_ref(), &thread.ticket, now) {
            Merge::Create(ticket) => {
                writer.insert_ticket(&ticket)?;
                stats.created += 1;
            }
            Merge::Update(ticket) => {
                writer.update_ticket(&ticket)?;
                stats.updated += 1;
            }
            Merge::Unchanged => stats.unchanged += 1,
        }

        for message in &thread.messages {
            if writer.insert_message(message)? {
                stats.new_messages += 1;
            }
            for attachment in &message.attachments {
                writer.upsert_attachment(attachment)?;
            }
        }
    }

    match cursor {
        CursorUpdate::Advance(history_id) => writer.put_cursor(&SyncCursor {
            mailbox: mailbox.to_string(),
            history_id: history_id.clone(),
            last_synced_at: now,
        })?,
        CursorUpdate::Touch => writer.touch_cursor(mailbox, now)?,
    }

    Ok(stats)
}
