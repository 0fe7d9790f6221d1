//! `SQLite`-backed ticket storage.

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde_json::json;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::model::{
    normalize_email, AttachmentRecord, AuditAction, AuditEntry, BlacklistEntry, MessageRecord,
    SyncCursor, Ticket, TicketCategory, TicketStatus,
};
use crate::store::{BatchWriter, ListQuery, Tab, TabCounts, TicketPage, TicketStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tickets (
        thread_id TEXT PRIMARY KEY,
        subject TEXT NOT NULL,
        snippet TEXT NOT NULL,
        from_name TEXT,
        from_email TEXT,
        last_message_id TEXT,
        status TEXT NOT NULL,
        category TEXT NOT NULL,
        priority TEXT NOT NULL,
        assignee_user_id INTEGER,
        is_unread INTEGER NOT NULL,
        is_not_replied INTEGER NOT NULL,
        last_from_me INTEGER NOT NULL,
        last_message_at TEXT,
        due_at TEXT,
        sla_due_at TEXT,
        escalation_level INTEGER NOT NULL DEFAULT 0,
        escalated_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL REFERENCES tickets(thread_id) ON DELETE CASCADE,
        rfc822_message_id TEXT,
        from_addr TEXT NOT NULL,
        to_addrs TEXT NOT NULL,
        subject TEXT NOT NULL,
        snippet TEXT NOT NULL,
        date TEXT NOT NULL,
        body_text TEXT NOT NULL,
        body_html TEXT
    );

    CREATE TABLE IF NOT EXISTS attachments (
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        id TEXT NOT NULL,
        filename TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        is_inline INTEGER NOT NULL,
        size INTEGER NOT NULL,
        content_id TEXT,
        provider_ref TEXT,
        PRIMARY KEY (message_id, id)
    );

    CREATE TABLE IF NOT EXISTS sync_cursor (
        mailbox TEXT PRIMARY KEY,
        history_id TEXT NOT NULL,
        last_synced_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS blacklist (
        email TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id TEXT NOT NULL,
        action TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reminders (
        thread_id TEXT PRIMARY KEY REFERENCES tickets(thread_id) ON DELETE CASCADE,
        last_reminded_at TEXT NOT NULL,
        reminder_count INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tickets_last ON tickets(last_message_at);
    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
    CREATE INDEX IF NOT EXISTS idx_tickets_from ON tickets(from_email);
    CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
    CREATE INDEX IF NOT EXISTS idx_attachments_cid ON attachments(message_id, content_id);
    CREATE INDEX IF NOT EXISTS idx_audit_thread ON audit(thread_id);
";

const TICKET_COLUMNS: &str = "thread_id, subject, snippet, from_name, from_email, last_message_id, \
     status, category, priority, assignee_user_id, is_unread, is_not_replied, last_from_me, \
     last_message_at, due_at, sla_due_at, escalation_level, escalated_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, thread_id, rfc822_message_id, from_addr, to_addrs, subject, snippet, date, body_text, body_html";

const ATTACHMENT_COLUMNS: &str =
    "a.id, a.message_id, a.filename, a.mime_type, a.is_inline, a.size, a.content_id, a.provider_ref";

/// Tickets whose sender is not blacklisted.
const VISIBLE: &str =
    "(from_email IS NULL OR from_email NOT IN (SELECT email FROM blacklist))";

const OPEN: &str = "status IN ('PENDING', 'IN_PROGRESS')";

fn tab_clause(tab: Tab) -> String {
    match tab {
        Tab::All => OPEN.to_string(),
        Tab::NotReplied => "is_not_replied = 1".to_string(),
        Tab::Pending => format!("status = '{}'", TicketStatus::Pending),
        Tab::InProgress => format!("status = '{}'", TicketStatus::InProgress),
        Tab::Responded => format!("status = '{}'", TicketStatus::Responded),
        Tab::NoReplyNeeded => format!("status = '{}'", TicketStatus::NoReplyNeeded),
        Tab::Escalated => format!("{OPEN} AND escalation_level > 0"),
    }
}

/// Read a TEXT column through the type's `FromStr`.
fn parse_col<T: FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        thread_id: row.get(0)?,
        subject: row.get(1)?,
        snippet: row.get(2)?,
        from_name: row.get(3)?,
        from_email: row.get(4)?,
        last_message_id: row.get(5)?,
        status: parse_col(row, 6)?,
        category: parse_col(row, 7)?,
        priority: parse_col(row, 8)?,
        assignee_user_id: row.get(9)?,
        is_unread: row.get(10)?,
        is_not_replied: row.get(11)?,
        last_from_me: row.get(12)?,
        last_message_at: row.get(13)?,
        due_at: row.get(14)?,
        sla_due_at: row.get(15)?,
        escalation_level: row.get(16)?,
        escalated_at: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

/// Read a TEXT column holding JSON.
fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// `%text%` for `LIKE ... ESCAPE '\'`, with wildcards in `text` matched literally.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        rfc822_message_id: row.get(2)?,
        from: row.get(3)?,
        to: json_col(row, 4)?,
        subject: row.get(5)?,
        snippet: row.get(6)?,
        date: row.get(7)?,
        body_text: row.get(8)?,
        body_html: row.get(9)?,
        attachments: Vec::new(), // Loaded separately
    })
}

fn row_to_attachment(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        filename: row.get(2)?,
        mime_type: row.get(3)?,
        is_inline: row.get(4)?,
        size: row.get(5)?,
        content_id: row.get(6)?,
        provider_ref: row.get(7)?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let detail: Option<String> = row.get(3)?;
    let detail = detail
        .map(|d| serde_json::from_str(&d))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(AuditEntry {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        action: parse_col(row, 2)?,
        detail,
        created_at: row.get(4)?,
    })
}

fn load_ticket(conn: &Connection, thread_id: &str) -> rusqlite::Result<Option<Ticket>> {
    conn.query_row(
        &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE thread_id = ?1"),
        params![thread_id],
        row_to_ticket,
    )
    .optional()
}

fn load_attachments(conn: &Connection, message_id: &str) -> rusqlite::Result<Vec<AttachmentRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments a WHERE a.message_id = ?1 ORDER BY a.id"
    ))?;
    let rows = stmt.query_map(params![message_id], row_to_attachment)?;
    rows.collect()
}

fn insert_audit(
    conn: &Connection,
    thread_id: &str,
    action: AuditAction,
    detail: &serde_json::Value,
    at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit (thread_id, action, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![thread_id, action.as_str(), detail.to_string(), at],
    )?;
    Ok(())
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Batch writes against an open transaction.
struct TxWriter<'c> {
    conn: &'c Connection,
}

impl BatchWriter for TxWriter<'_> {
    fn load_ticket(&self, thread_id: &str) -> Result<Option<Ticket>> {
        Ok(load_ticket(self.conn, thread_id)?)
    }

    fn insert_ticket(&self, t: &Ticket) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO tickets ({TICKET_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                t.thread_id,
                t.subject,
                t.snippet,
                t.from_name,
                t.from_email,
                t.last_message_id,
                t.status.as_str(),
                t.category.as_str(),
                t.priority.as_str(),
                t.assignee_user_id,
                t.is_unread,
                t.is_not_replied,
                t.last_from_me,
                t.last_message_at,
                t.due_at,
                t.sla_due_at,
                t.escalation_level,
                t.escalated_at,
                t.created_at,
                t.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_ticket(&self, t: &Ticket) -> Result<()> {
        self.conn.execute(
            "UPDATE tickets SET subject = ?2, snippet = ?3, from_name = ?4, from_email = ?5,
                last_message_id = ?6, status = ?7, category = ?8, priority = ?9,
                assignee_user_id = ?10, is_unread = ?11, is_not_replied = ?12, last_from_me = ?13,
                last_message_at = ?14, due_at = ?15, sla_due_at = ?16, escalation_level = ?17,
                escalated_at = ?18, updated_at = ?19
             WHERE thread_id = ?1",
            params![
                t.thread_id,
                t.subject,
                t.snippet,
                t.from_name,
                t.from_email,
                t.last_message_id,
                t.status.as_str(),
                t.category.as_str(),
                t.priority.as_str(),
                t.assignee_user_id,
                t.is_unread,
                t.is_not_replied,
                t.last_from_me,
                t.last_message_at,
                t.due_at,
                t.sla_due_at,
                t.escalation_level,
                t.escalated_at,
                t.updated_at,
            ],
        )?;
        Ok(())
    }

    fn insert_message(&self, m: &MessageRecord) -> Result<bool> {
        let to_json = serde_json::to_string(&m.to)
            .map_err(|e| Error::Database(format!("cannot encode recipients of {}: {e}", m.id)))?;
        let inserted = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                m.id,
                m.thread_id,
                m.rfc822_message_id,
                m.from,
                to_json,
                m.subject,
                m.snippet,
                m.date,
                m.body_text,
                m.body_html,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn upsert_attachment(&self, a: &AttachmentRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO attachments
                (message_id, id, filename, mime_type, is_inline, size, content_id, provider_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (message_id, id) DO UPDATE SET provider_ref = excluded.provider_ref",
            params![
                a.message_id,
                a.id,
                a.filename,
                a.mime_type,
                a.is_inline,
                a.size,
                a.content_id,
                a.provider_ref,
            ],
        )?;
        Ok(())
    }

    fn put_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_cursor (mailbox, history_id, last_synced_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (mailbox) DO UPDATE SET
                history_id = excluded.history_id,
                last_synced_at = excluded.last_synced_at",
            params![cursor.mailbox, cursor.history_id, cursor.last_synced_at],
        )?;
        Ok(())
    }

    fn touch_cursor(&self, mailbox: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_cursor SET last_synced_at = ?2 WHERE mailbox = ?1",
            params![mailbox, at],
        )?;
        Ok(())
    }
}

/// `SQLite`-backed ticket store with persistence.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    notify: broadcast::Sender<()>,
}

impl SqliteStore {
    /// Create or open a `SQLite` database at the given path.
    pub fn open(path: impl AsRef<Path>, notify: broadcast::Sender<()>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("SQLite journal mode {mode}");
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            notify,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".into()))
    }

    fn changed(&self) {
        let _ = self.notify.send(());
    }

    /// Apply a single-ticket mutation and its audit entry atomically.
    fn mutate<F>(&self, thread_id: &str, action: AuditAction, apply: F) -> Result<Ticket>
    where
        F: FnOnce(&Connection, &Ticket, DateTime<Utc>) -> rusqlite::Result<serde_json::Value>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current = load_ticket(&tx, thread_id)?
            .ok_or_else(|| Error::NotFound(format!("ticket {thread_id}")))?;
        let now = Utc::now();
        let detail = apply(&tx, &current, now)?;
        insert_audit(&tx, thread_id, action, &detail, now)?;
        let updated = load_ticket(&tx, thread_id)?
            .ok_or_else(|| Error::NotFound(format!("ticket {thread_id}")))?;
        tx.commit()?;
        drop(conn);
        self.changed();
        Ok(updated)
    }

    fn count(conn: &Connection, where_sql: &str, args: &[&dyn ToSql]) -> rusqlite::Result<u64> {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM tickets WHERE {where_sql}"),
            args,
            |row| row.get(0),
        )
    }
}

#[allow(clippy::significant_drop_tightening)]
impl TicketStore for SqliteStore {
    fn write_batch(&self, batch: &mut dyn FnMut(&dyn BatchWriter) -> Result<()>) -> Result<()> {
        let mut conn = self.conn()?;
        // Dropping the transaction on error rolls it back.
        let tx = conn.transaction()?;
        batch(&TxWriter { conn: &tx })?;
        tx.commit()?;
        drop(conn);
        self.changed();
        Ok(())
    }

    fn cursor(&self, mailbox: &str) -> Result<Option<SyncCursor>> {
        let conn = self.conn()?;
        let cursor = conn
            .query_row(
                "SELECT mailbox, history_id, last_synced_at FROM sync_cursor WHERE mailbox = ?1",
                params![mailbox],
                |row| {
                    Ok(SyncCursor {
                        mailbox: row.get(0)?,
                        history_id: row.get(1)?,
                        last_synced_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    fn list_tickets(&self, query: &ListQuery) -> Result<TicketPage> {
        query.validate()?;
        let conn = self.conn()?;

        let mut counts = TabCounts::new();
        for tab in Tab::ALL {
            let n = Self::count(&conn, &format!("{VISIBLE} AND {}", tab_clause(*tab)), &[])?;
            counts.insert(tab.as_str(), n);
        }

        let mut where_sql = format!("{VISIBLE} AND {}", tab_clause(query.tab));
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(text) = query.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            where_sql.push_str(
                " AND (subject LIKE ? ESCAPE '\\' OR snippet LIKE ? ESCAPE '\\' \
                 OR from_email LIKE ? ESCAPE '\\' OR from_name LIKE ? ESCAPE '\\')",
            );
            let pattern = like_pattern(text);
            for _ in 0..4 {
                params_vec.push(Box::new(pattern.clone()));
            }
        }
        if let Some(start) = query.start {
            where_sql.push_str(" AND last_message_at >= ?");
            params_vec.push(Box::new(day_start(start)));
        }
        if let Some(end) = query.end {
            let next = end.checked_add_days(Days::new(1)).unwrap_or(end);
            where_sql.push_str(" AND last_message_at < ?");
            params_vec.push(Box::new(day_start(next)));
        }

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(AsRef::as_ref).collect();
        let total = Self::count(&conn, &where_sql, &params_refs)?;

        let limit = i64::try_from(query.page_size).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE {where_sql}
             ORDER BY last_message_at IS NULL, last_message_at DESC, thread_id
             LIMIT {limit} OFFSET {offset}"
        ))?;
        let items = stmt
            .query_map(params_refs.as_slice(), row_to_ticket)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let shown = (query.offset() + items.len()) as u64;
        Ok(TicketPage {
            has_more: shown < total,
            items,
            counts,
            total,
            page: query.page,
            page_size: query.page_size,
        })
    }

    fn ticket(&self, thread_id: &str) -> Result<Option<Ticket>> {
        let conn = self.conn()?;
        Ok(load_ticket(&conn, thread_id)?)
    }

    fn messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY date, id"
        ))?;
        let mut messages = stmt
            .query_map(params![thread_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for message in &mut messages {
            message.attachments = load_attachments(&conn, &message.id)?;
        }
        Ok(messages)
    }

    fn attachment(
        &self,
        thread_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Option<AttachmentRecord>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments a
                     JOIN messages m ON m.id = a.message_id
                     WHERE m.thread_id = ?1 AND a.message_id = ?2 AND a.id = ?3"
                ),
                params![thread_id, message_id, attachment_id],
                row_to_attachment,
            )
            .optional()?;
        Ok(found)
    }

    fn attachment_by_cid(
        &self,
        thread_id: &str,
        message_id: &str,
        content_id: &str,
    ) -> Result<Option<AttachmentRecord>> {
        let conn = self.conn()?;
        let cid = content_id.trim().trim_matches(['<', '>']);
        let found = conn
            .query_row(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments a
                     JOIN messages m ON m.id = a.message_id
                     WHERE m.thread_id = ?1 AND a.message_id = ?2 AND a.content_id = ?3
                     ORDER BY a.id LIMIT 1"
                ),
                params![thread_id, message_id, cid],
                row_to_attachment,
            )
            .optional()?;
        Ok(found)
    }

    fn set_status(&self, thread_id: &str, status: TicketStatus) -> Result<Ticket> {
        self.mutate(thread_id, AuditAction::StatusChanged, |conn, current, now| {
            conn.execute(
                "UPDATE tickets SET status = ?2,
                    is_not_replied = CASE WHEN ?3 THEN 0 ELSE is_not_replied END,
                    updated_at = ?4
                 WHERE thread_id = ?1",
                params![thread_id, status.as_str(), status.is_resolved(), now],
            )?;
            Ok(json!({ "from": current.status, "to": status }))
        })
    }

    fn set_category(&self, thread_id: &str, category: TicketCategory) -> Result<Ticket> {
        self.mutate(thread_id, AuditAction::CategorySet, |conn, current, now| {
            conn.execute(
                "UPDATE tickets SET category = ?2, updated_at = ?3 WHERE thread_id = ?1",
                params![thread_id, category.as_str(), now],
            )?;
            Ok(json!({ "from": current.category, "to": category }))
        })
    }

    fn assign(&self, thread_id: &str, assignee_user_id: Option<i64>) -> Result<Ticket> {
        self.mutate(thread_id, AuditAction::Assigned, |conn, current, now| {
            conn.execute(
                "UPDATE tickets SET assignee_user_id = ?2, updated_at = ?3 WHERE thread_id = ?1",
                params![thread_id, assignee_user_id, now],
            )?;
            Ok(json!({ "from": current.assignee_user_id, "to": assignee_user_id }))
        })
    }

    fn record_reply(
        &self,
        thread_id: &str,
        sent_message_id: &str,
        mark_responded: bool,
    ) -> Result<Ticket> {
        self.mutate(thread_id, AuditAction::Replied, |conn, _, now| {
            conn.execute(
                "UPDATE tickets SET is_not_replied = 0, last_from_me = 1,
                    status = CASE WHEN ?2 THEN ?3 ELSE status END,
                    updated_at = ?4
                 WHERE thread_id = ?1",
                params![thread_id, mark_responded, TicketStatus::Responded.as_str(), now],
            )?;
            Ok(json!({ "message_id": sent_message_id, "marked_responded": mark_responded }))
        })
    }

    fn escalate_overdue(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let overdue = {
            let mut stmt = tx.prepare(&format!(
                "SELECT thread_id, sla_due_at FROM tickets
                 WHERE {VISIBLE} AND {OPEN} AND escalation_level = 0
                   AND sla_due_at IS NOT NULL AND sla_due_at < ?1
                 ORDER BY sla_due_at"
            ))?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (thread_id, sla_due_at) in &overdue {
            tx.execute(
                "UPDATE tickets SET escalation_level = 1, escalated_at = ?2, updated_at = ?2
                 WHERE thread_id = ?1",
                params![thread_id, now],
            )?;
            insert_audit(
                &tx,
                thread_id,
                AuditAction::Escalated,
                &json!({ "level": 1, "sla_due_at": sla_due_at }),
                now,
            )?;
        }
        tx.commit()?;
        drop(conn);

        if !overdue.is_empty() {
            self.changed();
        }
        Ok(overdue.into_iter().map(|(id, _)| id).collect())
    }

    fn reminder_candidates(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Ticket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets
             WHERE {VISIBLE} AND {OPEN} AND (is_not_replied = 1 OR is_unread = 1)
               AND thread_id NOT IN
                   (SELECT thread_id FROM reminders WHERE last_reminded_at >= ?1)
             ORDER BY last_message_at IS NULL, last_message_at, thread_id
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let tickets = stmt
            .query_map(params![cutoff, limit], row_to_ticket)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tickets)
    }

    fn mark_reminded(&self, thread_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for thread_id in thread_ids {
            tx.execute(
                "INSERT INTO reminders (thread_id, last_reminded_at, reminder_count)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT (thread_id) DO UPDATE SET
                     last_reminded_at = excluded.last_reminded_at,
                     reminder_count = reminder_count + 1",
                params![thread_id, at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn audit(&self, thread_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, action, detail, created_at FROM audit
             WHERE thread_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![thread_id], row_to_audit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT email, created_at FROM blacklist ORDER BY email")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(BlacklistEntry {
                    email: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn add_blacklist(&self, email: &str) -> Result<BlacklistEntry> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::InvalidInput(format!("invalid email '{email}'")));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blacklist (email, created_at) VALUES (?1, ?2)
             ON CONFLICT (email) DO NOTHING",
            params![email, Utc::now()],
        )?;
        let entry = conn.query_row(
            "SELECT email, created_at FROM blacklist WHERE email = ?1",
            params![email],
            |row| {
                Ok(BlacklistEntry {
                    email: row.get(0)?,
                    created_at: row.get(1)?,
                })
            },
        )?;
        drop(conn);
        self.changed();
        Ok(entry)
    }

    fn remove_blacklist(&self, email: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM blacklist WHERE email = ?1",
            params![normalize_email(email)],
        )? > 0;
        drop(conn);
        if removed {
            self.changed();
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM attachments;
             DELETE FROM messages;
             DELETE FROM reminders;
             DELETE FROM tickets;
             DELETE FROM audit;
             DELETE FROM sync_cursor;",
        )?;
        tx.commit()?;
        drop(conn);
        tracing::info!("ticket store flushed");
        self.changed();
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn close(&self) {
        let Ok(conn) = self.conn() else {
            return;
        };
        // Checkpoint WAL to ensure all data is written to the main database file
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        tracing::info!("SQLite database checkpointed and ready for shutdown");
    }
}
