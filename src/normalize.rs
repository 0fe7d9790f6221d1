//! Maps raw provider threads to ticket projections and message records.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{normalize_email, AttachmentRecord, MessageRecord, Priority, TicketCategory};
use crate::policy::TriagePolicy;
use crate::provider::{decode_base64url, MessagePart, RawMessage, RawThread, UNREAD_LABEL};

const NO_SUBJECT: &str = "(no subject)";

/// Ticket fields derived from the thread on every sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketProjection {
    pub thread_id: String,
    pub subject: String,
    pub snippet: String,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub last_message_id: String,
    pub is_unread: bool,
    pub is_not_replied: bool,
    pub last_from_me: bool,
    pub priority: Priority,
    /// Keyword suggestion; only used when the ticket is first created.
    pub category: TicketCategory,
    pub last_message_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub sla_due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedThread {
    pub ticket: TicketProjection,
    pub messages: Vec<MessageRecord>,
}

/// Stateless mapping from [`RawThread`] to [`NormalizedThread`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    my_addresses: HashSet<String>,
    policy: Arc<TriagePolicy>,
}

/// Display name and normalized address of a `From` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Normalizer {
    pub fn new<I, S>(my_addresses: I, policy: Arc<TriagePolicy>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            my_addresses: my_addresses
                .into_iter()
                .map(|a| normalize_email(a.as_ref()))
                .filter(|a| !a.is_empty())
                .collect(),
            policy,
        }
    }

    #[must_use]
    pub fn is_mine(&self, email: Option<&str>) -> bool {
        email.is_some_and(|e| self.my_addresses.contains(&normalize_email(e)))
    }

    /// Sender of the newest stored message not written by the team.
    #[must_use]
    pub fn reply_recipient(&self, messages: &[MessageRecord]) -> Option<Sender> {
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| (i, m.date, parse_sender(&m.from)))
            .filter(|(_, _, s)| s.email.is_some() && !self.is_mine(s.email.as_deref()))
            .max_by_key(|(i, date, _)| (*date, *i))
            .map(|(_, _, sender)| sender)
    }

    /// Normalize one thread. Fails on threads that cannot be mapped faithfully.
    pub fn normalize(&self, thread: &RawThread) -> Result<NormalizedThread> {
        if thread.messages.is_empty() {
            return Err(Error::Malformed(format!("thread {} has no messages", thread.id)));
        }

        let mut messages = Vec::with_capacity(thread.messages.len());
        let mut senders = Vec::with_capacity(thread.messages.len());
        for raw in &thread.messages {
            let (record, sender) = normalize_message(&thread.id, raw)?;
            messages.push(record);
            senders.push(sender);
        }

        // Greatest date wins; later provider order breaks ties.
        let latest = messages
            .iter()
            .enumerate()
            .fold(0, |best, (i, m)| if m.date >= messages[best].date { i } else { best });
        let latest_msg = &messages[latest];
        let latest_sender = &senders[latest];
        let latest_raw = &thread.messages[latest];

        let last_from_me = self.is_mine(latest_sender.email.as_deref());
        let replied_later = messages
            .iter()
            .zip(&senders)
            .any(|(m, s)| m.date > latest_msg.date && self.is_mine(s.email.as_deref()));
        let is_not_replied = !last_from_me && !replied_later;

        let subject = if latest_msg.subject.trim().is_empty() {
            NO_SUBJECT.to_string()
        } else {
            latest_msg.subject.clone()
        };
        let body = triage_body(latest_msg);
        let texts = [subject.as_str(), latest_msg.snippet.as_str(), &*body];
        let priority = self.policy.classify(latest_sender.email.as_deref(), &texts);
        let category = self.policy.suggest_category(&texts);
        let last_message_at = latest_msg.date;

        let ticket = TicketProjection {
            thread_id: thread.id.clone(),
            subject,
            snippet: latest_raw.snippet.clone(),
            from_name: latest_sender.name.clone(),
            from_email: latest_sender.email.clone(),
            last_message_id: latest_msg.id.clone(),
            is_unread: latest_raw.has_label(UNREAD_LABEL),
            is_not_replied,
            last_from_me,
            priority,
            category,
            last_message_at,
            due_at: self.policy.due_at(priority, last_message_at)?,
            sla_due_at: self.policy.sla_due_at(priority, last_message_at)?,
        };

        Ok(NormalizedThread { ticket, messages })
    }
}

fn normalize_message(thread_id: &str, raw: &RawMessage) -> Result<(MessageRecord, Sender)> {
    let date = raw
        .internal_date
        .as_deref()
        .and_then(|ms| ms.trim().parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| {
            Error::Malformed(format!("message {} has no valid internalDate", raw.id))
        })?;
    let payload = raw
        .payload
        .as_ref()
        .ok_or_else(|| Error::Malformed(format!("message {} has no payload", raw.id)))?;

    let from_header = payload.header("From").unwrap_or_default();
    let to_header = payload.header("To").unwrap_or_default();
    let (sender, to) = parse_addresses(from_header, to_header);

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    for part in payload.walk() {
        if part.is_multipart() {
            continue;
        }
        if is_attachment(part) {
            attachments.push(attachment_record(&raw.id, part));
            continue;
        }
        let Some(data) = part.body.data.as_deref() else {
            continue;
        };
        let slot = match part.mime_type.to_ascii_lowercase().as_str() {
            "text/plain" => &mut body_text,
            "text/html" => &mut body_html,
            _ => continue,
        };
        if slot.is_none() {
            let bytes = decode_base64url(data)
                .map_err(|e| Error::Malformed(format!("message {}: {e}", raw.id)))?;
            *slot = Some(String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    let record = MessageRecord {
        id: raw.id.clone(),
        thread_id: thread_id.to_string(),
        rfc822_message_id: payload.header("Message-ID").map(|v| v.trim().to_string()),
        from: from_header.trim().to_string(),
        to,
        subject: payload.header("Subject").unwrap_or_default().trim().to_string(),
        snippet: raw.snippet.clone(),
        date,
        body_text: body_text.unwrap_or_default(),
        body_html,
        attachments,
    };
    Ok((record, sender))
}

/// Plain-text body, or the HTML body rendered as text when there is none.
fn triage_body(message: &MessageRecord) -> Cow<'_, str> {
    if !message.body_text.trim().is_empty() {
        return Cow::Borrowed(&message.body_text);
    }
    message
        .body_html
        .as_deref()
        .map_or(Cow::Borrowed(""), |html| Cow::Owned(html_to_text(html)))
}

fn html_to_text(html: &str) -> String {
    let raw = format!("Content-Type: text/html; charset=utf-8\r\n\r\n{html}");
    MessageParser::default()
        .parse(raw.as_bytes())
        .and_then(|msg| msg.body_text(0).map(Cow::into_owned))
        .unwrap_or_default()
}

/// File parts, and non-text parts stored out of line by the provider.
fn is_attachment(part: &MessagePart) -> bool {
    let mime = part.mime_type.to_ascii_lowercase();
    let text_body = mime == "text/plain" || mime == "text/html";
    !part.filename.is_empty() || (part.body.attachment_id.is_some() && !text_body)
}

fn attachment_record(message_id: &str, part: &MessagePart) -> AttachmentRecord {
    let content_id = part
        .header("Content-ID")
        .map(|cid| cid.trim().trim_matches(['<', '>']).to_string())
        .filter(|cid| !cid.is_empty());
    let disposition_attachment = part
        .header("Content-Disposition")
        .is_some_and(|d| d.trim().to_ascii_lowercase().starts_with("attachment"));
    let id = if part.part_id.is_empty() {
        "0".to_string()
    } else {
        part.part_id.clone()
    };
    let filename = if part.filename.is_empty() {
        content_id
            .clone()
            .unwrap_or_else(|| format!("attachment-{id}"))
    } else {
        part.filename.clone()
    };
    let mime_type = if part.mime_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        part.mime_type.to_ascii_lowercase()
    };

    AttachmentRecord {
        is_inline: content_id.is_some() && !disposition_attachment,
        id,
        message_id: message_id.to_string(),
        filename,
        mime_type,
        size: part.body.size,
        content_id,
        provider_ref: part.body.attachment_id.clone(),
    }
}

fn parse_sender(from: &str) -> Sender {
    parse_addresses(from, "").0
}

/// Parse `From` and `To` header values with the RFC 5322 parser.
fn parse_addresses(from: &str, to: &str) -> (Sender, Vec<String>) {
    let block = format!(
        "From: {}\r\nTo: {}\r\n\r\n",
        from.replace(['\r', '\n'], " "),
        to.replace(['\r', '\n'], " ")
    );
    let parsed = MessageParser::default().parse(block.as_bytes());

    let sender = parsed
        .as_ref()
        .and_then(|msg| msg.from())
        .and_then(|addr| addr.first())
        .map_or_else(Sender::default, |a| Sender {
            name: a
                .name()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            email: a.address().map(normalize_email).filter(|e| !e.is_empty()),
        });
    let recipients = parsed
        .as_ref()
        .and_then(|msg| msg.to())
        .map(|list| {
            list.iter()
                .filter_map(|a| a.address().map(normalize_email))
                .collect()
        })
        .unwrap_or_default();
    (sender, recipients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{encode_base64url, Header, PartBody};
    use chrono::TimeZone;

    const ME: &str = "support@agency.example";

    fn header(name: &str, value: &str) -> Header {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn text_part(part_id: &str, mime: &str, body: &str) -> MessagePart {
        MessagePart {
            part_id: part_id.to_string(),
            mime_type: mime.to_string(),
            body: PartBody {
                size: body.len() as u64,
                data: Some(encode_base64url(body.as_bytes())),
                attachment_id: None,
            },
            ..MessagePart::default()
        }
    }

    fn message(id: &str, from: &str, millis: i64, labels: &[&str], parts: Vec<MessagePart>) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            label_ids: labels.iter().map(|l| (*l).to_string()).collect(),
            snippet: format!("snippet of {id}"),
            internal_date: Some(millis.to_string()),
            payload: Some(MessagePart {
                mime_type: "multipart/mixed".to_string(),
                headers: vec![
                    header("From", from),
                    header("To", &format!("Support <{ME}>")),
                    header("Subject", &format!("Subject {id}")),
                    header("Message-ID", &format!("<{id}@mail.example>")),
                ],
                parts,
                ..MessagePart::default()
            }),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new([ME], Arc::new(TriagePolicy::default()))
    }

    const JAN_1: i64 = 1_704_067_200_000;

    #[test]
    fn projects_latest_message() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![
                message("m1", "Tenant <Tenant@Example.com>", JAN_1, &["INBOX"], vec![text_part("0", "text/plain", "hello")]),
                message("m2", "Tenant <tenant@example.com>", JAN_1 + 60_000, &["INBOX", "UNREAD"], vec![text_part("0", "text/plain", "follow up")]),
            ],
        };
        let out = normalizer().normalize(&thread).unwrap();
        let t = &out.ticket;
        assert_eq!(t.subject, "Subject m2");
        assert_eq!(t.snippet, "snippet of m2");
        assert_eq!(t.from_name.as_deref(), Some("Tenant"));
        assert_eq!(t.from_email.as_deref(), Some("tenant@example.com"));
        assert_eq!(t.last_message_id, "m2");
        assert!(t.is_unread);
        assert!(t.is_not_replied);
        assert!(!t.last_from_me);
        assert_eq!(t.priority, Priority::Medium);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[1].to, vec![ME.to_string()]);
        assert_eq!(out.messages[1].rfc822_message_id.as_deref(), Some("<m2@mail.example>"));
    }

    #[test]
    fn reply_from_me_clears_not_replied() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![
                message("m1", "tenant@example.com", JAN_1, &["INBOX", "UNREAD"], vec![]),
                message("m2", &format!("Support <{ME}>"), JAN_1 + 1, &["SENT"], vec![]),
            ],
        };
        let t = normalizer().normalize(&thread).unwrap().ticket;
        assert!(t.last_from_me);
        assert!(!t.is_not_replied);
        assert!(!t.is_unread);
    }

    #[test]
    fn latest_is_chosen_by_date_not_position() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![
                message("late", "tenant@example.com", JAN_1 + 5_000, &[], vec![]),
                message("early", &format!("Support <{ME}>"), JAN_1, &[], vec![]),
            ],
        };
        let t = normalizer().normalize(&thread).unwrap().ticket;
        assert_eq!(t.last_message_id, "late");
        assert!(t.is_not_replied);
    }

    #[test]
    fn high_priority_sla_is_four_hours() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![message(
                "m1",
                "tenant@example.com",
                JAN_1,
                &["INBOX"],
                vec![text_part("0", "text/plain", "Water leak, please come ASAP")],
            )],
        };
        let t = normalizer().normalize(&thread).unwrap().ticket;
        assert_eq!(t.priority, Priority::High);
        assert_eq!(t.last_message_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(t.sla_due_at, Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap());
        assert_eq!(t.due_at, t.last_message_at);
    }

    #[test]
    fn html_only_body_and_snippet_are_classified() {
        let mut raw = message(
            "m1",
            "tenant@example.com",
            JAN_1,
            &["INBOX"],
            vec![text_part("0", "text/html", "<div>Water is <b>flooding</b> the hallway</div>")],
        );
        raw.snippet = "Hi there".into();
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![raw],
        };
        let t = normalizer().normalize(&thread).unwrap().ticket;
        assert_eq!(t.priority, Priority::High);

        let mut raw = message("m2", "tenant@example.com", JAN_1, &["INBOX"], vec![]);
        raw.snippet = "Please call me, this is urgent".into();
        let thread = RawThread {
            id: "t2".into(),
            history_id: None,
            messages: vec![raw],
        };
        assert_eq!(normalizer().normalize(&thread).unwrap().ticket.priority, Priority::High);
    }

    #[test]
    fn suggests_category_from_latest_message() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![message(
                "m1",
                "tenant@example.com",
                JAN_1,
                &["INBOX"],
                vec![text_part("0", "text/plain", "The shower needs a repair")],
            )],
        };
        let t = normalizer().normalize(&thread).unwrap().ticket;
        assert_eq!(t.category, TicketCategory::Maintenance);
    }

    #[test]
    fn reply_goes_to_last_outside_sender() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![
                message("m1", "Tenant <tenant@example.com>", JAN_1, &[], vec![]),
                message("m2", "Agent <agent@example.com>", JAN_1 + 1_000, &[], vec![]),
                message("m3", &format!("Support <{ME}>"), JAN_1 + 2_000, &["SENT"], vec![]),
            ],
        };
        let n = normalizer();
        let out = n.normalize(&thread).unwrap();
        assert_eq!(out.ticket.from_email.as_deref(), Some(ME));

        let to = n.reply_recipient(&out.messages).unwrap();
        assert_eq!(to.email.as_deref(), Some("agent@example.com"));
        assert_eq!(to.name.as_deref(), Some("Agent"));

        let only_me = &out.messages[2..];
        assert_eq!(n.reply_recipient(only_me), None);
    }

    #[test]
    fn overflowing_deadline_is_malformed() {
        let mut table = crate::policy::PolicyTable::default();
        table.sla_hours.medium = crate::policy::MAX_SLA_HOURS;
        let policy = Arc::new(TriagePolicy::compile(&table).unwrap());
        let n = Normalizer::new([ME], policy);
        let late = (DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1)).timestamp_millis();
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![message("m1", "tenant@example.com", late, &[], vec![])],
        };
        assert!(matches!(n.normalize(&thread), Err(Error::Malformed(_))));
    }

    #[test]
    fn automated_sender_is_low() {
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![message("m1", "Portal <no-reply@portal.example>", JAN_1, &[], vec![])],
        };
        assert_eq!(normalizer().normalize(&thread).unwrap().ticket.priority, Priority::Low);
    }

    #[test]
    fn separates_bodies_inline_parts_and_attachments() {
        let html = "<p>See <img src=\"cid:logo123\"></p>";
        let inline = MessagePart {
            part_id: "1.2".into(),
            mime_type: "image/png".into(),
            headers: vec![
                header("Content-ID", "<logo123>"),
                header("Content-Disposition", "inline"),
            ],
            body: PartBody {
                attachment_id: Some("ANGjdJ-inline".into()),
                size: 512,
                data: None,
            },
            ..MessagePart::default()
        };
        let pdf = MessagePart {
            part_id: "2".into(),
            mime_type: "application/pdf".into(),
            filename: "lease.pdf".into(),
            headers: vec![header("Content-Disposition", "attachment; filename=\"lease.pdf\"")],
            body: PartBody {
                attachment_id: Some("ANGjdJ-pdf".into()),
                size: 2048,
                data: None,
            },
            ..MessagePart::default()
        };
        let related = MessagePart {
            part_id: "1".into(),
            mime_type: "multipart/related".into(),
            parts: vec![text_part("1.1", "text/html", html), inline],
            ..MessagePart::default()
        };
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![message(
                "m1",
                "tenant@example.com",
                JAN_1,
                &[],
                vec![text_part("0", "text/plain", "plain body"), related, pdf],
            )],
        };

        let out = normalizer().normalize(&thread).unwrap();
        let msg = &out.messages[0];
        assert_eq!(msg.body_text, "plain body");
        assert_eq!(msg.body_html.as_deref(), Some(html));
        assert_eq!(msg.attachments.len(), 2);

        let logo = msg.attachments.iter().find(|a| a.id == "1.2").unwrap();
        assert!(logo.is_inline);
        assert_eq!(logo.content_id.as_deref(), Some("logo123"));
        assert_eq!(logo.provider_ref.as_deref(), Some("ANGjdJ-inline"));

        let downloadable: Vec<_> = msg.downloadable_attachments().collect();
        assert_eq!(downloadable.len(), 1);
        assert_eq!(downloadable[0].filename, "lease.pdf");
        assert_eq!(downloadable[0].size, 2048);
    }

    #[test]
    fn content_id_with_attachment_disposition_is_downloadable() {
        let part = MessagePart {
            part_id: "1".into(),
            mime_type: "image/jpeg".into(),
            filename: "photo.jpg".into(),
            headers: vec![
                header("Content-ID", "<photo>"),
                header("Content-Disposition", "attachment; filename=photo.jpg"),
            ],
            ..MessagePart::default()
        };
        let record = attachment_record("m1", &part);
        assert!(!record.is_inline);
    }

    #[test]
    fn empty_thread_is_malformed() {
        let thread = RawThread {
            id: "t-empty".into(),
            ..RawThread::default()
        };
        let err = normalizer().normalize(&thread).unwrap_err();
        assert!(matches!(err, Error::Malformed(m) if m.contains("t-empty")));
    }

    #[test]
    fn missing_internal_date_is_malformed() {
        let mut raw = message("m1", "tenant@example.com", JAN_1, &[], vec![]);
        raw.internal_date = Some("yesterday".into());
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![raw],
        };
        assert!(matches!(normalizer().normalize(&thread), Err(Error::Malformed(_))));
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let mut raw = message("m1", "tenant@example.com", JAN_1, &[], vec![]);
        if let Some(payload) = raw.payload.as_mut() {
            payload.headers.retain(|h| h.name != "Subject");
        }
        let thread = RawThread {
            id: "t1".into(),
            history_id: None,
            messages: vec![raw],
        };
        assert_eq!(normalizer().normalize(&thread).unwrap().ticket.subject, NO_SUBJECT);
    }

    #[test]
    fn decodes_encoded_word_sender_names() {
        let (sender, _) = parse_addresses("=?UTF-8?B?SsO8cmdlbg==?= <j@example.com>", "");
        assert_eq!(sender.name.as_deref(), Some("Jürgen"));
        assert_eq!(sender.email.as_deref(), Some("j@example.com"));
    }
}
