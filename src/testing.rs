//! Builders for raw provider threads shared by unit tests.

use crate::provider::{encode_base64url, Header, MessagePart, PartBody, RawMessage, RawThread};

/// 2024-01-01T00:00:00Z in epoch milliseconds.
pub const JAN_1: i64 = 1_704_067_200_000;
pub const HOUR: i64 = 3_600_000;
pub const DAY: i64 = 24 * HOUR;

pub const ME: &str = "support@agency.example";

/// One plain-text message.
pub fn message(id: &str, thread_id: &str, from: &str, millis: i64, labels: &[&str], body: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        label_ids: labels.iter().map(|l| (*l).to_string()).collect(),
        snippet: body.chars().take(40).collect(),
        internal_date: Some(millis.to_string()),
        payload: Some(MessagePart {
            mime_type: "text/plain".to_string(),
            headers: vec![
                Header {
                    name: "From".into(),
                    value: from.to_string(),
                },
                Header {
                    name: "To".into(),
                    value: ME.to_string(),
                },
                Header {
                    name: "Subject".into(),
                    value: format!("About {thread_id}"),
                },
                Header {
                    name: "Message-ID".into(),
                    value: format!("<{id}@mail.example>"),
                },
            ],
            body: PartBody {
                attachment_id: None,
                size: body.len() as u64,
                data: Some(encode_base64url(body.as_bytes())),
            },
            ..MessagePart::default()
        }),
    }
}

/// A single-message inbox thread from a tenant.
pub fn inbox_thread(id: &str, millis: i64) -> RawThread {
    RawThread {
        id: id.to_string(),
        history_id: None,
        messages: vec![message(
            &format!("{id}-m1"),
            id,
            "Tenant <tenant@example.com>",
            millis,
            &["INBOX", "UNREAD"],
            "Hello, a question about my lease.",
        )],
    }
}

/// Append a message to a thread.
pub fn with_message(mut thread: RawThread, msg: RawMessage) -> RawThread {
    thread.messages.push(msg);
    thread
}
