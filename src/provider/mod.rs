//! Mail provider interface and the raw thread schema it returns.
//!
//! The schema mirrors the Gmail API `format=full` resources. Everything the
//! normalizer reads is declared here; unknown fields are ignored.

mod gmail;
pub mod memory;

pub use gmail::{GmailCredentials, GmailProvider};
pub use memory::MemoryMailbox;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Label carried by messages the mailbox owner has not read.
pub const UNREAD_LABEL: &str = "UNREAD";
/// Label of the primary inbox.
pub const INBOX_LABEL: &str = "INBOX";

/// Base64url as Gmail emits it: padding may or may not be present.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a Gmail body or attachment payload.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, ProviderError> {
    BASE64URL
        .decode(data.trim())
        .map_err(|e| ProviderError::Decode(format!("base64url payload: {e}")))
}

/// Encode bytes for Gmail's `raw` and `data` fields.
#[must_use]
pub fn encode_base64url(data: &[u8]) -> String {
    BASE64URL.encode(data)
}

/// Thread search parameters for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadQuery {
    /// Provider search expression (`after:2024/01/01 before:2024/02/01`).
    pub q: Option<String>,
    /// Restrict to threads carrying this label.
    pub label: Option<String>,
    /// Requested page size.
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPage {
    pub thread_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// One history record and the threads it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: String,
    pub thread_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    /// Mailbox history id at the time of the response.
    pub history_id: String,
}

/// Remote mailbox operations the sync engine and reply path rely on.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Address of the mailbox this provider reads.
    fn mailbox(&self) -> &str;

    /// Current mailbox history id.
    async fn current_history_id(&self) -> Result<String, ProviderError>;

    /// One page of thread ids matching `query`.
    async fn list_threads(
        &self,
        query: &ThreadQuery,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError>;

    /// One page of history after `start_history_id`, limited to changes on
    /// messages carrying `label` when one is given.
    ///
    /// Returns [`ProviderError::HistoryExpired`] when the id is too old.
    async fn list_history(
        &self,
        start_history_id: &str,
        label: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError>;

    async fn get_thread(&self, thread_id: &str) -> Result<RawThread, ProviderError>;

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Send an RFC 5322 message, into `thread_id` when given or as a new
    /// conversation otherwise. Returns the new message id.
    async fn send_raw(&self, thread_id: Option<&str>, raw: &[u8])
        -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawThread {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePart>,
}

impl RawMessage {
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    /// First header with this name, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// This part and all descendants, depth-first.
    #[must_use]
    pub fn walk(&self) -> Vec<&Self> {
        let mut out = vec![self];
        for part in &self.parts {
            out.extend(part.walk());
        }
        out
    }

    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.mime_type.to_ascii_lowercase().starts_with("multipart/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_padded_and_unpadded_base64url() {
        assert_eq!(decode_base64url("aGk_").unwrap(), b"hi?");
        assert_eq!(decode_base64url("aGk").unwrap(), b"hi");
        assert_eq!(decode_base64url("aGk=").unwrap(), b"hi");
        assert!(matches!(decode_base64url("***"), Err(ProviderError::Decode(_))));
    }

    #[test]
    fn parses_gmail_thread_json() {
        let json = r#"{
            "id": "t1",
            "historyId": "99",
            "messages": [{
                "id": "m1",
                "threadId": "t1",
                "labelIds": ["INBOX", "UNREAD"],
                "snippet": "Hello",
                "internalDate": "1704067200000",
                "payload": {
                    "partId": "",
                    "mimeType": "multipart/mixed",
                    "headers": [{"name": "From", "value": "A <a@example.com>"}],
                    "body": {"size": 0},
                    "parts": [{"partId": "0", "mimeType": "text/plain", "body": {"size": 5, "data": "aGVsbG8"}}]
                }
            }]
        }"#;
        let thread: RawThread = serde_json::from_str(json).unwrap();
        assert_eq!(thread.messages.len(), 1);
        let msg = &thread.messages[0];
        assert!(msg.has_label(UNREAD_LABEL));
        let payload = msg.payload.as_ref().unwrap();
        assert_eq!(payload.header("from"), Some("A <a@example.com>"));
        assert_eq!(payload.walk().len(), 2);
        assert!(payload.is_multipart());
    }
}
