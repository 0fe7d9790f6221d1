//! In-process mailbox implementing [`MailProvider`].
//!
//! Backs the `--offline` mode and the test suites. Threads are listed newest
//! first, every [`MemoryMailbox::put_thread`] appends one history record, and
//! failures can be queued to exercise retry and fallback paths.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    HistoryPage, HistoryRecord, MailProvider, RawThread, ThreadPage, ThreadQuery,
};
use crate::error::ProviderError;

const HISTORY_PAGE_SIZE: usize = 100;

/// A message handed to [`MailProvider::send_raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    /// `None` for a message that starts a new conversation.
    pub thread_id: Option<String>,
    pub raw: Vec<u8>,
}

/// One change to a thread and the labels it carried at that point.
struct Change {
    id: u64,
    thread_id: String,
    labels: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    threads: HashMap<String, RawThread>,
    history: Vec<Change>,
    history_id: u64,
    /// History ids below this are reported as expired.
    oldest_valid_history: u64,
    attachments: HashMap<(String, String), Vec<u8>>,
    sent: Vec<SentMessage>,
    failures: VecDeque<ProviderError>,
    calls: usize,
}

pub struct MemoryMailbox {
    mailbox: String,
    state: Mutex<State>,
}

impl MemoryMailbox {
    #[must_use]
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            state: Mutex::new(State {
                history_id: 1,
                ..State::default()
            }),
        }
    }

    /// Insert or replace a thread and record the change in history.
    pub fn put_thread(&self, thread: RawThread) {
        let mut state = self.state();
        state.record(&thread.id, thread_labels(&thread));
        state.threads.insert(thread.id.clone(), thread);
    }

    /// Remove a thread; the deletion still shows up in history under the
    /// labels it had.
    pub fn delete_thread(&self, thread_id: &str) {
        let mut state = self.state();
        let labels = state
            .threads
            .remove(thread_id)
            .map(|t| thread_labels(&t))
            .unwrap_or_default();
        state.record(thread_id, labels);
    }

    /// Make every history id issued so far unusable for delta queries.
    pub fn expire_history(&self) {
        let mut state = self.state();
        state.oldest_valid_history = state.history_id + 1;
    }

    /// Queue an error returned by the next provider call.
    pub fn fail_next(&self, error: ProviderError) {
        self.state().failures.push_back(error);
    }

    pub fn put_attachment(&self, message_id: &str, attachment_id: &str, data: Vec<u8>) {
        self.state()
            .attachments
            .insert((message_id.to_string(), attachment_id.to_string()), data);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    /// Number of provider calls served, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state().calls
    }

    #[must_use]
    pub fn history_id(&self) -> String {
        self.state().history_id.to_string()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_call(&self) -> Result<MutexGuard<'_, State>, ProviderError> {
        let mut state = self.state();
        state.calls += 1;
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

impl State {
    fn record(&mut self, thread_id: &str, labels: BTreeSet<String>) {
        self.history_id += 1;
        self.history.push(Change {
            id: self.history_id,
            thread_id: thread_id.to_string(),
            labels,
        });
    }
}

fn thread_labels(thread: &RawThread) -> BTreeSet<String> {
    thread
        .messages
        .iter()
        .flat_map(|m| m.label_ids.iter().cloned())
        .collect()
}

fn latest_date(thread: &RawThread) -> Option<DateTime<Utc>> {
    thread
        .messages
        .iter()
        .filter_map(|m| m.internal_date.as_deref()?.parse::<i64>().ok())
        .max()
        .and_then(DateTime::from_timestamp_millis)
}

/// Evaluates the `after:`/`before:`/`in:anywhere` subset of Gmail search.
fn matches_query(thread: &RawThread, query: &ThreadQuery) -> bool {
    let anywhere = query
        .q
        .as_deref()
        .is_some_and(|q| q.split_whitespace().any(|t| t == "in:anywhere"));
    if let Some(label) = &query.label {
        if !anywhere && !thread.messages.iter().any(|m| m.has_label(label)) {
            return false;
        }
    }

    let Some(q) = &query.q else {
        return true;
    };
    let date = latest_date(thread);
    for term in q.split_whitespace() {
        let bound = |prefix: &str| {
            term.strip_prefix(prefix)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y/%m/%d").ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        };
        if let Some(after) = bound("after:") {
            if !date.is_some_and(|d| d >= after) {
                return false;
            }
        }
        if let Some(before) = bound("before:") {
            if !date.is_some_and(|d| d < before) {
                return false;
            }
        }
    }
    true
}

fn parse_offset(token: Option<&str>) -> Result<usize, ProviderError> {
    token.map_or(Ok(0), |t| {
        t.parse()
            .map_err(|_| ProviderError::Api {
                status: 400,
                body: format!("bad page token {t}"),
            })
    })
}

#[async_trait]
impl MailProvider for MemoryMailbox {
    fn mailbox(&self) -> &str {
        &self.mailbox
    }

    async fn current_history_id(&self) -> Result<String, ProviderError> {
        let state = self.begin_call()?;
        Ok(state.history_id.to_string())
    }

    async fn list_threads(
        &self,
        query: &ThreadQuery,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError> {
        let state = self.begin_call()?;
        let offset = parse_offset(page_token)?;

        let mut matching: Vec<&RawThread> = state
            .threads
            .values()
            .filter(|t| matches_query(t, query))
            .collect();
        matching.sort_by(|a, b| latest_date(b).cmp(&latest_date(a)).then(a.id.cmp(&b.id)));

        let page_size = query.page_size.max(1);
        let end = (offset + page_size).min(matching.len());
        let thread_ids = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|t| t.id.clone())
            .collect();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        Ok(ThreadPage {
            thread_ids,
            next_page_token,
        })
    }

    async fn list_history(
        &self,
        start_history_id: &str,
        label: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let state = self.begin_call()?;
        let start: u64 = start_history_id
            .parse()
            .map_err(|_| ProviderError::HistoryExpired)?;
        if start < state.oldest_valid_history {
            return Err(ProviderError::HistoryExpired);
        }
        let offset = parse_offset(page_token)?;

        let after: Vec<&Change> = state
            .history
            .iter()
            .filter(|c| c.id > start)
            .filter(|c| label.map_or(true, |l| c.labels.contains(l)))
            .collect();
        let end = (offset + HISTORY_PAGE_SIZE).min(after.len());
        let records = after
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|c| HistoryRecord {
                id: c.id.to_string(),
                thread_ids: vec![c.thread_id.clone()],
            })
            .collect();
        Ok(HistoryPage {
            records,
            next_page_token: (end < after.len()).then(|| end.to_string()),
            history_id: state.history_id.to_string(),
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<RawThread, ProviderError> {
        let state = self.begin_call()?;
        state
            .threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("thread {thread_id}")))
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let state = self.begin_call()?;
        state
            .attachments
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("attachment {attachment_id}")))
    }

    async fn send_raw(
        &self,
        thread_id: Option<&str>,
        raw: &[u8],
    ) -> Result<String, ProviderError> {
        let mut state = self.begin_call()?;
        let id = format!("sent-{}", state.sent.len() + 1);
        state.sent.push(SentMessage {
            id: id.clone(),
            thread_id: thread_id.map(str::to_string),
            raw: raw.to_vec(),
        });
        Ok(id)
    }
}
