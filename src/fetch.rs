//! Fetch strategy selection: date-range search, history delta, or bootstrap.
//!
//! [`FetchParams::plan`] validates caller input without touching the provider.
//! [`fetch_thread_ids`] then runs the chosen strategy and reports which thread
//! ids to pull and how the sync cursor should move once they are stored.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, ProviderError, Result};
use crate::model::SyncCursor;
use crate::provider::{MailProvider, ThreadQuery, INBOX_LABEL};
use crate::retry::RetryPolicy;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Largest page size requested from the provider.
pub const MAX_PAGE_SIZE: usize = 500;

/// Years the provider search accepts.
const SUPPORTED_YEARS: std::ops::RangeInclusive<i32> = 1970..=2099;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Range,
    Incremental,
    Bootstrap,
}

/// Caller parameters of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
    pub start: Option<NaiveDate>,
    /// Inclusive.
    pub end: Option<NaiveDate>,
    pub max_threads: i64,
    pub incremental: bool,
    pub include_anywhere: bool,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            max_threads: 500,
            incremental: true,
            include_anywhere: false,
        }
    }
}

/// Validated strategy for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub mode: SyncMode,
    pub max_threads: usize,
    /// Base query for listing modes.
    query: ThreadQuery,
    /// History id to pull the delta from, in incremental mode.
    history_start: Option<String>,
}

/// How the cursor moves after the batch commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Refresh `last_synced_at` of an existing cursor only.
    Touch,
    /// Store this history id.
    Advance(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub mode: SyncMode,
    pub thread_ids: Vec<String>,
    pub hit_limit: bool,
    /// Incremental mode fell back to a full listing.
    pub fell_back: bool,
    pub cursor: CursorUpdate,
}

/// Parse a `YYYY-MM-DD` date parameter.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| Error::InvalidInput(format!("invalid date '{value}', expected YYYY-MM-DD")))
}

fn check_bounds(name: &str, date: Option<NaiveDate>) -> Result<()> {
    match date {
        Some(d) if !SUPPORTED_YEARS.contains(&d.year()) => Err(Error::InvalidInput(format!(
            "{name} date {d} outside supported range 1970-01-01..=2099-12-31"
        ))),
        _ => Ok(()),
    }
}

fn search_date(date: NaiveDate) -> String {
    date.format("%Y/%m/%d").to_string()
}

fn listing_query(include_anywhere: bool, terms: Vec<String>) -> ThreadQuery {
    let mut terms = terms;
    let label = if include_anywhere {
        terms.insert(0, "in:anywhere".to_string());
        None
    } else {
        Some(INBOX_LABEL.to_string())
    };
    ThreadQuery {
        q: (!terms.is_empty()).then(|| terms.join(" ")),
        label,
        page_size: MAX_PAGE_SIZE,
    }
}

impl FetchParams {
    /// Validate the parameters and choose a strategy.
    pub fn plan(&self, cursor: Option<&SyncCursor>) -> Result<FetchPlan> {
        let max_threads = usize::try_from(self.max_threads)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                Error::InvalidInput(format!("max_threads must be positive, got {}", self.max_threads))
            })?;
        check_bounds("start", self.start)?;
        check_bounds("end", self.end)?;
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(Error::InvalidInput(format!(
                    "end date {end} is before start date {start}"
                )));
            }
        }

        if self.start.is_some() || self.end.is_some() {
            let mut terms = Vec::new();
            if let Some(start) = self.start {
                terms.push(format!("after:{}", search_date(start)));
            }
            if let Some(end) = self.end {
                let before = end.checked_add_days(Days::new(1)).unwrap_or(end);
                terms.push(format!("before:{}", search_date(before)));
            }
            return Ok(FetchPlan {
                mode: SyncMode::Range,
                max_threads,
                query: listing_query(self.include_anywhere, terms),
                history_start: None,
            });
        }

        match cursor {
            Some(cursor) if self.incremental => Ok(FetchPlan {
                mode: SyncMode::Incremental,
                max_threads,
                query: listing_query(false, Vec::new()),
                history_start: Some(cursor.history_id.clone()),
            }),
            _ => Ok(FetchPlan {
                mode: SyncMode::Bootstrap,
                max_threads,
                query: listing_query(self.include_anywhere, Vec::new()),
                history_start: None,
            }),
        }
    }
}

/// Run the planned strategy against the provider.
pub async fn fetch_thread_ids(
    provider: &dyn MailProvider,
    retry: &RetryPolicy,
    plan: &FetchPlan,
) -> Result<FetchOutcome> {
    match (plan.mode, plan.history_start.as_deref()) {
        (SyncMode::Incremental, Some(start)) => {
            let label = plan.query.label.as_deref();
            match pull_history(provider, retry, start, label, plan.max_threads).await {
                Ok((thread_ids, hit_limit, history_id)) => Ok(FetchOutcome {
                    mode: SyncMode::Incremental,
                    thread_ids,
                    hit_limit,
                    fell_back: false,
                    cursor: CursorUpdate::Advance(history_id),
                }),
                Err(ProviderError::HistoryExpired) => {
                    tracing::warn!(
                        "history id {start} expired for {}, falling back to full inbox listing",
                        provider.mailbox()
                    );
                    let mut outcome = bootstrap(provider, retry, plan).await?;
                    outcome.mode = SyncMode::Incremental;
                    outcome.fell_back = true;
                    Ok(outcome)
                }
                Err(e) => Err(e.into()),
            }
        }
        (SyncMode::Range, _) => {
            let (thread_ids, hit_limit) =
                list_paged(provider, retry, &plan.query, plan.max_threads).await?;
            Ok(FetchOutcome {
                mode: SyncMode::Range,
                thread_ids,
                hit_limit,
                fell_back: false,
                cursor: CursorUpdate::Touch,
            })
        }
        _ => bootstrap(provider, retry, plan).await,
    }
}

async fn bootstrap(
    provider: &dyn MailProvider,
    retry: &RetryPolicy,
    plan: &FetchPlan,
) -> Result<FetchOutcome> {
    // Captured first so mail arriving mid-listing shows up in the next delta.
    let history_id = retry
        .run("current history id", || provider.current_history_id())
        .await?;
    let (thread_ids, hit_limit) = list_paged(provider, retry, &plan.query, plan.max_threads).await?;
    Ok(FetchOutcome {
        mode: SyncMode::Bootstrap,
        thread_ids,
        hit_limit,
        fell_back: false,
        cursor: CursorUpdate::Advance(history_id),
    })
}

/// Page through a listing until exhausted or `max` distinct ids are collected.
async fn list_paged(
    provider: &dyn MailProvider,
    retry: &RetryPolicy,
    base: &ThreadQuery,
    max: usize,
) -> ProviderResult<(Vec<String>, bool)> {
    let mut ids: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;

    loop {
        let query = ThreadQuery {
            page_size: (max - ids.len()).min(MAX_PAGE_SIZE),
            ..base.clone()
        };
        let page = retry
            .run("list threads", || provider.list_threads(&query, token.as_deref()))
            .await?;

        let mut page_ids = page.thread_ids.into_iter();
        for id in page_ids.by_ref() {
            if seen.insert(id.clone()) {
                ids.push(id);
                if ids.len() == max {
                    break;
                }
            }
        }

        if ids.len() == max {
            let more = page_ids.any(|id| !seen.contains(&id)) || page.next_page_token.is_some();
            return Ok((ids, more));
        }
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok((ids, false)),
        }
    }
}

/// Collect distinct thread ids from history records after `start` that
/// touched messages under `label`.
///
/// Returns the ids, whether the cap stopped the pull, and the history id the
/// cursor may advance to. When capped that is the last fully consumed record.
/// A single record is never split, so the first record is always taken whole.
async fn pull_history(
    provider: &dyn MailProvider,
    retry: &RetryPolicy,
    start: &str,
    label: Option<&str>,
    max: usize,
) -> ProviderResult<(Vec<String>, bool, String)> {
    let mut ids: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    let mut consumed = start.to_string();

    loop {
        let page = retry
            .run("list history", || {
                provider.list_history(start, label, token.as_deref())
            })
            .await?;

        for record in page.records {
            let mut fresh: Vec<String> = Vec::new();
            for id in record.thread_ids {
                if !seen.contains(&id) && !fresh.contains(&id) {
                    fresh.push(id);
                }
            }
            if !ids.is_empty() && ids.len() + fresh.len() > max {
                return Ok((ids, true, consumed));
            }
            seen.extend(fresh.iter().cloned());
            ids.extend(fresh);
            consumed = record.id;
        }

        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok((ids, false, page.history_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryMailbox;
    use crate::testing::{inbox_thread, DAY, JAN_1};
    use chrono::Utc;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn cursor(history_id: &str) -> SyncCursor {
        SyncCursor {
            mailbox: "support@agency.example".into(),
            history_id: history_id.into(),
            last_synced_at: Utc::now(),
        }
    }

    fn range(start: &str, end: &str, max: i64) -> FetchParams {
        FetchParams {
            start: Some(date(start)),
            end: Some(date(end)),
            max_threads: max,
            ..FetchParams::default()
        }
    }

    #[test]
    fn rejects_non_positive_cap() {
        for max in [0, -5] {
            let params = FetchParams {
                max_threads: max,
                ..FetchParams::default()
            };
            assert!(matches!(params.plan(None), Err(Error::InvalidInput(_))));
        }
    }

    #[test]
    fn rejects_inverted_and_out_of_range_dates() {
        assert!(matches!(
            range("2024-02-01", "2024-01-01", 10).plan(None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            range("1969-12-31", "2024-01-01", 10).plan(None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            range("2024-01-01", "2100-01-01", 10).plan(None),
            Err(Error::InvalidInput(_))
        ));
        assert!(parse_date("2024-13-01").is_err());
    }

    #[test]
    fn range_query_includes_end_day() {
        let plan = range("2024-01-01", "2024-01-31", 10).plan(None).unwrap();
        assert_eq!(plan.mode, SyncMode::Range);
        assert_eq!(plan.query.q.as_deref(), Some("after:2024/01/01 before:2024/02/01"));
        assert_eq!(plan.query.label.as_deref(), Some(INBOX_LABEL));

        let anywhere = FetchParams {
            include_anywhere: true,
            ..range("2024-01-01", "2024-01-01", 10)
        };
        let plan = anywhere.plan(None).unwrap();
        assert_eq!(
            plan.query.q.as_deref(),
            Some("in:anywhere after:2024/01/01 before:2024/01/02")
        );
        assert_eq!(plan.query.label, None);
    }

    #[test]
    fn mode_selection() {
        let c = cursor("42");
        let params = FetchParams::default();
        assert_eq!(params.plan(None).unwrap().mode, SyncMode::Bootstrap);
        assert_eq!(params.plan(Some(&c)).unwrap().mode, SyncMode::Incremental);
        let full = FetchParams {
            incremental: false,
            ..FetchParams::default()
        };
        assert_eq!(full.plan(Some(&c)).unwrap().mode, SyncMode::Bootstrap);
        let open_range = FetchParams {
            start: Some(date("2024-01-01")),
            ..FetchParams::default()
        };
        assert_eq!(open_range.plan(Some(&c)).unwrap().mode, SyncMode::Range);
    }

    #[tokio::test]
    async fn invalid_input_makes_no_provider_call() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        let params = FetchParams {
            max_threads: 0,
            ..FetchParams::default()
        };
        assert!(params.plan(None).is_err());
        assert_eq!(mailbox.calls(), 0);
    }

    #[tokio::test]
    async fn range_pagination_stops_at_cap() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        for i in 0..25 {
            mailbox.put_thread(inbox_thread(&format!("t{i:02}"), JAN_1 + i * DAY / 2));
        }
        let plan = range("2024-01-01", "2024-01-31", 10).plan(None).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.thread_ids.len(), 10);
        assert!(out.hit_limit);
        assert_eq!(out.cursor, CursorUpdate::Touch);
    }

    #[tokio::test]
    async fn range_without_more_data_is_not_limited() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        for i in 0..3 {
            mailbox.put_thread(inbox_thread(&format!("t{i}"), JAN_1 + i * DAY));
        }
        let plan = range("2024-01-01", "2024-01-31", 3).plan(None).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.thread_ids.len(), 3);
        assert!(!out.hit_limit);
    }

    #[tokio::test]
    async fn bootstrap_captures_history_id_before_listing() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        let before = mailbox.history_id();
        let plan = FetchParams::default().plan(None).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.mode, SyncMode::Bootstrap);
        assert_eq!(out.thread_ids, vec!["t1"]);
        assert_eq!(out.cursor, CursorUpdate::Advance(before));
    }

    #[tokio::test]
    async fn incremental_dedupes_history_threads() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        let start = mailbox.history_id();
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        mailbox.put_thread(inbox_thread("t2", JAN_1 + DAY));
        mailbox.put_thread(inbox_thread("t1", JAN_1 + 2 * DAY));
        let plan = FetchParams::default().plan(Some(&cursor(&start))).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.mode, SyncMode::Incremental);
        assert_eq!(out.thread_ids, vec!["t1", "t2"]);
        assert!(!out.hit_limit);
        assert_eq!(out.cursor, CursorUpdate::Advance(mailbox.history_id()));
    }

    #[tokio::test]
    async fn incremental_skips_threads_outside_inbox() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        let start = mailbox.history_id();
        let mut spam = inbox_thread("spam", JAN_1);
        spam.messages[0].label_ids = vec!["SPAM".into(), "UNREAD".into()];
        mailbox.put_thread(spam);
        mailbox.put_thread(inbox_thread("t1", JAN_1 + DAY));

        let plan = FetchParams::default().plan(Some(&cursor(&start))).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.thread_ids, vec!["t1"]);
        assert_eq!(out.cursor, CursorUpdate::Advance(mailbox.history_id()));

        let bootstrap = FetchParams::default().plan(None).unwrap();
        let listed = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &bootstrap)
            .await
            .unwrap();
        assert_eq!(listed.thread_ids, out.thread_ids);
    }

    #[tokio::test]
    async fn capped_incremental_advances_to_last_consumed_record() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        let start: u64 = mailbox.history_id().parse().unwrap();
        for i in 0..5 {
            mailbox.put_thread(inbox_thread(&format!("t{i}"), JAN_1 + i));
        }
        let params = FetchParams {
            max_threads: 2,
            ..FetchParams::default()
        };
        let plan = params.plan(Some(&cursor(&start.to_string()))).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert_eq!(out.thread_ids, vec!["t0", "t1"]);
        assert!(out.hit_limit);
        assert_eq!(out.cursor, CursorUpdate::Advance((start + 2).to_string()));
    }

    #[tokio::test]
    async fn expired_history_falls_back_to_listing() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        let start = mailbox.history_id();
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        mailbox.expire_history();
        let plan = FetchParams::default().plan(Some(&cursor(&start))).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(1), &plan)
            .await
            .unwrap();
        assert!(out.fell_back);
        assert_eq!(out.mode, SyncMode::Incremental);
        assert_eq!(out.thread_ids, vec!["t1"]);
        assert_eq!(out.cursor, CursorUpdate::Advance(mailbox.history_id()));
    }

    #[tokio::test]
    async fn transient_listing_errors_are_retried() {
        let mailbox = MemoryMailbox::new("support@agency.example");
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        mailbox.fail_next(ProviderError::RateLimited);
        mailbox.fail_next(ProviderError::Transient("502".into()));
        let plan = FetchParams::default().plan(None).unwrap();
        let out = fetch_thread_ids(&mailbox, &RetryPolicy::immediate(3), &plan)
            .await
            .unwrap();
        assert_eq!(out.thread_ids, vec!["t1"]);
    }
}
