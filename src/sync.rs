//! Sync orchestration: guard, fetch, normalize, reconcile.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ProviderError, Result};
use crate::fetch::{fetch_thread_ids, FetchParams, SyncMode};
use crate::normalize::Normalizer;
use crate::provider::MailProvider;
use crate::reconcile::{apply_batch, ReconcileStats};
use crate::retry::RetryPolicy;
use crate::store::TicketStore;

/// Default cap of the incremental shortcut.
pub const CHECK_UPDATES_MAX_THREADS: i64 = 200;

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub hit_limit: bool,
    pub target_mailbox: String,
    pub synced_count: usize,
    pub mode: SyncMode,
    pub fell_back: bool,
    /// Threads that vanished or could not be normalized.
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
}

/// Process-wide single-flight guard keyed by mailbox.
#[derive(Debug, Default)]
pub struct SyncGuard {
    active: Mutex<HashSet<String>>,
}

/// Held for the duration of one sync; releases the mailbox on drop.
#[derive(Debug)]
pub struct SyncPermit<'a> {
    guard: &'a SyncGuard,
    mailbox: String,
}

impl SyncGuard {
    /// Claim `mailbox`, or fail if a sync already holds it.
    pub fn try_acquire(&self, mailbox: &str) -> Result<SyncPermit<'_>> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::SyncInProgress(mailbox.to_string()))?;
        if !active.insert(mailbox.to_string()) {
            return Err(Error::SyncInProgress(mailbox.to_string()));
        }
        Ok(SyncPermit {
            guard: self,
            mailbox: mailbox.to_string(),
        })
    }

    #[must_use]
    pub fn is_busy(&self, mailbox: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(mailbox))
            .unwrap_or(true)
    }
}

impl Drop for SyncPermit<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.guard.active.lock() {
            active.remove(&self.mailbox);
        }
    }
}

pub struct SyncService {
    provider: Arc<dyn MailProvider>,
    store: Arc<dyn TicketStore>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    guard: SyncGuard,
}

impl SyncService {
    #[must_use]
    pub fn new(
        provider: Arc<dyn MailProvider>,
        store: Arc<dyn TicketStore>,
        normalizer: Normalizer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            normalizer,
            retry,
            guard: SyncGuard::default(),
        }
    }

    #[must_use]
    pub fn mailbox(&self) -> &str {
        self.provider.mailbox()
    }

    #[must_use]
    pub const fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub const fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    /// Run one sync. Rejected with [`Error::SyncInProgress`] while another
    /// sync holds the mailbox.
    pub async fn run(&self, params: &FetchParams) -> Result<SyncReport> {
        let mailbox = self.provider.mailbox().to_string();
        let _permit = self.guard.try_acquire(&mailbox)?;

        let cursor = self.store.cursor(&mailbox)?;
        let plan = params.plan(cursor.as_ref())?;
        tracing::info!(
            "sync {mailbox}: {:?} mode, max {} threads",
            plan.mode,
            plan.max_threads
        );

        let outcome = fetch_thread_ids(self.provider.as_ref(), &self.retry, &plan).await?;

        let mut batch = Vec::with_capacity(outcome.thread_ids.len());
        let mut skipped = 0;
        for thread_id in &outcome.thread_ids {
            let fetched = self
                .retry
                .run("get thread", || self.provider.get_thread(thread_id))
                .await;
            match fetched {
                Ok(raw) => match self.normalizer.normalize(&raw) {
                    Ok(normalized) => batch.push(normalized),
                    Err(e) => {
                        tracing::warn!("skipping thread {thread_id}: {e}");
                        skipped += 1;
                    }
                },
                Err(ProviderError::NotFound(_)) => {
                    tracing::debug!("thread {thread_id} disappeared before fetch");
                    skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        let mut stats = ReconcileStats::default();
        self.store.write_batch(&mut |writer| {
            stats = apply_batch(writer, &batch, &mailbox, &outcome.cursor, now)?;
            Ok(())
        })?;

        tracing::info!(
            "sync {mailbox} done: {} threads ({} created, {} updated, {} skipped), hit_limit={}",
            batch.len(),
            stats.created,
            stats.updated,
            skipped,
            outcome.hit_limit
        );

        Ok(SyncReport {
            hit_limit: outcome.hit_limit,
            target_mailbox: mailbox,
            synced_count: batch.len(),
            mode: outcome.mode,
            fell_back: outcome.fell_back,
            skipped,
            created: stats.created,
            updated: stats.updated,
        })
    }

    /// Incremental-only sync with a small cap.
    pub async fn check_updates(&self, max_threads: i64) -> Result<SyncReport> {
        self.run(&FetchParams {
            max_threads,
            incremental: true,
            ..FetchParams::default()
        })
        .await
    }
}
