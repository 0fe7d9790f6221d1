//! Background scheduler: periodic incremental sync, SLA escalation and
//! reminder digests.
//!
//! One [`Autopilot`] exists per process. Start and stop are plain state
//! transitions between stopped and running; a tick that finds the mailbox
//! already syncing is skipped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::error::{Error, Result};
use crate::remind::Reminders;
use crate::store::TicketStore;
use crate::sync::SyncService;

/// Default poll interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutopilotStatus {
    pub running: bool,
    pub scheduler_enabled: bool,
    pub interval_secs: u64,
    pub ticks: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct State {
    task: Option<JoinHandle<()>>,
    ticks: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct Autopilot {
    sync: Arc<SyncService>,
    store: Arc<dyn TicketStore>,
    reminders: Arc<Reminders>,
    interval: Duration,
    max_threads: i64,
    enabled: bool,
    state: Mutex<State>,
}

impl Autopilot {
    #[must_use]
    pub fn new(
        sync: Arc<SyncService>,
        store: Arc<dyn TicketStore>,
        reminders: Arc<Reminders>,
        interval: Duration,
        max_threads: i64,
        enabled: bool,
    ) -> Self {
        Self {
            sync,
            store,
            reminders,
            interval,
            max_threads,
            enabled,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to running. Starting a running autopilot is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<AutopilotStatus> {
        if !self.enabled {
            return Err(Error::InvalidInput("scheduler is disabled".into()));
        }
        let mut state = self.state();
        if state.task.is_none() {
            let this = Arc::clone(self);
            state.task = Some(tokio::spawn(async move {
                let mut ticker = interval(this.interval);
                loop {
                    ticker.tick().await;
                    this.tick().await;
                }
            }));
            tracing::info!("autopilot started, interval {:?}", self.interval);
        }
        drop(state);
        Ok(self.status())
    }

    /// Move to stopped. Stopping a stopped autopilot is a no-op.
    pub fn stop(&self) -> Result<AutopilotStatus> {
        if !self.enabled {
            return Err(Error::InvalidInput("scheduler is disabled".into()));
        }
        if let Some(task) = self.state().task.take() {
            task.abort();
            tracing::info!("autopilot stopped");
        }
        Ok(self.status())
    }

    #[must_use]
    pub fn status(&self) -> AutopilotStatus {
        let state = self.state();
        AutopilotStatus {
            running: state.task.is_some(),
            scheduler_enabled: self.enabled,
            interval_secs: self.interval.as_secs(),
            ticks: state.ticks,
            last_run_at: state.last_run_at,
            last_error: state.last_error.clone(),
        }
    }

    /// One scheduled run: incremental sync, escalation, then reminders.
    async fn tick(&self) {
        if self.sync.guard().is_busy(self.sync.mailbox()) {
            tracing::debug!("autopilot tick skipped, sync already running");
            return;
        }

        let mut error = None;
        match self.sync.check_updates(self.max_threads).await {
            Ok(report) => tracing::debug!("autopilot synced {} threads", report.synced_count),
            Err(Error::SyncInProgress(_)) => {
                tracing::debug!("autopilot tick skipped, sync already running");
                return;
            }
            Err(e) => {
                tracing::error!("autopilot sync failed: {e}");
                error = Some(e.to_string());
            }
        }
        match self.store.escalate_overdue(Utc::now()) {
            Ok(ids) if !ids.is_empty() => tracing::info!("escalated {} overdue tickets", ids.len()),
            Ok(_) => {}
            Err(e) => {
                tracing::error!("escalation failed: {e}");
                error.get_or_insert_with(|| e.to_string());
            }
        }
        if let Err(e) = self.reminders.run(Utc::now()).await {
            tracing::error!("reminder digest failed: {e}");
            error.get_or_insert_with(|| e.to_string());
        }

        let mut state = self.state();
        state.ticks += 1;
        state.last_run_at = Some(Utc::now());
        state.last_error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::policy::TriagePolicy;
    use crate::provider::MemoryMailbox;
    use crate::remind::DEFAULT_COOLDOWN;
    use crate::retry::RetryPolicy;
    use crate::sqlite_store::SqliteStore;
    use crate::testing::{inbox_thread, JAN_1, ME};
    use tokio::sync::broadcast;

    fn autopilot(enabled: bool) -> (tempfile::TempDir, Arc<MemoryMailbox>, Arc<SqliteStore>, Arc<Autopilot>) {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(16);
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db"), tx).unwrap());
        let mailbox = Arc::new(MemoryMailbox::new(ME));
        let sync = Arc::new(SyncService::new(
            mailbox.clone(),
            store.clone(),
            Normalizer::new([ME], Arc::new(TriagePolicy::default())),
            RetryPolicy::immediate(1),
        ));
        let reminders = Arc::new(Reminders::new(
            store.clone(),
            mailbox.clone(),
            None,
            DEFAULT_COOLDOWN,
        ));
        let pilot = Arc::new(Autopilot::new(
            sync,
            store.clone(),
            reminders,
            Duration::from_millis(20),
            50,
            enabled,
        ));
        (dir, mailbox, store, pilot)
    }

    #[tokio::test]
    async fn start_stop_are_idempotent_transitions() {
        let (_dir, _mailbox, _store, pilot) = autopilot(true);
        assert!(!pilot.status().running);
        assert!(pilot.start().unwrap().running);
        assert!(pilot.start().unwrap().running);
        assert!(!pilot.stop().unwrap().running);
        assert!(!pilot.stop().unwrap().running);
    }

    #[tokio::test]
    async fn disabled_scheduler_rejects_start() {
        let (_dir, _mailbox, _store, pilot) = autopilot(false);
        assert!(matches!(pilot.start(), Err(Error::InvalidInput(_))));
        let status = pilot.status();
        assert!(!status.running);
        assert!(!status.scheduler_enabled);
    }

    #[tokio::test]
    async fn ticks_sync_escalate_and_remind() {
        let (_dir, mailbox, store, pilot) = autopilot(true);
        mailbox.put_thread(inbox_thread("t1", JAN_1));
        pilot.start().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        pilot.stop().unwrap();

        let status = pilot.status();
        assert!(status.ticks >= 1);
        assert_eq!(status.last_error, None);
        let ticket = store.ticket("t1").unwrap().unwrap();
        // a 2024 message is long past its SLA
        assert_eq!(ticket.escalation_level, 1);
        // later ticks fall inside the reminder cooldown
        let digests = mailbox.sent();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].thread_id, None);
    }
}
