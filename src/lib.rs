//! Support-ticket triage over a Gmail mailbox.
//!
//! Threads are pulled from a [`MailProvider`], normalized into tickets and
//! reconciled into a [`TicketStore`]; an HTTP API and dashboard sit on top.

pub mod autopilot;
pub mod compose;
pub mod error;
pub mod fetch;
mod http;
pub mod model;
pub mod normalize;
pub mod policy;
pub mod provider;
pub mod reconcile;
pub mod remind;
pub mod retry;
pub mod sqlite_store;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use autopilot::{Autopilot, AutopilotStatus};
pub use error::{Error, ProviderError, Result};
pub use fetch::{FetchParams, SyncMode};
pub use model::{Ticket, TicketCategory, TicketStatus};
pub use normalize::Normalizer;
pub use policy::{PolicyTable, TriagePolicy};
pub use provider::{GmailCredentials, GmailProvider, MailProvider, MemoryMailbox};
pub use remind::{ReminderReport, Reminders};
pub use retry::RetryPolicy;
pub use sqlite_store::SqliteStore;
pub use store::TicketStore;
pub use sync::{SyncReport, SyncService};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Configuration options for the triage server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub http_port: Option<u16>,
    pub db_path: PathBuf,
    /// Addresses whose messages count as replies from the support team.
    pub my_addresses: Vec<String>,
    pub policy: TriagePolicy,
    pub poll_interval: Duration,
    pub scheduler_enabled: bool,
    /// Start the autopilot as soon as the server is up.
    pub autopilot_on_start: bool,
    /// Thread cap of each autopilot run.
    pub max_threads: i64,
    pub retry: RetryPolicy,
    /// Recipient of reminder digests. Defaults to the mailbox.
    pub reminder_to: Option<String>,
    pub reminder_cooldown: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            http_port: None,
            db_path: PathBuf::from("mail-triage.db"),
            my_addresses: Vec::new(),
            policy: TriagePolicy::default(),
            poll_interval: autopilot::DEFAULT_INTERVAL,
            scheduler_enabled: true,
            autopilot_on_start: false,
            max_threads: sync::CHECK_UPDATES_MAX_THREADS,
            retry: RetryPolicy::default(),
            reminder_to: None,
            reminder_cooldown: remind::DEFAULT_COOLDOWN,
        }
    }
}

/// Running server handles.
pub struct RunningServer {
    pub http_addr: SocketAddr,
    http_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
    autopilot: Arc<Autopilot>,
    store: Arc<SqliteStore>,
}

impl RunningServer {
    /// Stop the scheduler and the HTTP server, then checkpoint the database.
    pub async fn stop(self) {
        if self.autopilot.status().running {
            let _ = self.autopilot.stop();
        }
        let _ = self.shutdown_tx.send(());
        let _ = self.http_handle.await;
        self.store.close();
    }
}

/// Start the triage server against `provider`.
pub async fn start_server(
    opts: ServerOptions,
    provider: Arc<dyn MailProvider>,
) -> std::io::Result<RunningServer> {
    let http_port = opts.http_port.unwrap_or(8080);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (notify_tx, _) = broadcast::channel::<()>(16);

    let store = Arc::new(SqliteStore::open(&opts.db_path, notify_tx.clone())?);
    let tickets: Arc<dyn TicketStore> = store.clone();

    // The mailbox itself always counts as "me".
    let my_addresses = std::iter::once(provider.mailbox().to_string()).chain(opts.my_addresses);
    let normalizer = Normalizer::new(my_addresses, Arc::new(opts.policy));
    let sync = Arc::new(SyncService::new(
        Arc::clone(&provider),
        Arc::clone(&tickets),
        normalizer,
        opts.retry,
    ));
    let reminders = Arc::new(Reminders::new(
        Arc::clone(&tickets),
        Arc::clone(&provider),
        opts.reminder_to,
        opts.reminder_cooldown,
    ));
    let autopilot = Arc::new(Autopilot::new(
        Arc::clone(&sync),
        Arc::clone(&tickets),
        Arc::clone(&reminders),
        opts.poll_interval,
        opts.max_threads,
        opts.scheduler_enabled,
    ));
    if opts.autopilot_on_start {
        autopilot.start()?;
    }

    let http_listener = TcpListener::bind(("0.0.0.0", http_port)).await?;
    let http_addr = http_listener.local_addr()?;

    tracing::info!(
        "HTTP server listening on port {}, mailbox {}",
        http_addr.port(),
        provider.mailbox()
    );

    let state = http::AppState {
        store: tickets,
        provider,
        sync,
        autopilot: Arc::clone(&autopilot),
        reminders,
        notify: notify_tx,
    };
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        http::run_http_server(http_listener, state, http_shutdown).await;
    });

    Ok(RunningServer {
        http_addr,
        http_handle,
        shutdown_tx,
        autopilot,
        store,
    })
}
