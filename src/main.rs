//! CLI entry point for mail-triage.

use clap::Parser;
use mail_triage::{
    start_server, GmailCredentials, GmailProvider, MailProvider, MemoryMailbox, PolicyTable,
    ServerOptions, TriagePolicy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mail-triage")]
#[command(about = "Triage a Gmail support mailbox as tickets, with incremental sync")]
struct Cli {
    /// HTTP port to listen on
    #[arg(short = 'p', long, env = "TRIAGE_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Path of the SQLite database
    #[arg(long, env = "TRIAGE_DB_PATH", default_value = "mail-triage.db")]
    db_path: PathBuf,

    /// Mailbox address to sync
    #[arg(short = 'm', long, env = "TRIAGE_MAILBOX")]
    mailbox: String,

    /// Comma-separated addresses that count as the support team
    #[arg(long, env = "TRIAGE_MY_ADDRESSES")]
    my_addresses: Option<String>,

    /// OAuth client id
    #[arg(long, env = "GMAIL_CLIENT_ID", required_unless_present = "offline")]
    client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "GMAIL_CLIENT_SECRET", required_unless_present = "offline")]
    client_secret: Option<String>,

    /// OAuth refresh token for the mailbox
    #[arg(long, env = "GMAIL_REFRESH_TOKEN", required_unless_present = "offline")]
    refresh_token: Option<String>,

    /// Address the mailbox explicitly (domain-wide delegation)
    #[arg(long, env = "GMAIL_DELEGATED")]
    delegated: bool,

    /// TOML file with urgency keywords, VIP senders and SLA offsets
    #[arg(long, env = "TRIAGE_POLICY")]
    policy: Option<PathBuf>,

    /// Seconds between autopilot runs
    #[arg(long, env = "TRIAGE_POLL_INTERVAL", default_value = "300")]
    poll_interval: u64,

    /// Allow the autopilot scheduler to run
    #[arg(long, env = "TRIAGE_ENABLE_SCHEDULER", default_value_t = true, action = clap::ArgAction::Set)]
    enable_scheduler: bool,

    /// Recipient of reminder digests (defaults to the mailbox)
    #[arg(long, env = "TRIAGE_REMIND_TO")]
    remind_to: Option<String>,

    /// Seconds before a ticket can appear in another reminder digest
    #[arg(long, env = "TRIAGE_REMIND_COOLDOWN", default_value = "3600")]
    remind_cooldown: u64,

    /// Start the autopilot immediately
    #[arg(long)]
    autopilot: bool,

    /// Serve an empty in-memory mailbox instead of Gmail
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let my_addresses: Vec<String> = cli
        .my_addresses
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let policy = match &cli.policy {
        Some(path) => TriagePolicy::compile(&PolicyTable::load(path)?)?,
        None => TriagePolicy::default(),
    };

    let provider: Arc<dyn MailProvider> = if cli.offline {
        tracing::warn!("offline mode: serving an in-memory mailbox");
        Arc::new(MemoryMailbox::new(cli.mailbox))
    } else {
        let credentials = GmailCredentials {
            client_id: cli.client_id.unwrap_or_default(),
            client_secret: cli.client_secret.unwrap_or_default(),
            refresh_token: cli.refresh_token.unwrap_or_default(),
        };
        Arc::new(GmailProvider::new(cli.mailbox, credentials, cli.delegated))
    };

    let opts = ServerOptions {
        http_port: Some(cli.http_port),
        db_path: cli.db_path,
        my_addresses,
        policy,
        poll_interval: Duration::from_secs(cli.poll_interval.max(1)),
        scheduler_enabled: cli.enable_scheduler,
        autopilot_on_start: cli.autopilot,
        reminder_to: cli.remind_to,
        reminder_cooldown: Duration::from_secs(cli.remind_cooldown),
        ..ServerOptions::default()
    };

    let server = start_server(opts, provider).await?;

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    server.stop().await;

    Ok(())
}
