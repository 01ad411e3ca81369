//! # beacon
//!
//! Operator CLI for the attribution engine: inspect and clear the durable
//! queue, read stored preferences, start a session against the configured
//! endpoint, and query persisted diagnostics.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use beacon_core::LinkContext;
use beacon_engine::{load_config, load_config_from_path, Beacon, SdkConfig};
use beacon_store::preferences::{
    FIRST_SESSION_PARAMS, IDENTITY_ID, LATEST_SESSION_PARAMS, SESSION_ID, TRACKING_DISABLED, USER_IDENTITY,
};
use beacon_store::{Database, PreferenceRepo, QueueStore, SqliteQueueStore};
use beacon_telemetry::{init_telemetry, LogQuery, TelemetryConfig};

/// Attribution engine tooling.
#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Attribution engine tooling")]
struct Cli {
    /// Settings file (defaults to `~/.beacon/config.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store file, overriding the configured one.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List requests waiting in the durable queue.
    Queue,
    /// Drop every pending request.
    Clear,
    /// Show stored session preferences.
    Prefs,
    /// Start a session, optionally with a deep link.
    Open {
        #[arg(long)]
        url: Option<String>,
    },
    /// Query persisted warn+ diagnostics.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

fn settings(cli: &Cli) -> Result<SdkConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    }
    .context("failed to load settings")?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

fn open_store(config: &SdkConfig) -> Result<Database> {
    Database::open(&config.store_path)
        .with_context(|| format!("failed to open store: {}", config.store_path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: if cli.verbose { Level::DEBUG } else { Level::INFO },
        json: cli.json_logs,
        ..Default::default()
    });
    let config = settings(&cli)?;

    match cli.command {
        Command::Queue => {
            let store = SqliteQueueStore::new(open_store(&config)?);
            let pending = store.load().context("failed to read queue")?;
            for request in &pending {
                println!(
                    "{}  {:<10} attempts={} created={}",
                    request.id,
                    request.kind,
                    request.attempts,
                    request.created_at.to_rfc3339()
                );
            }
            println!("{} pending", pending.len());
        }
        Command::Clear => {
            let store = SqliteQueueStore::new(open_store(&config)?);
            let dropped = store.load().map(|r| r.len()).unwrap_or(0);
            store.save(&[]).context("failed to clear queue")?;
            info!(dropped, "queue cleared");
            println!("dropped {dropped} pending requests");
        }
        Command::Prefs => {
            let prefs = PreferenceRepo::new(open_store(&config)?);
            for key in [IDENTITY_ID, SESSION_ID, USER_IDENTITY, TRACKING_DISABLED] {
                let value = prefs.get(key)?;
                println!("{key:<22} {}", value.as_deref().unwrap_or("-"));
            }
            for key in [FIRST_SESSION_PARAMS, LATEST_SESSION_PARAMS] {
                let value: Option<serde_json::Value> = prefs.get_json(key)?;
                println!("{key:<22} {}", value.map(|v| v.to_string()).unwrap_or_else(|| "-".into()));
            }
        }
        Command::Open { url } => {
            let beacon = Beacon::from_config(&config)?;
            let result = beacon.initialize(url.map(LinkContext::url)).await;
            beacon.shutdown().await;
            let result = result.context("session initialization failed")?;
            println!("{}", serde_json::to_string_pretty(result.session.as_ref())?);
        }
        Command::Logs {
            level,
            request_id,
            limit,
        } => {
            let Some(sink) = telemetry.logs() else {
                anyhow::bail!("diagnostics store is unavailable");
            };
            let records = sink.query(&LogQuery {
                level,
                request_id,
                limit: Some(limit),
                ..Default::default()
            })?;
            for record in records {
                println!(
                    "{} {:<5} {} {}",
                    record.timestamp, record.level, record.target, record.message
                );
            }
        }
    }
    Ok(())
}
