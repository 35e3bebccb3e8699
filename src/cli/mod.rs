//! CLI commands for Courier using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::load_settings_or_default;
use crate::daemon::RelayDaemon;
use crate::ledger::RelayLedger;
use crate::store::MessageStore;
use crate::tracker::{ConnectionHandle, ConnectionRegistry};

/// Courier - durable message relay daemon for autonomous agents.
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - durable message relay for agent processes", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay daemon
    Run,

    /// Show store and ledger statistics
    Stats,

    /// Probe storage health
    Health,

    /// Run retention cleanup once and exit
    Cleanup,

    /// Repair ledger state against the filesystem and exit
    Reconcile,
}

/// Registry for standalone runs with no embedding transport layer.
struct NoConnections;

impl ConnectionRegistry for NoConnections {
    fn resolve(&self, _connection_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
        None
    }
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run => run_daemon().await,
            Command::Stats => show_stats().await,
            Command::Health => show_health().await,
            Command::Cleanup => run_cleanup().await,
            Command::Reconcile => run_reconcile().await,
        }
    }
}

async fn run_daemon() -> Result<()> {
    let settings = load_settings_or_default();
    let daemon = RelayDaemon::new(settings, Arc::new(NoConnections)).await?;

    tokio::select! {
        result = daemon.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
            daemon.stop().await;
        }
    }

    Ok(())
}

async fn open_store() -> Result<MessageStore> {
    let settings = load_settings_or_default();
    let root = settings.storage.resolve_root()?;
    Ok(MessageStore::open(root, settings.storage.retention_days).await?)
}

fn open_ledger() -> Result<RelayLedger> {
    let settings = load_settings_or_default();
    Ok(RelayLedger::open(
        &settings.ledger.resolve_db_path()?,
        settings.ledger.max_retries,
        settings.ledger.archive_retention_days,
    )?)
}

async fn show_stats() -> Result<()> {
    let store = open_store().await?;
    let ledger = open_ledger()?;
    let stats = ledger.get_stats()?;

    println!("Messages:   {}", store.message_count());
    println!("Sessions:   {}", store.get_sessions(None).len());
    println!("Ledger:");
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Delivered:  {}", stats.delivered);
    println!("  Failed:     {}", stats.failed);
    println!("  Archived:   {}", stats.archived);
    Ok(())
}

async fn show_health() -> Result<()> {
    let store = open_store().await?;
    let health = store.health_check().await;

    println!("Driver:     {}", health.driver);
    println!("Persistent: {}", health.persistent);
    println!("Readable:   {}", health.can_read);
    println!("Writable:   {}", health.can_write);
    if let Some(error) = &health.error {
        println!("Error:      {}", error);
    }
    Ok(())
}

async fn run_cleanup() -> Result<()> {
    let store = open_store().await?;
    let ledger = open_ledger()?;

    let messages = store.cleanup_expired_messages().await?;
    let records = ledger.cleanup_archived_records()?;

    println!("Removed {} expired message records", messages);
    println!("Purged {} archived ledger records", records);
    Ok(())
}

async fn run_reconcile() -> Result<()> {
    let ledger = open_ledger()?;

    let reset = ledger.reset_processing_files()?;
    let report = ledger.reconcile_with_filesystem()?;

    println!("Reset {} dangling claims", reset);
    println!("Reconciled: {} reset, {} failed", report.reset, report.failed);
    Ok(())
}
