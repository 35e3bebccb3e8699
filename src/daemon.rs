//! Relay daemon wiring and maintenance loop.
//!
//! One store, one ledger, and one tracker per daemon process, owned here
//! and handed out by reference. Startup proactively repairs whatever a
//! crash left behind before any new work is accepted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::ledger::RelayLedger;
use crate::store::MessageStore;
use crate::tracker::{ConnectionRegistry, DeliveryTracker, TrackerConfig};

/// The relay daemon.
pub struct RelayDaemon {
    settings: Settings,
    store: MessageStore,
    ledger: Arc<RelayLedger>,
    tracker: Arc<DeliveryTracker>,
    running: Arc<RwLock<bool>>,
}

impl RelayDaemon {
    /// Construct the daemon's store, ledger, and tracker. The connection
    /// registry comes from the embedding transport layer.
    pub async fn new(
        settings: Settings,
        registry: Arc<dyn ConnectionRegistry>,
    ) -> Result<Self> {
        let storage_root = settings.storage.resolve_root()?;
        let store = MessageStore::open(storage_root, settings.storage.retention_days).await?;

        let ledger = Arc::new(RelayLedger::open(
            &settings.ledger.resolve_db_path()?,
            settings.ledger.max_retries,
            settings.ledger.archive_retention_days,
        )?);

        let tracker_config = TrackerConfig {
            ack_timeout: Duration::from_secs(settings.delivery.ack_timeout_secs),
            max_attempts: settings.delivery.max_attempts,
            ttl: Duration::from_secs(settings.delivery.ttl_secs),
        };
        let tracker = DeliveryTracker::new(tracker_config, registry, store.clone());

        Ok(Self {
            settings,
            store,
            ledger,
            tracker,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<RelayLedger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Repair state left over from an unclean shutdown: dangling claims go
    /// back to pending, vanished outbox files go terminal, and expired
    /// messages are swept once before the periodic loop takes over.
    pub async fn recover(&self) -> Result<()> {
        let reset = self.ledger.reset_processing_files()?;
        let report = self.ledger.reconcile_with_filesystem()?;
        tracing::info!(
            "Startup recovery: {} claims reset, reconciliation reset {} / failed {}",
            reset,
            report.reset,
            report.failed
        );

        match self.store.cleanup_expired_messages().await {
            Ok(affected) if affected > 0 => {
                tracing::info!("Startup cleanup removed {} expired records", affected);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Startup cleanup warning: {}", e),
        }

        Ok(())
    }

    /// Run recovery, then the periodic maintenance loop until `stop`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(Error::Other("Daemon already running".to_string()));
            }
            *running = true;
        }

        self.recover().await?;

        let _watcher = if self.settings.storage.watch_external_writes {
            Some(self.store.spawn_watcher()?)
        } else {
            None
        };

        tracing::info!("Relay daemon started");

        let interval = Duration::from_secs(self.settings.monitoring.cleanup_interval_secs);
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            {
                let running = self.running.read().await;
                if !*running {
                    tracing::info!("Relay daemon stopping");
                    break;
                }
            }

            if last_cleanup.elapsed() >= interval {
                self.run_cleanup_pass().await;
                last_cleanup = tokio::time::Instant::now();
            }

            sleep(Duration::from_secs(1)).await;
        }

        Ok(())
    }

    /// Signal the maintenance loop to exit.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// One maintenance pass. Errors are logged and swallowed so a disk
    /// hiccup cannot halt the relay.
    pub async fn run_cleanup_pass(&self) {
        match self.store.cleanup_expired_messages().await {
            Ok(affected) if affected > 0 => {
                tracing::info!("Cleanup removed {} expired message records", affected);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Message cleanup warning: {}", e),
        }

        match self.ledger.cleanup_archived_records() {
            Ok(purged) if purged > 0 => {
                tracing::info!("Cleanup purged {} archived ledger records", purged);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Ledger cleanup warning: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, StorageConfig};
    use crate::ledger::ClaimOutcome;
    use crate::tracker::ConnectionHandle;
    use std::path::Path;

    struct NoConnections;

    impl ConnectionRegistry for NoConnections {
        fn resolve(&self, _connection_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
            None
        }
    }

    fn test_settings(dir: &tempfile::TempDir) -> Settings {
        Settings {
            storage: StorageConfig {
                root: Some(dir.path().join("storage")),
                ..Default::default()
            },
            ledger: LedgerConfig {
                db_path: Some(dir.path().join("ledger.db")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_recover_resets_dangling_claims() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(&dir);
        let daemon = RelayDaemon::new(settings, Arc::new(NoConnections))
            .await
            .unwrap();

        let outbox_file = dir.path().join("msg-1.json");
        std::fs::write(&outbox_file, "{}").unwrap();
        let id = daemon
            .ledger()
            .register_file(&outbox_file, "builder", "task", 2, None)
            .unwrap()
            .unwrap();
        assert!(matches!(
            daemon.ledger().claim_file(&id).unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        daemon.recover().await.unwrap();

        let record = daemon.ledger().get_record(&id).unwrap().unwrap();
        assert_eq!(record.status, crate::ledger::LedgerStatus::Pending);
    }

    #[tokio::test]
    async fn test_recover_fails_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(&dir);
        let daemon = RelayDaemon::new(settings, Arc::new(NoConnections))
            .await
            .unwrap();

        let id = daemon
            .ledger()
            .register_file(Path::new("/nonexistent/outbox/msg.json"), "builder", "task", 2, None)
            .unwrap()
            .unwrap();

        daemon.recover().await.unwrap();

        let record = daemon.ledger().get_record(&id).unwrap().unwrap();
        assert_eq!(record.status, crate::ledger::LedgerStatus::Failed);
    }
}
