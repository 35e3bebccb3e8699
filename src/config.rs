//! Configuration loading for Courier.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the Courier home directory (~/.courier).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".courier"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.courier/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.ledger.max_retries == 0 {
        return Err(Error::Config(
            "ledger.max_retries must be at least 1".to_string(),
        ));
    }
    if settings.delivery.max_attempts == 0 {
        return Err(Error::Config(
            "delivery.max_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Storage configuration for the durable message store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StorageConfig {
    /// Root directory for message and session logs. Defaults to
    /// ~/.courier/storage when absent.
    pub root: Option<PathBuf>,
    /// Days a message is retained before cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Reload the in-memory index when another process writes to the logs.
    #[serde(default)]
    pub watch_external_writes: bool,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            retention_days: default_retention_days(),
            watch_external_writes: false,
        }
    }
}

impl StorageConfig {
    /// Resolve the storage root, falling back to ~/.courier/storage.
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("storage")),
        }
    }
}

/// Relay ledger configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LedgerConfig {
    /// Path to the ledger database. Defaults to ~/.courier/ledger.db.
    pub db_path: Option<PathBuf>,
    /// Maximum claim attempts before a record goes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Days an archived record is retained before its row is purged.
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_archive_retention_days() -> u32 {
    7
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_retries: default_max_retries(),
            archive_retention_days: default_archive_retention_days(),
        }
    }
}

impl LedgerConfig {
    /// Resolve the database path, falling back to ~/.courier/ledger.db.
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("ledger.db")),
        }
    }
}

/// Delivery tracker configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeliveryConfig {
    /// Seconds to wait for an acknowledgment before re-sending.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Maximum send attempts per message.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds a delivery may stay pending before it is dropped.
    #[serde(default = "default_delivery_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delivery_ttl_secs() -> u64 {
    300
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            max_attempts: default_max_attempts(),
            ttl_secs: default_delivery_ttl_secs(),
        }
    }
}

/// Monitoring / maintenance configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Monitoring {
    /// Seconds between periodic cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Courier settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub monitoring: Monitoring,
}
