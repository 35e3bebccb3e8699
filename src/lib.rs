//! Courier library root.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod store;
pub mod tracker;

pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use daemon::RelayDaemon;
pub use error::{Error, Result};
pub use ledger::{
    is_reserved_agent_name, ClaimOutcome, ClaimRejection, LedgerRecord, LedgerStats,
    LedgerStatus, ReconcileReport, RelayLedger,
};
pub use store::{
    Message, MessageKind, MessageQuery, MessageStatus, MessageStore, MessageWithReplies,
    Session, SessionCloseReason, SortOrder, StoreHealth,
};
pub use tracker::{
    ConnectionHandle, ConnectionRegistry, DeliveryTracker, Envelope, TrackerConfig,
};
