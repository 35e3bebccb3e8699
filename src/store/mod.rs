//! Durable, event-sourced storage for messages and agent sessions.

pub mod log;
#[allow(clippy::module_inception)]
pub mod store;
pub mod types;

pub use log::{MessageEvent, SessionEvent};
pub use store::{MessageStore, StoreWatcher};
pub use types::{
    Message, MessageKind, MessageQuery, MessageStatus, MessageWithReplies, Session,
    SessionCloseReason, SortOrder, StoreHealth, BROADCAST_RECIPIENT,
};
