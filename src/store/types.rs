//! Message and session types for the durable store.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Recipient wildcard meaning "every agent".
pub const BROADCAST_RECIPIENT: &str = "*";

/// Message kind classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain message between agents
    Message,
    /// Acknowledgment of a prior message
    Ack,
    /// System-generated notice
    System,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Message
    }
}

/// Message delivery status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Stored, not yet seen by the recipient
    Unread,
    /// Recipient has read the message
    Read,
    /// Recipient acknowledged delivery
    Acked,
    /// Delivery gave up
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Unread
    }
}

/// The unit of communication between agents.
///
/// The id is producer-assigned and immutable; everything else may be
/// rewritten by a later log record for the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (assigned by the producer)
    pub id: String,
    /// Creation timestamp (unix ms)
    pub timestamp: i64,
    /// Sender agent name
    pub sender: String,
    /// Recipient agent name, or `"*"` for broadcast
    pub recipient: String,
    /// Optional topic for grouping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Message kind
    #[serde(default)]
    pub kind: MessageKind,
    /// Body text
    pub body: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Thread id for reply grouping (the id of the message replied to)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Delivery sequence number within the delivery session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_seq: Option<u64>,
    /// Delivery session id identifying the connection the message was
    /// delivered through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_session: Option<String>,
    /// Current status
    #[serde(default)]
    pub status: MessageStatus,
    /// Urgent flag
    #[serde(default)]
    pub urgent: bool,
    /// Broadcast flag
    #[serde(default)]
    pub broadcast: bool,
}

impl Message {
    /// Create a new unread message with the current timestamp.
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let recipient = recipient.into();
        let broadcast = recipient == BROADCAST_RECIPIENT;
        Self {
            id: id.into(),
            timestamp: current_timestamp(),
            sender: sender.into(),
            recipient,
            topic: None,
            kind: MessageKind::Message,
            body: body.into(),
            payload: None,
            thread_id: None,
            delivery_seq: None,
            delivery_session: None,
            status: MessageStatus::Unread,
            urgent: false,
            broadcast,
        }
    }

    /// Set the topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the structured payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the thread id (reply target).
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the delivery stream position.
    pub fn with_delivery(mut self, session: impl Into<String>, seq: u64) -> Self {
        self.delivery_session = Some(session.into());
        self.delivery_seq = Some(seq);
        self
    }

    /// Mark as urgent.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }
}

/// A message annotated with its computed reply count.
#[derive(Debug, Clone, Serialize)]
pub struct MessageWithReplies {
    #[serde(flatten)]
    pub message: Message,
    /// Number of messages whose thread id equals this message's id.
    pub reply_count: usize,
}

/// Sort direction for message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Ascending
    }
}

/// Filter for `MessageStore::get_messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Only messages at or after this timestamp (unix ms)
    pub since: Option<i64>,
    /// Only messages from this sender
    pub sender: Option<String>,
    /// Only messages to this recipient
    pub recipient: Option<String>,
    /// Only messages on this topic
    pub topic: Option<String>,
    /// Only messages in this thread
    pub thread_id: Option<String>,
    /// Only unread messages
    pub unread_only: bool,
    /// Only urgent messages
    pub urgent_only: bool,
    /// Sort direction by timestamp
    pub order: SortOrder,
    /// Result cap (default 200)
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// Default result limit when none is requested.
    pub const DEFAULT_LIMIT: usize = 200;

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(since) = self.since {
            if message.timestamp < since {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if &message.recipient != recipient {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if message.topic.as_ref() != Some(topic) {
                return false;
            }
        }
        if let Some(thread_id) = &self.thread_id {
            if message.thread_id.as_ref() != Some(thread_id) {
                return false;
            }
        }
        if self.unread_only && message.status != MessageStatus::Unread {
            return false;
        }
        if self.urgent_only && !message.urgent {
            return false;
        }
        true
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionCloseReason {
    /// The agent closed its own session
    Agent,
    /// The connection dropped
    Disconnect,
    /// An error tore the session down
    Error,
}

/// One continuous period an agent is attached to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session ID
    pub id: String,
    /// Owning agent name
    pub agent: String,
    /// CLI identifier of the attached process, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_id: Option<String>,
    /// Project id, if the agent declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Project root path, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    /// Start timestamp (unix ms)
    pub started_at: i64,
    /// End timestamp; absent while the session is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Messages relayed during this session
    #[serde(default)]
    pub message_count: u64,
    /// Summary recorded at session end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Resume token uniquely identifying this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Why the session ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<SessionCloseReason>,
}

impl Session {
    /// Create a new active session with a generated id.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            agent: agent.into(),
            cli_id: None,
            project_id: None,
            project_root: None,
            started_at: current_timestamp(),
            ended_at: None,
            message_count: 0,
            summary: None,
            resume_token: None,
            close_reason: None,
        }
    }

    /// Set the CLI identifier.
    pub fn with_cli_id(mut self, cli_id: impl Into<String>) -> Self {
        self.cli_id = Some(cli_id.into());
        self
    }

    /// Set the project association.
    pub fn with_project(
        mut self,
        project_id: impl Into<String>,
        project_root: impl Into<String>,
    ) -> Self {
        self.project_id = Some(project_id.into());
        self.project_root = Some(project_root.into());
        self
    }

    /// Set the resume token.
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    /// Whether the session is still active.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Result of a store health probe.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// Whether storage survives restarts
    pub persistent: bool,
    /// Backing driver name
    pub driver: &'static str,
    pub can_read: bool,
    pub can_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
