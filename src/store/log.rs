//! Append-only event logs backing the message store.
//!
//! Layout under the storage root:
//! - messages/YYYY-MM-DD : one JSONL file per UTC calendar day
//! - sessions            : a single JSONL file of session events
//!
//! Every line is a closed, tagged event variant. The logs are the sole
//! source of truth; the in-memory index is rebuilt by replaying them.

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::store::types::{Message, MessageStatus, Session, SessionCloseReason};

/// Directory holding per-day message logs.
pub const MESSAGES_DIR: &str = "messages";

/// Session log file name.
pub const SESSIONS_FILE: &str = "sessions";

/// One line of a per-day message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageEvent {
    /// A full message record; a repeat id is an update
    Message { message: Message },
    /// A status change applied to an existing message
    Status {
        id: String,
        status: MessageStatus,
        ts: i64,
    },
    /// A tombstone removing the message from the index
    Delete { id: String, ts: i64 },
}

/// One line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    SessionStart { session: Session },
    SessionEnd {
        id: String,
        ended_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_reason: Option<SessionCloseReason>,
    },
    SessionIncrement { id: String },
}

/// File name of the day log a timestamp belongs to (UTC).
pub fn day_file_name(timestamp_ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d").to_string()
}

/// Parse a day-log file name back into its date. Non-day files (temp files,
/// editor droppings) are ignored by returning None.
pub fn parse_day_file_name(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()
}

enum WriteRequest {
    Append {
        path: PathBuf,
        line: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Rewrite {
        path: PathBuf,
        contents: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Single-consumer write chain for one durable resource.
///
/// All appends are funneled through one task so two logically concurrent
/// writers can never interleave partial lines in the same file. A failed
/// write rejects only its own caller; the chain keeps accepting work.
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl LogWriter {
    /// Spawn the writer task.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WriteRequest::Append { path, line, reply } => {
                        let result = append_line(&path, &line).await;
                        if let Err(e) = &result {
                            tracing::warn!("Log append to {} failed: {}", path.display(), e);
                        }
                        let _ = reply.send(result);
                    }
                    WriteRequest::Rewrite {
                        path,
                        contents,
                        reply,
                    } => {
                        let result = rewrite_file(&path, &contents).await;
                        if let Err(e) = &result {
                            tracing::warn!("Log rewrite of {} failed: {}", path.display(), e);
                        }
                        let _ = reply.send(result);
                    }
                }
            }
        });

        Self { tx }
    }

    /// Append one line, waiting for the write to land.
    pub async fn append(&self, path: PathBuf, line: String) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::Append { path, line, reply })
            .map_err(|_| Error::Store("log writer task is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("log writer dropped the request".to_string()))?
    }

    /// Replace the whole file in one step. Runs inside the writer task so
    /// no append can interleave with the rewrite.
    pub async fn rewrite(&self, path: PathBuf, contents: String) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::Rewrite {
                path,
                contents,
                reply,
            })
            .map_err(|_| Error::Store("log writer task is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("log writer dropped the request".to_string()))?
    }
}

async fn append_line(path: &Path, line: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

async fn rewrite_file(path: &Path, contents: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Read every message event from the per-day logs, in chronological order
/// (day files sorted by name, lines in file order). Unparseable lines are
/// skipped with a warning so one corrupt record cannot block recovery.
pub async fn replay_message_events(messages_dir: &Path) -> Result<Vec<MessageEvent>, Error> {
    let mut day_files: Vec<String> = Vec::new();

    if messages_dir.exists() {
        let mut entries = tokio::fs::read_dir(messages_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if parse_day_file_name(name).is_some() {
                    day_files.push(name.to_string());
                }
            }
        }
    }
    day_files.sort();

    let mut events = Vec::new();
    for name in day_files {
        let path = messages_dir.join(&name);
        let content = tokio::fs::read_to_string(&path).await?;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!("Skipping corrupt line in {}: {}", path.display(), e);
                }
            }
        }
    }

    Ok(events)
}

/// Read every session event from the session log, in order.
pub async fn replay_session_events(sessions_path: &Path) -> Result<Vec<SessionEvent>, Error> {
    let mut events = Vec::new();

    if !sessions_path.exists() {
        return Ok(events);
    }

    let content = tokio::fs::read_to_string(sessions_path).await?;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(
                    "Skipping corrupt line in {}: {}",
                    sessions_path.display(),
                    e
                );
            }
        }
    }

    Ok(events)
}
