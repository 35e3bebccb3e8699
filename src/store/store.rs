//! Durable, crash-recoverable message store.
//!
//! The append-only logs under the storage root are ground truth; the
//! in-memory index is a disposable cache rebuilt by replaying them on open
//! (or on demand via `reload`). No database engine is involved, so the
//! files stay human-inspectable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::store::log::{
    day_file_name, parse_day_file_name, replay_message_events, replay_session_events, LogWriter,
    MessageEvent, SessionEvent, MESSAGES_DIR, SESSIONS_FILE,
};
use crate::store::types::{
    current_timestamp, Message, MessageQuery, MessageStatus, MessageWithReplies, Session,
    SessionCloseReason, SortOrder, StoreHealth,
};

/// In-memory projection of the logs.
#[derive(Debug, Default)]
struct StoreIndex {
    messages: HashMap<String, Message>,
    sessions: HashMap<String, Session>,
    /// resume token -> session id
    resume_tokens: HashMap<String, String>,
}

impl StoreIndex {
    fn apply_message_event(&mut self, event: MessageEvent) {
        match event {
            MessageEvent::Message { message } => {
                // Last write wins for mutable fields.
                self.messages.insert(message.id.clone(), message);
            }
            MessageEvent::Status { id, status, .. } => {
                if let Some(message) = self.messages.get_mut(&id) {
                    message.status = status;
                }
            }
            MessageEvent::Delete { id, .. } => {
                self.messages.remove(&id);
            }
        }
    }

    fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SessionStart { session } => {
                if let Some(token) = &session.resume_token {
                    self.resume_tokens.insert(token.clone(), session.id.clone());
                }
                self.sessions.insert(session.id.clone(), session);
            }
            SessionEvent::SessionEnd {
                id,
                ended_at,
                summary,
                close_reason,
            } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    if session.ended_at.is_none() {
                        session.ended_at = Some(ended_at);
                    }
                    if summary.is_some() {
                        session.summary = summary;
                    }
                    if close_reason.is_some() {
                        session.close_reason = close_reason;
                    }
                }
            }
            SessionEvent::SessionIncrement { id } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.message_count += 1;
                }
            }
        }
    }
}

/// Keeps the filesystem watcher alive for live reload.
pub struct StoreWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Event-sourced store for messages and agent sessions.
#[derive(Clone)]
pub struct MessageStore {
    root: PathBuf,
    messages_dir: PathBuf,
    sessions_path: PathBuf,
    retention_days: u32,
    index: Arc<Mutex<StoreIndex>>,
    message_writer: LogWriter,
    session_writer: LogWriter,
    /// Keeps the index apply order identical to the log append order.
    /// Without it, two racing writes for the same id could land in the
    /// index in the opposite order from the log until the next reload.
    message_ops: Arc<tokio::sync::Mutex<()>>,
    /// Serializes session mutations relative to each other. `remove_agent`
    /// rewrites the whole session log, so nothing may append mid-rewrite.
    session_ops: Arc<tokio::sync::Mutex<()>>,
}

impl MessageStore {
    /// Open a store rooted at `root`, rebuilding the index from the logs.
    pub async fn open(root: impl Into<PathBuf>, retention_days: u32) -> Result<Self> {
        let root = root.into();
        let messages_dir = root.join(MESSAGES_DIR);
        let sessions_path = root.join(SESSIONS_FILE);

        tokio::fs::create_dir_all(&messages_dir).await?;

        let store = Self {
            root,
            messages_dir,
            sessions_path,
            retention_days,
            index: Arc::new(Mutex::new(StoreIndex::default())),
            message_writer: LogWriter::spawn(),
            session_writer: LogWriter::spawn(),
            message_ops: Arc::new(tokio::sync::Mutex::new(())),
            session_ops: Arc::new(tokio::sync::Mutex::new(())),
        };

        store.reload().await?;
        Ok(store)
    }

    /// Discard the index and rebuild it from the logs.
    pub async fn reload(&self) -> Result<()> {
        let message_events = replay_message_events(&self.messages_dir).await?;
        let session_events = replay_session_events(&self.sessions_path).await?;

        let mut fresh = StoreIndex::default();
        for event in message_events {
            fresh.apply_message_event(event);
        }
        for event in session_events {
            fresh.apply_session_event(event);
        }

        tracing::debug!(
            "Store index rebuilt: {} messages, {} sessions",
            fresh.messages.len(),
            fresh.sessions.len()
        );

        *self.index.lock().unwrap() = fresh;
        Ok(())
    }

    /// Watch the storage root and reload the index when the logs change on
    /// disk. The returned guard must be kept alive.
    pub fn spawn_watcher(&self) -> Result<StoreWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })
        .map_err(|e| Error::Store(format!("watcher init: {}", e)))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| Error::Store(format!("watch {}: {}", self.root.display(), e)))?;

        let store = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Debounce a burst of change events into one reload.
                tokio::time::sleep(Duration::from_millis(500)).await;
                while rx.try_recv().is_ok() {}

                if let Err(e) = store.reload().await {
                    tracing::warn!("Store reload after file change failed: {}", e);
                }
            }
        });

        Ok(StoreWatcher { _watcher: watcher })
    }

    /// Append a message record and apply it to the index. A later record
    /// for an existing id is treated as an update.
    pub async fn save_message(&self, message: Message) -> Result<()> {
        let _guard = self.message_ops.lock().await;

        let event = MessageEvent::Message {
            message: message.clone(),
        };
        let line = serde_json::to_string(&event)?;
        let path = self.messages_dir.join(day_file_name(message.timestamp));
        self.message_writer.append(path, line).await?;

        self.index.lock().unwrap().apply_message_event(event);
        Ok(())
    }

    /// Query messages, each annotated with its reply count.
    pub fn get_messages(&self, query: &MessageQuery) -> Vec<MessageWithReplies> {
        let index = self.index.lock().unwrap();

        let mut reply_counts: HashMap<&str, usize> = HashMap::new();
        for message in index.messages.values() {
            if let Some(thread_id) = &message.thread_id {
                *reply_counts.entry(thread_id.as_str()).or_default() += 1;
            }
        }

        let mut hits: Vec<MessageWithReplies> = index
            .messages
            .values()
            .filter(|m| query.matches(m))
            .map(|m| MessageWithReplies {
                reply_count: reply_counts.get(m.id.as_str()).copied().unwrap_or(0),
                message: m.clone(),
            })
            .collect();

        match query.order {
            SortOrder::Ascending => hits.sort_by(|a, b| {
                a.message
                    .timestamp
                    .cmp(&b.message.timestamp)
                    .then_with(|| a.message.id.cmp(&b.message.id))
            }),
            SortOrder::Descending => hits.sort_by(|a, b| {
                b.message
                    .timestamp
                    .cmp(&a.message.timestamp)
                    .then_with(|| b.message.id.cmp(&a.message.id))
            }),
        }

        hits.truncate(query.limit.unwrap_or(MessageQuery::DEFAULT_LIMIT));
        hits
    }

    /// Exact id match first, then prefix match returning the most recent
    /// hit, so short ids from logs and CLIs resolve.
    pub fn get_message_by_id(&self, id: &str) -> Option<Message> {
        let index = self.index.lock().unwrap();

        if let Some(message) = index.messages.get(id) {
            return Some(message.clone());
        }

        index
            .messages
            .values()
            .filter(|m| m.id.starts_with(id))
            .max_by_key(|m| m.timestamp)
            .cloned()
    }

    /// Append a status-change event and apply it in place. Returns false
    /// when no message with that id exists.
    pub async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<bool> {
        let _guard = self.message_ops.lock().await;

        let exists = self.index.lock().unwrap().messages.contains_key(id);
        if !exists {
            return Ok(false);
        }

        let event = MessageEvent::Status {
            id: id.to_string(),
            status,
            ts: current_timestamp(),
        };
        let line = serde_json::to_string(&event)?;
        let path = self.messages_dir.join(day_file_name(current_timestamp()));
        self.message_writer.append(path, line).await?;

        self.index.lock().unwrap().apply_message_event(event);
        Ok(true)
    }

    /// Tombstone every message where the agent is sender or recipient.
    /// Returns the number of messages removed.
    pub async fn remove_messages_for_agent(&self, agent: &str) -> Result<usize> {
        let _guard = self.message_ops.lock().await;

        let ids: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .messages
                .values()
                .filter(|m| m.sender == agent || m.recipient == agent)
                .map(|m| m.id.clone())
                .collect()
        };

        let now = current_timestamp();
        let path = self.messages_dir.join(day_file_name(now));
        for id in &ids {
            let event = MessageEvent::Delete {
                id: id.clone(),
                ts: now,
            };
            let line = serde_json::to_string(&event)?;
            self.message_writer.append(path.clone(), line).await?;
            self.index.lock().unwrap().apply_message_event(event);
        }

        Ok(ids.len())
    }

    /// Messages delivered through the given session that the consumer has
    /// not acknowledged yet, ordered by delivery sequence then timestamp.
    pub fn get_pending_messages_for_session(&self, agent: &str, session_id: &str) -> Vec<Message> {
        let index = self.index.lock().unwrap();

        let mut pending: Vec<Message> = index
            .messages
            .values()
            .filter(|m| {
                m.recipient == agent
                    && m.delivery_session.as_deref() == Some(session_id)
                    && m.status != MessageStatus::Acked
            })
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            a.delivery_seq
                .cmp(&b.delivery_seq)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        pending
    }

    /// Highest delivery sequence seen per (sender, topic) stream within a
    /// delivery session. A reconnecting consumer asks only for what it is
    /// missing past these marks.
    pub fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: &str,
    ) -> HashMap<(String, String), u64> {
        let index = self.index.lock().unwrap();
        let mut max_seqs: HashMap<(String, String), u64> = HashMap::new();

        for message in index.messages.values() {
            if message.recipient != agent
                || message.delivery_session.as_deref() != Some(session_id)
            {
                continue;
            }
            let Some(seq) = message.delivery_seq else {
                continue;
            };
            let key = (
                message.sender.clone(),
                message.topic.clone().unwrap_or_default(),
            );
            let entry = max_seqs.entry(key).or_insert(seq);
            if seq > *entry {
                *entry = seq;
            }
        }

        max_seqs
    }

    /// Record a new session.
    pub async fn start_session(&self, session: Session) -> Result<Session> {
        let _guard = self.session_ops.lock().await;

        let event = SessionEvent::SessionStart {
            session: session.clone(),
        };
        let line = serde_json::to_string(&event)?;
        self.session_writer
            .append(self.sessions_path.clone(), line)
            .await?;

        self.index.lock().unwrap().apply_session_event(event);
        Ok(session)
    }

    /// End a session. Re-applying with the same values is a no-op on the
    /// projected state. Returns false when the session is unknown.
    pub async fn end_session(
        &self,
        id: &str,
        summary: Option<String>,
        close_reason: Option<SessionCloseReason>,
    ) -> Result<bool> {
        let _guard = self.session_ops.lock().await;

        let ended_at = {
            let index = self.index.lock().unwrap();
            match index.sessions.get(id) {
                Some(session) => session.ended_at.unwrap_or_else(current_timestamp),
                None => return Ok(false),
            }
        };

        let event = SessionEvent::SessionEnd {
            id: id.to_string(),
            ended_at,
            summary,
            close_reason,
        };
        let line = serde_json::to_string(&event)?;
        self.session_writer
            .append(self.sessions_path.clone(), line)
            .await?;

        self.index.lock().unwrap().apply_session_event(event);
        Ok(true)
    }

    /// Bump a session's relayed-message counter.
    pub async fn increment_session_message_count(&self, id: &str) -> Result<bool> {
        let _guard = self.session_ops.lock().await;

        if !self.index.lock().unwrap().sessions.contains_key(id) {
            return Ok(false);
        }

        let event = SessionEvent::SessionIncrement { id: id.to_string() };
        let line = serde_json::to_string(&event)?;
        self.session_writer
            .append(self.sessions_path.clone(), line)
            .await?;

        self.index.lock().unwrap().apply_session_event(event);
        Ok(true)
    }

    /// Sessions, newest first, optionally filtered by agent.
    pub fn get_sessions(&self, agent: Option<&str>) -> Vec<Session> {
        let index = self.index.lock().unwrap();
        let mut sessions: Vec<Session> = index
            .sessions
            .values()
            .filter(|s| agent.map_or(true, |a| s.agent == a))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    /// Look a session up by its resume token.
    pub fn get_session_by_resume_token(&self, token: &str) -> Option<Session> {
        let index = self.index.lock().unwrap();
        let id = index.resume_tokens.get(token)?;
        index.sessions.get(id).cloned()
    }

    /// Drop every session owned by the agent and compact the session log
    /// to the surviving state. Returns the number of sessions removed.
    pub async fn remove_agent(&self, agent: &str) -> Result<usize> {
        let _guard = self.session_ops.lock().await;

        let (removed, remaining) = {
            let mut index = self.index.lock().unwrap();
            let doomed: Vec<String> = index
                .sessions
                .values()
                .filter(|s| s.agent == agent)
                .map(|s| s.id.clone())
                .collect();

            for id in &doomed {
                if let Some(session) = index.sessions.remove(id) {
                    if let Some(token) = &session.resume_token {
                        index.resume_tokens.remove(token);
                    }
                }
            }

            let mut remaining: Vec<Session> = index.sessions.values().cloned().collect();
            remaining.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            (doomed.len(), remaining)
        };

        // Compact: one start event per surviving session carries its full
        // current state, so replay reproduces the index exactly.
        let mut contents = String::new();
        for session in remaining {
            let event = SessionEvent::SessionStart { session };
            contents.push_str(&serde_json::to_string(&event)?);
            contents.push('\n');
        }
        self.session_writer
            .rewrite(self.sessions_path.clone(), contents)
            .await?;

        Ok(removed)
    }

    /// Delete day files entirely past the retention window, then tombstone
    /// any remaining indexed messages older than the cutoff. Day-file
    /// granularity means a message can outlive the nominal window by up to
    /// 24h inside the boundary file; that coarse trade-off is intentional.
    /// Returns total records affected.
    pub async fn cleanup_expired_messages(&self) -> Result<usize> {
        let _guard = self.message_ops.lock().await;

        let cutoff_ms =
            current_timestamp() - (self.retention_days as i64) * 24 * 60 * 60 * 1000;
        let cutoff_day = day_file_name(cutoff_ms);
        let mut affected = 0usize;

        let mut entries = tokio::fs::read_dir(&self.messages_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if parse_day_file_name(&name).is_none() || name.as_str() >= cutoff_day.as_str() {
                continue;
            }

            let path = self.messages_dir.join(&name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    affected += content.lines().filter(|l| !l.trim().is_empty()).count();
                }
                Err(e) => {
                    tracing::warn!("Could not count records in {}: {}", path.display(), e);
                }
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                // A cleanup hiccup must not halt the relay.
                tracing::warn!("Could not delete expired log {}: {}", path.display(), e);
            } else {
                tracing::info!("Deleted expired message log {}", name);
            }
        }

        let expired_ids: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .messages
                .values()
                .filter(|m| m.timestamp < cutoff_ms)
                .map(|m| m.id.clone())
                .collect()
        };

        let now = current_timestamp();
        let tombstone_path = self.messages_dir.join(day_file_name(now));
        for id in &expired_ids {
            let event = MessageEvent::Delete {
                id: id.clone(),
                ts: now,
            };
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = self.message_writer.append(tombstone_path.clone(), line).await
                    {
                        tracing::warn!("Could not persist tombstone for {}: {}", id, e);
                    }
                }
                Err(e) => tracing::warn!("Could not encode tombstone for {}: {}", id, e),
            }
            self.index.lock().unwrap().apply_message_event(event);
        }
        affected += expired_ids.len();

        Ok(affected)
    }

    /// Non-destructive probe of the storage directory.
    pub async fn health_check(&self) -> StoreHealth {
        let mut health = StoreHealth {
            persistent: true,
            driver: "jsonl",
            can_read: false,
            can_write: false,
            error: None,
        };

        match tokio::fs::read_dir(&self.messages_dir).await {
            Ok(_) => health.can_read = true,
            Err(e) => {
                health.error = Some(format!("read probe: {}", e));
                return health;
            }
        }

        let probe_path = self.root.join(".health");
        let token = ulid::Ulid::new().to_string();
        let write_result = async {
            tokio::fs::write(&probe_path, &token).await?;
            let read_back = tokio::fs::read_to_string(&probe_path).await?;
            let _ = tokio::fs::remove_file(&probe_path).await;
            Ok::<bool, std::io::Error>(read_back == token)
        }
        .await;

        match write_result {
            Ok(true) => health.can_write = true,
            Ok(false) => health.error = Some("write probe read back a mismatch".to_string()),
            Err(e) => health.error = Some(format!("write probe: {}", e)),
        }

        health
    }

    /// Number of messages currently in the index.
    pub fn message_count(&self) -> usize {
        self.index.lock().unwrap().messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &tempfile::TempDir) -> MessageStore {
        MessageStore::open(dir.path(), 30).await.unwrap()
    }

    #[tokio::test]
    async fn test_durability_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir).await;
            let msg = Message::new("m-1", "planner", "builder", "survive me")
                .with_topic("durability");
            store.save_message(msg).await.unwrap();
        }

        let reopened = open_store(&dir).await;
        let msg = reopened.get_message_by_id("m-1").unwrap();
        assert_eq!(msg.body, "survive me");
        assert_eq!(msg.status, MessageStatus::Unread);
        assert_eq!(msg.topic, Some("durability".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_message(Message::new("m-1", "planner", "builder", "first"))
            .await
            .unwrap();
        store
            .save_message(Message::new("m-1", "planner", "builder", "second"))
            .await
            .unwrap();

        assert_eq!(store.message_count(), 1);
        assert_eq!(store.get_message_by_id("m-1").unwrap().body, "second");
    }

    #[tokio::test]
    async fn test_status_update_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir).await;
            store
                .save_message(Message::new("m-1", "planner", "builder", "read me"))
                .await
                .unwrap();
            assert!(store
                .update_message_status("m-1", MessageStatus::Read)
                .await
                .unwrap());
            assert!(!store
                .update_message_status("nope", MessageStatus::Read)
                .await
                .unwrap());
        }

        let reopened = open_store(&dir).await;
        assert_eq!(
            reopened.get_message_by_id("m-1").unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn test_reply_counting() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_message(Message::new("a", "planner", "builder", "root"))
            .await
            .unwrap();
        store
            .save_message(Message::new("b", "builder", "planner", "reply").with_thread("a"))
            .await
            .unwrap();

        let query = MessageQuery {
            recipient: Some("builder".to_string()),
            ..Default::default()
        };
        let hits = store.get_messages(&query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.id, "a");
        assert_eq!(hits[0].reply_count, 1);
    }

    #[tokio::test]
    async fn test_query_filters_sort_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        for i in 0..5 {
            let mut msg = Message::new(format!("m-{}", i), "planner", "builder", "work");
            msg.timestamp = 1000 + i as i64;
            if i == 3 {
                msg.urgent = true;
            }
            store.save_message(msg).await.unwrap();
        }

        let query = MessageQuery {
            order: SortOrder::Descending,
            limit: Some(2),
            ..Default::default()
        };
        let hits = store.get_messages(&query);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message.id, "m-4");

        let query = MessageQuery {
            urgent_only: true,
            ..Default::default()
        };
        let hits = store.get_messages(&query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.id, "m-3");

        let query = MessageQuery {
            since: Some(1003),
            ..Default::default()
        };
        assert_eq!(store.get_messages(&query).len(), 2);
    }

    #[tokio::test]
    async fn test_short_id_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut older = Message::new("abc-old", "planner", "builder", "older");
        older.timestamp = 1000;
        let mut newer = Message::new("abc-new", "planner", "builder", "newer");
        newer.timestamp = 2000;
        store.save_message(older).await.unwrap();
        store.save_message(newer).await.unwrap();

        // Exact match wins over prefix.
        assert_eq!(store.get_message_by_id("abc-old").unwrap().body, "older");
        // Prefix match returns the most recent.
        assert_eq!(store.get_message_by_id("abc").unwrap().body, "newer");
        assert!(store.get_message_by_id("zzz").is_none());
    }

    #[tokio::test]
    async fn test_remove_messages_for_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_message(Message::new("m-1", "retired", "builder", "from"))
            .await
            .unwrap();
        store
            .save_message(Message::new("m-2", "planner", "retired", "to"))
            .await
            .unwrap();
        store
            .save_message(Message::new("m-3", "planner", "builder", "unrelated"))
            .await
            .unwrap();

        let removed = store.remove_messages_for_agent("retired").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.message_count(), 1);

        // Tombstones replay: the deletion is durable.
        let reopened = open_store(&dir).await;
        assert_eq!(reopened.message_count(), 1);
        assert!(reopened.get_message_by_id("m-3").is_some());
    }

    #[tokio::test]
    async fn test_pending_messages_and_max_seq() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_message(
                Message::new("m-1", "planner", "builder", "one").with_delivery("sess-1", 1),
            )
            .await
            .unwrap();
        store
            .save_message(
                Message::new("m-2", "planner", "builder", "two").with_delivery("sess-1", 2),
            )
            .await
            .unwrap();
        store
            .save_message(
                Message::new("m-3", "reviewer", "builder", "other stream")
                    .with_topic("review")
                    .with_delivery("sess-1", 7),
            )
            .await
            .unwrap();
        store
            .save_message(
                Message::new("m-4", "planner", "builder", "elsewhere").with_delivery("sess-2", 9),
            )
            .await
            .unwrap();

        store
            .update_message_status("m-1", MessageStatus::Acked)
            .await
            .unwrap();

        let pending = store.get_pending_messages_for_session("builder", "sess-1");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "m-2");
        assert_eq!(pending[1].id, "m-3");

        let max_seqs = store.get_max_seq_by_stream("builder", "sess-1");
        assert_eq!(
            max_seqs.get(&("planner".to_string(), String::new())),
            Some(&2)
        );
        assert_eq!(
            max_seqs.get(&("reviewer".to_string(), "review".to_string())),
            Some(&7)
        );
        // The sess-2 delivery does not leak into the sess-1 map.
        assert_eq!(max_seqs.len(), 2);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let session = Session::new("builder").with_resume_token("tok-1");
        let id = session.id.clone();
        store.start_session(session).await.unwrap();

        assert!(store
            .increment_session_message_count(&id)
            .await
            .unwrap());
        assert!(store
            .increment_session_message_count(&id)
            .await
            .unwrap());

        assert!(store
            .end_session(
                &id,
                Some("done".to_string()),
                Some(SessionCloseReason::Agent)
            )
            .await
            .unwrap());

        let found = store.get_session_by_resume_token("tok-1").unwrap();
        assert_eq!(found.message_count, 2);
        assert_eq!(found.summary, Some("done".to_string()));
        assert!(!found.is_active());
        let first_ended_at = found.ended_at;

        // Idempotent re-apply keeps the original end time.
        assert!(store
            .end_session(
                &id,
                Some("done".to_string()),
                Some(SessionCloseReason::Agent)
            )
            .await
            .unwrap());
        let again = store.get_session_by_resume_token("tok-1").unwrap();
        assert_eq!(again.ended_at, first_ended_at);

        // Everything replays from the log.
        let reopened = open_store(&dir).await;
        let replayed = reopened.get_session_by_resume_token("tok-1").unwrap();
        assert_eq!(replayed.message_count, 2);
        assert_eq!(replayed.close_reason, Some(SessionCloseReason::Agent));
    }

    #[tokio::test]
    async fn test_remove_agent_compacts_session_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .start_session(Session::new("doomed").with_resume_token("tok-d"))
            .await
            .unwrap();
        store
            .start_session(Session::new("doomed"))
            .await
            .unwrap();
        store
            .start_session(Session::new("keeper").with_resume_token("tok-k"))
            .await
            .unwrap();

        let removed = store.remove_agent("doomed").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_session_by_resume_token("tok-d").is_none());
        assert!(store.get_session_by_resume_token("tok-k").is_some());

        let reopened = open_store(&dir).await;
        assert_eq!(reopened.get_sessions(None).len(), 1);
        assert!(reopened.get_session_by_resume_token("tok-k").is_some());
    }

    #[tokio::test]
    async fn test_retention_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path(), 7).await.unwrap();

        let mut old = Message::new("m-old", "planner", "builder", "ancient");
        old.timestamp = current_timestamp() - 30 * 24 * 60 * 60 * 1000;
        store.save_message(old).await.unwrap();
        store
            .save_message(Message::new("m-new", "planner", "builder", "fresh"))
            .await
            .unwrap();

        let affected = store.cleanup_expired_messages().await.unwrap();
        assert!(affected >= 1);

        let hits = store.get_messages(&MessageQuery::default());
        let ids: Vec<&str> = hits.iter().map(|h| h.message.id.as_str()).collect();
        assert!(!ids.contains(&"m-old"));
        assert!(ids.contains(&"m-new"));

        // The old day file itself is gone.
        let reopened = MessageStore::open(dir.path(), 7).await.unwrap();
        assert!(reopened.get_message_by_id("m-old").is_none());
        assert!(reopened.get_message_by_id("m-new").is_some());
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let health = store.health_check().await;
        assert!(health.persistent);
        assert_eq!(health.driver, "jsonl");
        assert!(health.can_read);
        assert!(health.can_write);
        assert!(health.error.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_saves_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save_message(Message::new(
                        format!("m-{}", i),
                        "planner",
                        "builder",
                        "burst",
                    ))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every line must parse back cleanly after a full reopen.
        let reopened = open_store(&dir).await;
        assert_eq!(reopened.message_count(), 50);
    }

    #[tokio::test]
    async fn test_same_id_races_keep_index_and_log_agreed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut msg =
                    Message::new("m-1", "planner", "builder", format!("rev-{}", i));
                msg.timestamp = 1000;
                store.save_message(msg).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Whatever interleaving won, the index must agree with a replay.
        let in_memory = store.get_message_by_id("m-1").unwrap().body;
        let reopened = open_store(&dir).await;
        assert_eq!(reopened.get_message_by_id("m-1").unwrap().body, in_memory);
    }

    #[tokio::test]
    async fn test_watcher_reloads_after_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let _watcher = store.spawn_watcher().unwrap();

        // Another process appends directly to today's log.
        let msg = Message::new("m-ext", "planner", "builder", "external");
        let event = MessageEvent::Message {
            message: msg.clone(),
        };
        let path = dir
            .path()
            .join(MESSAGES_DIR)
            .join(day_file_name(msg.timestamp));
        std::fs::write(
            &path,
            format!("{}\n", serde_json::to_string(&event).unwrap()),
        )
        .unwrap();

        // Debounce window is 500ms; leave headroom for event delivery.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.get_message_by_id("m-ext").is_some());
    }
}
