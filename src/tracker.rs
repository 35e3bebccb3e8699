//! At-least-once delivery tracking for socket-connected agents.
//!
//! Each tracked message gets an in-memory pending entry and a retry task.
//! The entry lives only between first send and acknowledgment, connection
//! loss, attempt exhaustion, or TTL expiry; the terminal outcome is
//! projected onto the message's status in the durable store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::store::{MessageStatus, MessageStore};

/// A framed outgoing message plus delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Id of the message being delivered
    pub message_id: String,
    /// Recipient agent name
    pub recipient: String,
    /// The framed wire payload, opaque to the tracker
    pub frame: serde_json::Value,
    /// Send timestamp (unix ms)
    pub timestamp: i64,
}

/// A live connection as the transport layer exposes it.
pub trait ConnectionHandle: Send + Sync {
    fn id(&self) -> &str;
    /// Attempt to send the envelope; false means the write was refused.
    fn send(&self, envelope: &Envelope) -> bool;
}

/// Resolves connection ids back to handles, so retries notice teardown.
pub trait ConnectionRegistry: Send + Sync {
    fn resolve(&self, connection_id: &str) -> Option<Arc<dyn ConnectionHandle>>;
}

/// Tuning for the retry loop.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Wait between send attempts. Constant, not exponential: the dominant
    /// failure mode is a slow consumer, not network congestion.
    pub ack_timeout: Duration,
    /// Send attempts before giving up
    pub max_attempts: u32,
    /// Wall-clock budget from first send
    pub ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_attempts: 3,
            ttl: Duration::from_secs(300),
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

struct PendingDelivery {
    envelope: Envelope,
    connection_id: String,
    attempts: u32,
    first_sent_at: i64,
    retry: AbortHandle,
}

/// Tracks socket deliveries awaiting acknowledgment and drives retries.
pub struct DeliveryTracker {
    config: TrackerConfig,
    registry: Arc<dyn ConnectionRegistry>,
    store: MessageStore,
    pending: Arc<Mutex<HashMap<String, PendingDelivery>>>,
}

impl DeliveryTracker {
    pub fn new(
        config: TrackerConfig,
        registry: Arc<dyn ConnectionRegistry>,
        store: MessageStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register a pending delivery for a message just sent on `connection`
    /// and schedule its retry timer.
    pub fn track(self: &Arc<Self>, connection: &dyn ConnectionHandle, envelope: Envelope) {
        let message_id = envelope.message_id.clone();
        let connection_id = connection.id().to_string();

        let tracker = Arc::clone(self);
        let retry_key = message_id.clone();
        let retry = tokio::spawn(async move {
            tracker.retry_loop(retry_key).await;
        })
        .abort_handle();

        let delivery = PendingDelivery {
            envelope,
            connection_id,
            attempts: 1,
            first_sent_at: now_ms(),
            retry,
        };

        let mut pending = self.pending.lock().unwrap();
        // A re-track of the same message supersedes the old timer.
        if let Some(old) = pending.insert(message_id.clone(), delivery) {
            old.retry.abort();
        }
        tracing::debug!("Tracking delivery of {} ({} pending)", message_id, pending.len());
    }

    /// Handle an acknowledgment. Only an ack arriving on the connection the
    /// message was delivered through clears the entry; a reconnecting agent
    /// on a new connection must not confirm a delivery meant for the old
    /// one. Returns whether the ack was accepted.
    pub fn handle_ack(&self, connection_id: &str, message_id: &str) -> bool {
        let cleared = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(message_id) {
                Some(delivery) if delivery.connection_id == connection_id => {
                    let delivery = pending.remove(message_id).unwrap();
                    delivery.retry.abort();
                    true
                }
                Some(delivery) => {
                    tracing::debug!(
                        "Ignoring ack for {} from {} (delivered on {})",
                        message_id,
                        connection_id,
                        delivery.connection_id
                    );
                    false
                }
                None => false,
            }
        };

        if cleared {
            self.project_status(message_id, MessageStatus::Acked);
        }
        cleared
    }

    /// Drop every pending delivery on a torn-down connection. No further
    /// retries; the caller's reconnect/resume logic owns re-delivery.
    pub fn clear_pending_for_connection(&self, connection_id: &str) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, delivery| {
            if delivery.connection_id == connection_id {
                delivery.retry.abort();
                false
            } else {
                true
            }
        });
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::debug!(
                "Cleared {} pending deliveries for connection {}",
                dropped,
                connection_id
            );
        }
        dropped
    }

    /// Number of deliveries awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    async fn retry_loop(self: Arc<Self>, message_id: String) {
        enum Tick {
            Resend(Arc<dyn ConnectionHandle>, Envelope),
            Drop(&'static str),
            Gone,
        }

        loop {
            tokio::time::sleep(self.config.ack_timeout).await;

            let tick = {
                let mut pending = self.pending.lock().unwrap();
                match pending.get_mut(&message_id) {
                    None => Tick::Gone,
                    Some(delivery) => {
                        let elapsed = now_ms().saturating_sub(delivery.first_sent_at);
                        if elapsed >= self.config.ttl.as_millis() as i64 {
                            Tick::Drop("ttl expired")
                        } else if delivery.attempts >= self.config.max_attempts {
                            Tick::Drop("attempts exhausted")
                        } else {
                            match self.registry.resolve(&delivery.connection_id) {
                                None => Tick::Drop("connection gone"),
                                Some(connection) => {
                                    delivery.attempts += 1;
                                    Tick::Resend(connection, delivery.envelope.clone())
                                }
                            }
                        }
                    }
                }
            };

            match tick {
                Tick::Gone => return,
                Tick::Drop(reason) => {
                    self.pending.lock().unwrap().remove(&message_id);
                    tracing::warn!("Dropping delivery of {}: {}", message_id, reason);
                    self.project_status(&message_id, MessageStatus::Failed);
                    return;
                }
                Tick::Resend(connection, envelope) => {
                    if !connection.send(&envelope) {
                        tracing::debug!(
                            "Re-send of {} on {} refused, will retry",
                            message_id,
                            connection.id()
                        );
                    }
                }
            }
        }
    }

    /// Project a terminal delivery outcome onto the store. Fire and forget:
    /// a persistence failure is logged, never propagated to the transport.
    fn project_status(&self, message_id: &str, status: MessageStatus) {
        let store = self.store.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            match store.update_message_status(&message_id, status).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("No stored message {} to project status onto", message_id);
                }
                Err(e) => {
                    tracing::warn!("Could not persist status for {}: {}", message_id, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConnection {
        id: String,
        sends: AtomicUsize,
        accept: bool,
    }

    impl FakeConnection {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                sends: AtomicUsize::new(0),
                accept: true,
            })
        }
    }

    impl ConnectionHandle for FakeConnection {
        fn id(&self) -> &str {
            &self.id
        }

        fn send(&self, _envelope: &Envelope) -> bool {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        connections: Mutex<HashMap<String, Arc<FakeConnection>>>,
    }

    impl FakeRegistry {
        fn insert(&self, connection: Arc<FakeConnection>) {
            self.connections
                .lock()
                .unwrap()
                .insert(connection.id.clone(), connection);
        }

        fn remove(&self, connection_id: &str) {
            self.connections.lock().unwrap().remove(connection_id);
        }
    }

    impl ConnectionRegistry for FakeRegistry {
        fn resolve(&self, connection_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
            self.connections
                .lock()
                .unwrap()
                .get(connection_id)
                .cloned()
                .map(|c| c as Arc<dyn ConnectionHandle>)
        }
    }

    fn envelope(message_id: &str) -> Envelope {
        Envelope {
            message_id: message_id.to_string(),
            recipient: "builder".to_string(),
            frame: serde_json::json!({"body": "hello"}),
            timestamp: now_ms(),
        }
    }

    async fn test_setup(
        config: TrackerConfig,
    ) -> (Arc<DeliveryTracker>, Arc<FakeRegistry>, MessageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path(), 30).await.unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let tracker = DeliveryTracker::new(config, registry.clone(), store.clone());
        (tracker, registry, store, dir)
    }

    #[tokio::test]
    async fn test_ack_clears_pending_and_projects_acked() {
        let (tracker, registry, store, _dir) = test_setup(TrackerConfig::default()).await;
        store
            .save_message(crate::store::Message::new("m-1", "planner", "builder", "hi"))
            .await
            .unwrap();

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());

        tracker.track(conn.as_ref(), envelope("m-1"));
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.handle_ack("conn-1", "m-1"));
        assert_eq!(tracker.pending_count(), 0);

        // The projection task is fire-and-forget; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.get_message_by_id("m-1").unwrap().status,
            MessageStatus::Acked
        );
    }

    #[tokio::test]
    async fn test_ack_connection_affinity() {
        let (tracker, registry, _store, _dir) = test_setup(TrackerConfig::default()).await;

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());
        tracker.track(conn.as_ref(), envelope("m-1"));

        // An ack from a different connection is ignored.
        assert!(!tracker.handle_ack("conn-2", "m-1"));
        assert_eq!(tracker.pending_count(), 1);

        // An ack for an unknown message is ignored.
        assert!(!tracker.handle_ack("conn-1", "m-other"));
    }

    #[tokio::test]
    async fn test_clear_pending_for_connection() {
        let (tracker, registry, _store, _dir) = test_setup(TrackerConfig::default()).await;

        let conn_a = FakeConnection::new("conn-a");
        let conn_b = FakeConnection::new("conn-b");
        registry.insert(conn_a.clone());
        registry.insert(conn_b.clone());

        tracker.track(conn_a.as_ref(), envelope("m-1"));
        tracker.track(conn_a.as_ref(), envelope("m-2"));
        tracker.track(conn_b.as_ref(), envelope("m-3"));

        assert_eq!(tracker.clear_pending_for_connection("conn-a"), 2);
        assert_eq!(tracker.pending_count(), 1);

        // Clearing again is a no-op.
        assert_eq!(tracker.clear_pending_for_connection("conn-a"), 0);
    }

    #[tokio::test]
    async fn test_retry_resends_on_same_connection() {
        let config = TrackerConfig {
            ack_timeout: Duration::from_millis(20),
            max_attempts: 10,
            ttl: Duration::from_secs(60),
        };
        let (tracker, registry, _store, _dir) = test_setup(config).await;

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());
        tracker.track(conn.as_ref(), envelope("m-1"));

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(conn.sends.load(Ordering::SeqCst) >= 2);
        assert_eq!(tracker.pending_count(), 1);

        tracker.handle_ack("conn-1", "m-1");
    }

    #[tokio::test]
    async fn test_attempt_exhaustion_projects_failed() {
        let config = TrackerConfig {
            ack_timeout: Duration::from_millis(20),
            max_attempts: 2,
            ttl: Duration::from_secs(60),
        };
        let (tracker, registry, store, _dir) = test_setup(config).await;
        store
            .save_message(crate::store::Message::new("m-1", "planner", "builder", "hi"))
            .await
            .unwrap();

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());
        tracker.track(conn.as_ref(), envelope("m-1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            store.get_message_by_id("m-1").unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_projects_failed() {
        let config = TrackerConfig {
            ack_timeout: Duration::from_millis(20),
            max_attempts: 1000,
            ttl: Duration::from_millis(60),
        };
        let (tracker, registry, store, _dir) = test_setup(config).await;
        store
            .save_message(crate::store::Message::new("m-1", "planner", "builder", "hi"))
            .await
            .unwrap();

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());
        tracker.track(conn.as_ref(), envelope("m-1"));

        // Attempts are nowhere near exhausted; only the TTL can drop this.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            store.get_message_by_id("m-1").unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_lost_connection_drops_delivery() {
        let config = TrackerConfig {
            ack_timeout: Duration::from_millis(20),
            max_attempts: 10,
            ttl: Duration::from_secs(60),
        };
        let (tracker, registry, store, _dir) = test_setup(config).await;
        store
            .save_message(crate::store::Message::new("m-1", "planner", "builder", "hi"))
            .await
            .unwrap();

        let conn = FakeConnection::new("conn-1");
        registry.insert(conn.clone());
        tracker.track(conn.as_ref(), envelope("m-1"));
        registry.remove("conn-1");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            store.get_message_by_id("m-1").unwrap().status,
            MessageStatus::Failed
        );
    }
}
