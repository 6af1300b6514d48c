//! In-process SSE fan-out (§4.C9, second sink).
//!
//! Delivery is best-effort and unpersisted: a subscriber that isn't
//! listening when an event fires simply misses it. This is distinct from
//! the audit queue (`nimbus-queue`), which is at-least-once and durable.

use std::collections::HashMap;
use std::sync::Arc;

use nimbus_common::get_metrics;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

/// Channel capacity per user; a slow subscriber that falls behind this
/// many events starts missing the oldest ones (broadcast lag, not
/// blocking the publisher).
const CHANNEL_CAPACITY: usize = 256;

/// What changed about a file (§6 `/api/files/events`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Renamed,
    Moved,
    Copied,
    Deleted,
    Restored,
    PurgedPermanently,
    Starred,
    Unstarred,
    Shared,
    Unshared,
}

/// A single file-change notification, broadcast to a user's subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub user_id: String,
    pub change_kind: ChangeKind,
    pub id: String,
    pub parent_id: Option<String>,
}

/// Per-user broadcast registry. Channels are created lazily on first
/// subscribe and dropped once their last receiver disconnects, so an
/// inactive user costs nothing.
#[derive(Clone)]
pub struct SseBroadcaster {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<StreamEvent>>>>,
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl SseBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's file-change stream (called from the HTTP
    /// SSE handler, out of scope here).
    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<StreamEvent> {
        get_metrics()
            .sse_connections_active
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event to every current subscriber of `event.user_id`.
    /// A no-op (not an error) if nobody is listening.
    pub async fn publish(&self, event: StreamEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&event.user_id) {
            // `send` only errors when there are zero receivers; that's
            // expected and not worth logging.
            let _ = sender.send(event);
        }
    }

    /// Drop channels with no subscribers left, reclaiming map entries.
    /// Safe to call periodically; channels with live receivers are kept.
    pub async fn garbage_collect(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let broadcaster = SseBroadcaster::new();
        let mut rx = broadcaster.subscribe("u1").await;

        broadcaster
            .publish(StreamEvent {
                user_id: "u1".to_string(),
                change_kind: ChangeKind::Created,
                id: "f1".to_string(),
                parent_id: None,
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, "f1");
        assert_eq!(event.change_kind, ChangeKind::Created);
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_a_no_op() {
        let broadcaster = SseBroadcaster::new();
        broadcaster
            .publish(StreamEvent {
                user_id: "nobody-listening".to_string(),
                change_kind: ChangeKind::Deleted,
                id: "f1".to_string(),
                parent_id: None,
            })
            .await;
    }

    #[tokio::test]
    async fn other_users_do_not_receive_event() {
        let broadcaster = SseBroadcaster::new();
        let mut rx_u2 = broadcaster.subscribe("u2").await;

        broadcaster
            .publish(StreamEvent {
                user_id: "u1".to_string(),
                change_kind: ChangeKind::Created,
                id: "f1".to_string(),
                parent_id: None,
            })
            .await;

        assert!(rx_u2.try_recv().is_err());
    }
}
