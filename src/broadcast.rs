//! Push delivery to connected clients.
//!
//! The core never talks to sockets. A [`Broadcaster`] receives already
//! committed, viewer-specific payloads and a list of connection ids, and is
//! free to deliver them at least once over whatever transport the host uses.

use crate::error::BroadcastError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// Opaque identifier of one client connection.
pub type ConnectionId = String;

/// Event carrying a fresh game view.
pub const EVENT_GAME_STATE: &str = "game_state";

/// Event carrying the final view of a finished game.
pub const EVENT_GAME_OVER: &str = "game_over";

/// Capacity of the channel behind [`ChannelBroadcaster`]. Receivers that
/// fall behind skip messages.
const CHANNEL_CAPACITY: usize = 4096;

/// One payload addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Target connection.
    pub connection_id: ConnectionId,
    /// Event name.
    pub event: String,
    /// Serialized event data.
    pub payload: Value,
}

/// Transport for pushing events to connections.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Delivers `payload` as `event` to every connection in `connections`.
    async fn send(
        &self,
        connections: &[ConnectionId],
        event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError>;
}

/// Fans deliveries out over a `tokio::sync::broadcast` channel.
///
/// Each transport task subscribes once and forwards the deliveries whose
/// connection id it owns.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<Arc<Delivery>>,
}

impl ChannelBroadcaster {
    /// Creates a hub with no subscribers.
    #[instrument]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// A receiver of every future delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Delivery>> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    #[instrument(skip(self, payload), fields(count = connections.len()))]
    async fn send(
        &self,
        connections: &[ConnectionId],
        event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError> {
        for connection_id in connections {
            let delivery = Delivery {
                connection_id: connection_id.clone(),
                event: event.to_string(),
                payload: payload.clone(),
            };
            // No subscribers is not an error; nobody is listening yet.
            if self.sender.send(Arc::new(delivery)).is_err() {
                debug!(%connection_id, "No subscribers for delivery");
            }
        }
        Ok(())
    }
}

/// Logs deliveries instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBroadcaster;

#[async_trait]
impl Broadcaster for TracingBroadcaster {
    async fn send(
        &self,
        connections: &[ConnectionId],
        event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError> {
        debug!(?connections, event, %payload, "Broadcast");
        Ok(())
    }
}

/// Keeps every delivery in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingBroadcaster {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Deliveries addressed to one connection.
    pub fn deliveries_to(&self, connection_id: &str) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.connection_id == connection_id)
            .collect()
    }

    /// Forgets what was recorded.
    pub fn clear(&self) {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.clear();
        }
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn send(
        &self,
        connections: &[ConnectionId],
        event: &str,
        payload: Value,
    ) -> Result<(), BroadcastError> {
        let mut deliveries = self
            .deliveries
            .lock()
            .map_err(|_| BroadcastError::new("recorder lock poisoned"))?;
        deliveries.extend(connections.iter().map(|c| Delivery {
            connection_id: c.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_fans_out_per_connection() {
        let hub = ChannelBroadcaster::new();
        let mut rx = hub.subscribe();
        hub.send(
            &["c1".to_string(), "c2".to_string()],
            EVENT_GAME_STATE,
            json!({"sequence": 1}),
        )
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.connection_id, "c1");
        assert_eq!(second.connection_id, "c2");
        assert_eq!(second.payload["sequence"], 1);
    }

    #[tokio::test]
    async fn send_without_subscribers_succeeds() {
        let hub = ChannelBroadcaster::new();
        assert!(hub.send(&["c1".to_string()], EVENT_GAME_OVER, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn recorder_filters_by_connection() {
        let recorder = RecordingBroadcaster::new();
        recorder
            .send(&["a".to_string(), "b".to_string()], "x", json!(1))
            .await
            .unwrap();
        recorder.send(&["a".to_string()], "y", json!(2)).await.unwrap();
        assert_eq!(recorder.deliveries().len(), 3);
        assert_eq!(recorder.deliveries_to("a").len(), 2);
        recorder.clear();
        assert!(recorder.deliveries().is_empty());
    }
}
