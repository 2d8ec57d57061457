//! Connection registry and fan-out

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const FRAME_CAPACITY: usize = 1000;

/// A text frame received from one station
#[derive(Debug, Clone)]
pub struct RelayedFrame {
    /// Connection that sent the frame; it is not echoed back there
    pub origin: String,
    pub text: Arc<str>,
}

/// Metadata of one connected station
#[derive(Debug, Clone, Serialize)]
pub struct StationConnection {
    pub connection_id: String,
    pub client_ip: String,
    pub connected_at: DateTime<Utc>,
}

/// Shared state of the relay: who is connected and the fan-out channel
#[derive(Clone)]
pub struct RelayHub {
    connections: Arc<RwLock<HashMap<String, StationConnection>>>,
    frames: broadcast::Sender<RelayedFrame>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            frames,
        }
    }

    /// Register a station and subscribe it to frames from the others
    pub async fn register(
        &self,
        connection_id: &str,
        addr: SocketAddr,
    ) -> broadcast::Receiver<RelayedFrame> {
        let receiver = self.frames.subscribe();
        let connection = StationConnection {
            connection_id: connection_id.to_string(),
            client_ip: addr.ip().to_string(),
            connected_at: Utc::now(),
        };

        let mut connections = self.connections.write().await;
        connections.insert(connection_id.to_string(), connection);
        tracing::info!(
            connection_id,
            client_ip = %addr.ip(),
            stations = connections.len(),
            "Station connected"
        );
        receiver
    }

    pub async fn unregister(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if connections.remove(connection_id).is_some() {
            tracing::info!(connection_id, stations = connections.len(), "Station disconnected");
        }
    }

    /// Queue a frame for every station except its origin; returns the
    /// number of subscribers it was queued for (the origin included).
    pub fn publish(&self, origin: &str, text: impl Into<Arc<str>>) -> usize {
        let frame = RelayedFrame {
            origin: origin.to_string(),
            text: text.into(),
        };
        self.frames.send(frame).unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<StationConnection> {
        let mut connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        connections.sort_by_key(|c| c.connected_at);
        connections
    }
}

/// Event name of a frame for logging; payloads are not interpreted further
pub fn event_name(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("event")?
        .as_str()
        .map(str::to_string)
}
