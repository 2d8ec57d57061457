//! Realtime relay for checkup stations
//!
//! Stations connect over WebSocket at `/ws`. Every text frame a station sends
//! is rebroadcast unchanged to every other connected station. The relay only
//! reads the event name for logging and never keeps record state.

pub mod error;
pub mod hub;

pub use error::{RelayError, RelayResult};
pub use hub::{event_name, RelayHub, RelayedFrame, StationConnection};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

/// Routes of the relay
pub fn router(hub: RelayHub) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Bound relay, ready to serve
pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
}

impl RelayServer {
    /// Bind the listening socket. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> RelayResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self {
            listener,
            hub: RelayHub::new(),
        })
    }

    /// # Errors
    ///
    /// Returns [`RelayError::Server`] if the socket address cannot be read.
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    /// Serve until the process stops.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Server`] if the accept loop fails.
    pub async fn run(self) -> RelayResult<()> {
        let app = router(self.hub).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(self.listener, app).await?;
        Ok(())
    }

    /// Serve in the background
    pub fn spawn(self) -> JoinHandle<RelayResult<()>> {
        tokio::spawn(self.run())
    }
}

async fn health_check(State(hub): State<RelayHub>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "checkup-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "stations": hub.connection_count().await,
    }))
}

/// Upgrade a station connection
async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<RelayHub>,
) -> Response {
    tracing::debug!(client = %addr, "WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_station(socket, addr, hub))
}

async fn handle_station(socket: WebSocket, addr: SocketAddr, hub: RelayHub) {
    let connection_id = format!("ws_{}", Uuid::new_v4());
    let mut frames = hub.register(&connection_id, addr).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let event = event_name(&text);
                    let queued = hub.publish(&connection_id, text);
                    tracing::debug!(
                        connection_id = %connection_id,
                        event = event.as_deref().unwrap_or("unknown"),
                        receivers = queued.saturating_sub(1),
                        "Relaying frame"
                    );
                }
                Some(Ok(Message::Binary(bin))) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        bytes = bin.len(),
                        "Ignoring binary frame"
                    );
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break;
                }
            },
            outbound = frames.recv() => match outbound {
                Ok(frame) if frame.origin == connection_id => {}
                Ok(frame) => {
                    if sender.send(Message::Text(frame.text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        skipped,
                        "Station fell behind, frames dropped"
                    );
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    hub.unregister(&connection_id).await;
}
