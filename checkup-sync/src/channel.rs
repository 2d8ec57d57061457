//! Realtime channel client
//!
//! Keeps one WebSocket connection to the relay, forwards store broadcasts
//! as text frames and applies inbound frames to the store.
//!
//! Connection handling:
//! - Bounded reconnection with a fixed delay between attempts
//! - Broadcasts issued while disconnected are dropped, not queued
//! - Connection failures are logged and reported as [`ConnectionEvent`]s;
//!   the store keeps working locally either way

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::photo::PhotoChange;
use crate::protocol::{ChannelMessage, ConnectionEvent};
use crate::store::RecordStore;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const EVENT_CAPACITY: usize = 32;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel client configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Relay WebSocket URL
    pub url: String,
    /// Reconnection attempts before giving up
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&SyncConfig> for ChannelConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            url: config.socket_url.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Handle to a running channel client; dropping it disconnects
pub struct ChannelHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    connected: watch::Receiver<bool>,
    events: broadcast::Receiver<ConnectionEvent>,
}

impl ChannelHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the connection is (re)established.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if the client stopped first.
    pub async fn wait_connected(&self) -> SyncResult<()> {
        let mut connected = self.connected.clone();
        let result = connected.wait_for(|up| *up).await.map(|_| ());
        result.map_err(|_| SyncError::Channel("Channel client stopped".to_string()))
    }

    /// Connection events from now on; the stream ends when the client stops
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.resubscribe()
    }

    /// Whether the client gave up or was shut down
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and wait for the client task to end
    pub async fn disconnect(self) {
        let ChannelHandle { shutdown, task, .. } = self;
        // The task may already have exited
        let _ = shutdown.send(());
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Channel client task failed");
        }
    }
}

/// Attach a channel client to `store` and start connecting in the background.
pub fn connect(store: Arc<RecordStore>, config: ChannelConfig) -> ChannelHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    store.attach_channel(outbound_tx);

    let (shutdown, shutdown_rx) = oneshot::channel();
    let (connected_tx, connected) = watch::channel(false);
    let (events_tx, events) = broadcast::channel(EVENT_CAPACITY);

    let client = ChannelClient {
        store,
        config,
        outbound: outbound_rx,
        shutdown: shutdown_rx,
        connected: connected_tx,
        events: events_tx,
    };
    let task = tokio::spawn(client.run());

    ChannelHandle {
        shutdown,
        task,
        connected,
        events,
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct ChannelClient {
    store: Arc<RecordStore>,
    config: ChannelConfig,
    outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    shutdown: oneshot::Receiver<()>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ChannelClient {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((socket, _)) => {
                    failures = 0;
                    tracing::info!(url = %self.config.url, "Channel connected");
                    self.connected.send_replace(true);
                    self.emit(ConnectionEvent::Connect);

                    let end = self.session(socket).await;
                    self.connected.send_replace(false);

                    match end {
                        SessionEnd::Shutdown => {
                            tracing::info!("Channel disconnected");
                            self.emit(ConnectionEvent::Disconnect);
                            break;
                        }
                        SessionEnd::Dropped(reason) => {
                            tracing::warn!(reason = %reason, "Channel connection lost");
                            self.emit(ConnectionEvent::Disconnect);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.url, error = %e, "Channel connect failed");
                    self.emit(ConnectionEvent::ConnectError(e.to_string()));
                }
            }

            if failures >= self.config.reconnect_attempts {
                tracing::error!(
                    attempts = self.config.reconnect_attempts,
                    "Channel reconnection attempts exhausted, continuing offline"
                );
                break;
            }
            failures += 1;

            if !self.wait_before_retry().await {
                break;
            }
            tracing::debug!(attempt = failures, "Reconnecting channel");
        }

        self.store.detach_channel();
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut source) = socket.split();

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "Close frame not delivered");
                    }
                    return SessionEnd::Shutdown;
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        return SessionEnd::Shutdown;
                    };
                    let frame = match message.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(
                                event = message.event_name(),
                                error = %e,
                                "Failed to encode broadcast"
                            );
                            continue;
                        }
                    };
                    tracing::debug!(event = message.event_name(), "Broadcasting");
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => dispatch_inbound(&self.store, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                },
            }
        }
    }

    /// Sleep out the reconnect delay, discarding broadcasts issued meanwhile.
    /// Returns false when the client should stop.
    async fn wait_before_retry(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                () = &mut delay => return true,
                _ = &mut self.shutdown => return false,
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        tracing::warn!(
                            event = message.event_name(),
                            "Channel offline, broadcast dropped"
                        );
                    }
                    None => return false,
                },
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        tracing::trace!(event = event.event_name(), "Connection event");
        let _ = self.events.send(event);
    }
}

/// Decode one inbound frame and apply it to the store.
///
/// Undecodable frames are logged and ignored.
pub async fn dispatch_inbound(store: &RecordStore, frame: &str) {
    let message = match ChannelMessage::from_frame(frame) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring inbound frame");
            return;
        }
    };

    tracing::debug!(event = message.event_name(), "Inbound channel message");
    match message {
        ChannelMessage::NewPatientId(patient_id) => store.apply_remote_patient_id(patient_id).await,
        ChannelMessage::DepartmentUpdate(patches) => store.apply_remote_update(patches).await,
        ChannelMessage::PhotoUpdate(attachment) => {
            store.apply_remote_photo(PhotoChange::Set(attachment)).await;
        }
        ChannelMessage::PhotoDelete => store.apply_remote_photo(PhotoChange::Clear).await,
        ChannelMessage::ResetPatientData => store.apply_remote_reset().await,
    }
}
