//! Primary transport: the persistent WebSocket to the local relay.
//!
//! Provides:
//! - Connection lifecycle events (connect, disconnect, close, status)
//! - Its own reconnect loop with exponential backoff
//! - Frame send/receive (bincode [`SyncMessage`])
//!
//! A failed connection attempt is reported as a `Close` just like a dropped
//! connection, so the failure detector counts both.

use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ReconnectConfig;
use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage};

/// Socket connection status, reported through [`PrimaryEvent::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by a primary transport.
#[derive(Debug, Clone)]
pub enum PrimaryEvent {
    /// Connection established
    Connect,
    /// An established connection was lost
    Disconnect,
    /// The socket closed, or a connection attempt failed
    Close { reason: String },
    Status(ConnectionStatus),
    /// Inbound frame
    Message(SyncMessage),
}

/// A persistent transport carrying the primary sync protocol.
pub trait PrimaryTransport: Send + Sync + 'static {
    /// Begin connecting; lifecycle events and inbound frames go to `events`.
    fn start(&self, events: mpsc::Sender<PrimaryEvent>);

    /// Queue a frame for sending. Fails when not connected.
    fn send(&self, message: SyncMessage) -> Result<(), SyncError>;

    /// Stop the connection loop. Must be idempotent.
    fn shutdown(&self);
}

/// WebSocket primary transport (tokio-tungstenite).
pub struct WebSocketPrimary {
    endpoint: String,
    reconnect: ReconnectConfig,
    outgoing: std::sync::Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketPrimary {
    /// Create a transport dialing `endpoint`.
    pub fn new(endpoint: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect,
            outgoing: std::sync::Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.outgoing.lock().map(|o| o.is_some()).unwrap_or(false)
    }

    async fn run(
        endpoint: String,
        reconnect: ReconnectConfig,
        outgoing: std::sync::Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
        events: mpsc::Sender<PrimaryEvent>,
    ) {
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                let delay = reconnect.delay_for(attempt);
                log::debug!("Reconnecting to {endpoint} in {delay:?} (attempt {attempt})");
                tokio::time::sleep(delay).await;
            }

            if events
                .send(PrimaryEvent::Status(ConnectionStatus::Connecting))
                .await
                .is_err()
            {
                return;
            }

            let ws_stream = match tokio_tungstenite::connect_async(&endpoint).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    log::debug!("Connection to {endpoint} failed: {e}");
                    attempt = attempt.saturating_add(1);
                    let closed = events
                        .send(PrimaryEvent::Close {
                            reason: e.to_string(),
                        })
                        .await;
                    if closed.is_err() {
                        return;
                    }
                    let _ = events
                        .send(PrimaryEvent::Status(ConnectionStatus::Disconnected))
                        .await;
                    continue;
                }
            };

            log::info!("Primary transport connected to {endpoint}");
            attempt = 0;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
            if let Ok(mut slot) = outgoing.lock() {
                *slot = Some(out_tx);
            }

            // Writer task: forward the outgoing channel to the socket.
            let writer = tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            if events.send(PrimaryEvent::Connect).await.is_err() {
                writer.abort();
                return;
            }
            let _ = events
                .send(PrimaryEvent::Status(ConnectionStatus::Connected))
                .await;

            let mut reason = String::from("connection closed");
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(frame) if frame.msg_type == MessageType::Ping => {
                                let pong = SyncMessage::pong(&frame.document);
                                if let (Ok(encoded), Ok(slot)) = (pong.encode(), outgoing.lock()) {
                                    if let Some(tx) = slot.as_ref() {
                                        let _ = tx.try_send(encoded);
                                    }
                                }
                            }
                            Ok(frame) => {
                                if events.send(PrimaryEvent::Message(frame)).await.is_err() {
                                    writer.abort();
                                    return;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by peer ({}): {}", u16::from(frame.code), frame.reason);
                        }
                        break;
                    }
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                    _ => {}
                }
            }

            if let Ok(mut slot) = outgoing.lock() {
                *slot = None;
            }
            writer.abort();
            log::info!("Primary transport lost: {reason}");
            attempt = 1;

            if events.send(PrimaryEvent::Disconnect).await.is_err() {
                return;
            }
            let _ = events.send(PrimaryEvent::Close { reason }).await;
            let _ = events
                .send(PrimaryEvent::Status(ConnectionStatus::Disconnected))
                .await;
        }
    }
}

impl PrimaryTransport for WebSocketPrimary {
    fn start(&self, events: mpsc::Sender<PrimaryEvent>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            log::warn!("Primary transport for {} already started", self.endpoint);
            return;
        }
        *task = Some(tokio::spawn(Self::run(
            self.endpoint.clone(),
            self.reconnect.clone(),
            self.outgoing.clone(),
            events,
        )));
    }

    fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        let encoded = message.encode()?;
        let slot = self
            .outgoing
            .lock()
            .map_err(|_| SyncError::transport("primary transport poisoned"))?;
        match slot.as_ref() {
            Some(tx) => tx
                .try_send(encoded)
                .map_err(|e| SyncError::transport(format!("primary send failed: {e}"))),
            None => Err(SyncError::transport("primary transport not connected")),
        }
    }

    fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = None;
        }
    }
}

impl Drop for WebSocketPrimary {
    fn drop(&mut self) {
        self.shutdown();
    }
}
