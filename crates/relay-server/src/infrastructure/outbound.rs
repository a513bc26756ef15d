//! Per-connection outbound send queues.
//!
//! Sends to one transport must never interleave, so every connection gets
//! a bounded mpsc queue drained by a single writer task that owns the
//! WebSocket sink. Producers of outbound traffic (the protocol handler,
//! the broadcaster, the adaptive tick) enqueue; only the writer writes.
//!
//! A relayed frame is one queue item carrying both the metadata control
//! message and the binary payload, so the pair is written back-to-back and
//! can never interleave with another frame's pair for the same viewer.
//!
//! Queue sends are bounded by the configured send timeout. A queue that
//! stays full for that long means the viewer is not draining its socket;
//! the caller treats the connection as dead instead of waiting forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error};

use relay_core::{ConnectionId, ServerMessage};

/// One item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON control message, written as one text frame.
    Control(ServerMessage),
    /// A relayed frame: the metadata text frame followed immediately by
    /// the binary payload. The payload is shared across all viewers of the
    /// same broadcast.
    Frame {
        metadata: ServerMessage,
        payload: Arc<Vec<u8>>,
    },
}

/// Registry of the outbound queue senders for every live connection.
#[derive(Default)]
pub struct OutboundRegistry {
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<Outbound>>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queue for a new connection and returns the receiving
    /// half for its writer task.
    pub async fn register(&self, id: ConnectionId, capacity: usize) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(capacity);
        self.senders.write().await.insert(id, tx);
        rx
    }

    /// Drops the connection's queue sender. The writer task drains what is
    /// already queued, sends a Close frame, and ends; the session task
    /// observes that and runs disconnect cleanup.
    pub async fn remove(&self, id: ConnectionId) {
        self.senders.write().await.remove(&id);
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.senders.read().await.contains_key(&id)
    }

    /// Enqueues one item for `id`, waiting at most `send_timeout` for
    /// queue space. Returns `false` when the connection is gone, its queue
    /// stayed full, or the writer already exited.
    ///
    /// The sender clone is taken under the read lock but the send itself
    /// happens after the lock is released, so a slow viewer never blocks
    /// other connections' registrations or removals.
    pub async fn send(&self, id: ConnectionId, item: Outbound, send_timeout: Duration) -> bool {
        let tx = match self.senders.read().await.get(&id) {
            Some(tx) => tx.clone(),
            None => return false,
        };

        match timeout(send_timeout, tx.send(item)).await {
            Ok(Ok(())) => true,
            Ok(Err(_closed)) => {
                debug!(%id, "outbound queue closed");
                false
            }
            Err(_elapsed) => {
                debug!(%id, "outbound queue full past send timeout");
                false
            }
        }
    }

    /// Convenience wrapper for control messages.
    pub async fn send_control(
        &self,
        id: ConnectionId,
        message: ServerMessage,
        send_timeout: Duration,
    ) -> bool {
        self.send(id, Outbound::Control(message), send_timeout).await
    }
}

/// Spawns the writer task for one connection: drains the outbound queue
/// into the WebSocket sink until the queue closes or a write fails.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    connection_id: ConnectionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let write_result = match item {
                Outbound::Control(message) => match serde_json::to_string(&message) {
                    Ok(json) => sink.send(WsMessage::Text(json)).await,
                    Err(e) => {
                        error!(%connection_id, "failed to encode control message: {e}");
                        continue;
                    }
                },
                Outbound::Frame { metadata, payload } => match serde_json::to_string(&metadata) {
                    Ok(json) => match sink.send(WsMessage::Text(json)).await {
                        Ok(()) => sink.send(WsMessage::Binary(payload.as_ref().clone())).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => {
                        error!(%connection_id, "failed to encode frame metadata: {e}");
                        continue;
                    }
                },
            };

            if let Err(e) = write_result {
                debug!(%connection_id, "outbound write failed: {e}");
                break;
            }
        }

        // Queue closed or transport broken: close politely if still possible.
        let _ = sink.send(WsMessage::Close(None)).await;
        debug!(%connection_id, "writer task ended");
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
