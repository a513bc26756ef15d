//! WebSocket server: accept loop and per-session task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections and upgrading each to WebSocket.
//! 3. Running one session task per connection: register with the
//!    [`RelayService`], spawn the writer task for the outbound queue, and
//!    feed inbound frames to the service until either side ends.
//! 4. Running the background loops: the stream-event pump and the idle
//!    connection sweep.
//! 5. Shutting down cleanly when the `running` flag is cleared.
//!
//! The accept loop never blocks on a session: each accepted connection is
//! handed to its own Tokio task immediately, so one slow client cannot
//! delay the next handshake. Inbound messages for a single connection are
//! processed in arrival order by its session task; different connections
//! proceed concurrently.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use relay_core::{CodecAdapter, FrameCompressor};

use crate::application::relay_service::{run_event_pump, RelayService};
use crate::domain::RelayConfig;
use crate::infrastructure::outbound::spawn_writer;

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the relay until `running` is set to `false`.
///
/// `compressor` is the deployment's frame encoder; pass
/// [`relay_core::PassthroughCompressor`] to forward frames uncompressed.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound (port in use, no
/// permission to bind).
pub async fn run_server(
    config: RelayConfig,
    compressor: Arc<dyn FrameCompressor>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let bind_addr = config.network.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {bind_addr}"))?;

    info!("screen-stream relay listening on {bind_addr}");

    let config = Arc::new(config);
    let (service, events_rx) = RelayService::new(Arc::clone(&config), CodecAdapter::new(compressor));

    // Background loops: registry events drive capture start/stop; the
    // sweep force-closes half-open connections.
    tokio::spawn(run_event_pump(service.clone(), events_rx));
    tokio::spawn(idle_sweep_loop(service.clone(), Arc::clone(&running)));

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // A short accept timeout lets the loop re-check the shutdown flag
        // even when nobody is connecting.
        let accept_result = timeout(Duration::from_millis(200), listener.accept()).await;

        match accept_result {
            Ok(Ok((stream, peer_addr))) => {
                info!("new connection from {peer_addr}");
                let service = service.clone();
                tokio::spawn(async move {
                    handle_session(stream, peer_addr, service).await;
                });
            }
            Ok(Err(e)) => {
                // Transient accept error (e.g. file-descriptor exhaustion);
                // keep serving existing sessions.
                error!("accept error: {e}");
            }
            Err(_) => {
                // Timeout: no new connection, loop back to the flag check.
            }
        }
    }

    Ok(())
}

// ── Background loops ──────────────────────────────────────────────────────────

/// Periodically closes connections that have been silent past the idle
/// timeout. Sweeping at half the timeout bounds how long a half-open
/// connection can linger.
async fn idle_sweep_loop(service: RelayService, running: Arc<AtomicBool>) {
    let period = (service.config().limits.idle_timeout() / 2).max(Duration::from_secs(1));
    let mut ticker = interval(period);
    ticker.tick().await; // skip the immediate first tick

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let closed = service.sweep_idle().await;
        if !closed.is_empty() {
            info!(count = closed.len(), "idle sweep closed connections");
        }
    }
}

// ── Per-session handling ──────────────────────────────────────────────────────

/// Entry point for each per-session task; logs the outcome of
/// [`run_session`].
async fn handle_session(stream: TcpStream, peer_addr: SocketAddr, service: RelayService) {
    match run_session(stream, peer_addr, service).await {
        Ok(()) => info!("session {peer_addr} closed normally"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

/// Runs the complete lifecycle of one connection: WebSocket handshake,
/// registration, read loop, disconnect cleanup.
///
/// The session ends when the peer closes/errors the transport (read loop
/// ends) or when the relay drops the connection's outbound queue (writer
/// task ends, e.g. after an idle sweep or failed delivery). Either way the
/// disconnect path runs exactly once, right here.
async fn run_session(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    service: RelayService,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(raw_stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let (ws_tx, mut ws_rx) = ws_stream.split();

    let (connection_id, outbound_rx) = service.register_connection().await;
    debug!(%connection_id, %peer_addr, "session established");

    // Single owner of the sink: all writes to this transport are
    // serialized through the outbound queue.
    let mut writer = spawn_writer(ws_tx, outbound_rx, connection_id);

    let reader_service = service.clone();
    let read_loop = async {
        while let Some(next) = ws_rx.next().await {
            match next {
                Ok(WsMessage::Text(text)) => {
                    reader_service.handle_text(connection_id, &text).await;
                }
                Ok(WsMessage::Binary(payload)) => {
                    reader_service.handle_binary(connection_id, payload).await;
                }
                Ok(WsMessage::Ping(data)) => {
                    // Protocol-level ping; tungstenite queues the pong reply
                    // automatically on the next sink write.
                    debug!(%connection_id, "WebSocket ping ({} bytes)", data.len());
                }
                Ok(WsMessage::Pong(_)) => {
                    debug!(%connection_id, "WebSocket pong received");
                }
                Ok(WsMessage::Close(_)) => {
                    debug!(%connection_id, "WebSocket close frame received");
                    break;
                }
                Ok(WsMessage::Frame(_)) => {
                    debug!(%connection_id, "raw frame (ignored)");
                }
                Err(WsError::ConnectionClosed | WsError::Protocol(_)) => {
                    debug!(%connection_id, "WebSocket closed");
                    break;
                }
                Err(e) => {
                    warn!(%connection_id, "WebSocket error: {e}");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = read_loop => {
            debug!(%connection_id, "read loop ended");
        }
        _ = &mut writer => {
            debug!(%connection_id, "writer task ended first");
        }
    }

    service.handle_disconnect(connection_id).await;
    writer.abort();
    Ok(())
}
