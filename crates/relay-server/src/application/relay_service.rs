//! The relay protocol handler.
//!
//! [`RelayService`] owns all shared relay state (connection registry,
//! stream registry, adaptive controllers, pending frame metadata, outbound
//! queues) and exposes the four entry points the transport layer drives:
//!
//! - [`RelayService::register_connection`] when a transport is accepted,
//! - [`RelayService::handle_text`] for each inbound control message,
//! - [`RelayService::handle_binary`] for each inbound frame payload,
//! - [`RelayService::handle_disconnect`] when the transport goes away.
//!
//! One service instance exists per relay process and is cloned (cheaply,
//! all state is behind `Arc`) into every session task. Nothing here is a
//! process-global: tests build as many isolated services as they like.
//!
//! # The frame pipeline
//!
//! A producer sends `frame_metadata` (JSON) immediately followed by one
//! binary payload. The metadata is parked in a per-producer pending slot;
//! when the payload arrives the service records received counters, invokes
//! the codec adapter off the async runtime, fans the result out to the
//! stream's viewers, removes viewers that failed delivery, and records
//! sent counters. A payload with no pending metadata is dropped with a
//! warning: protocol desync must not take the relay down, and neither may
//! any single bad frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_core::{
    AdaptiveController, AdaptiveState, CaptureCommand, ClientMessage, ClientType, CodecAdapter,
    ConnectionId, ConnectionRegistry, ControlAction, DecodeError, ErrorCode, FrameCodec,
    FrameMetadata, Role, ServerMessage, StreamError, StreamEvent, StreamId, StreamRegistry,
    StreamStats,
};
use relay_core::domain::stream::StreamMeta;
use relay_core::protocol::decode::decode_client_message;

use crate::application::broadcast::broadcast_frame;
use crate::domain::RelayConfig;
use crate::infrastructure::outbound::{Outbound, OutboundRegistry};

/// Milliseconds since the Unix epoch, for pong/heartbeat timestamps.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The relay protocol handler and owner of all shared relay state.
#[derive(Clone)]
pub struct RelayService {
    config: Arc<RelayConfig>,
    connections: Arc<RwLock<ConnectionRegistry>>,
    streams: Arc<Mutex<StreamRegistry>>,
    adaptive: Arc<Mutex<HashMap<StreamId, AdaptiveController>>>,
    /// At most one parked `frame_metadata` per producer, waiting for the
    /// binary payload that must follow it.
    pending_frames: Arc<Mutex<HashMap<ConnectionId, FrameMetadata>>>,
    outbound: Arc<OutboundRegistry>,
    codec: CodecAdapter,
    tick_tasks: Arc<Mutex<HashMap<StreamId, JoinHandle<()>>>>,
}

impl RelayService {
    /// Builds a service and returns it with the stream-event receiver,
    /// which the caller feeds to [`run_event_pump`].
    pub fn new(
        config: Arc<RelayConfig>,
        codec: CodecAdapter,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (streams, events_rx) = StreamRegistry::new(config.limits.max_viewers_per_stream);
        let service = Self {
            config,
            connections: Arc::new(RwLock::new(ConnectionRegistry::new())),
            streams: Arc::new(Mutex::new(streams)),
            adaptive: Arc::new(Mutex::new(HashMap::new())),
            pending_frames: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(OutboundRegistry::new()),
            codec,
            tick_tasks: Arc::new(Mutex::new(HashMap::new())),
        };
        (service, events_rx)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers a freshly accepted transport: allocates an id, creates
    /// the outbound queue, and enqueues the `welcome` message. Returns the
    /// id and the queue receiver for the connection's writer task.
    pub async fn register_connection(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = self.connections.write().await.register(Instant::now());
        let rx = self
            .outbound
            .register(id, self.config.limits.outbound_queue)
            .await;

        self.send_to(id, ServerMessage::Welcome { client_id: id }).await;
        info!(%id, "connection registered");
        (id, rx)
    }

    /// Runs the disconnect path for a connection. Safe to call more than
    /// once: every step is a no-op when the entity is already gone.
    ///
    /// A disconnecting producer ends its stream: all viewers are notified
    /// with `stream_ended` before the stream is removed. A disconnecting
    /// viewer leaves its stream, which stops capture if it was the last.
    pub async fn handle_disconnect(&self, id: ConnectionId) {
        let role = self.connections.read().await.role(id);

        match role {
            Some(Role::Producer) => {
                let stream_id = self
                    .streams
                    .lock()
                    .await
                    .stream_by_producer(id)
                    .map(|s| s.stream_id);
                if let Some(stream_id) = stream_id {
                    self.end_stream(stream_id, "producer_disconnected").await;
                }
                self.pending_frames.lock().await.remove(&id);
            }
            Some(Role::Viewer) => {
                let stream_id = self.streams.lock().await.stream_of_viewer(id);
                if let Some(stream_id) = stream_id {
                    self.streams.lock().await.remove_viewer(stream_id, id);
                }
            }
            Some(Role::Unclassified) | None => {}
        }

        self.outbound.remove(id).await;
        self.connections.write().await.remove(id);
        if role.is_some() {
            info!(%id, ?role, "connection closed");
        }
    }

    /// Notifies viewers, removes the stream, and tears down its adaptive
    /// controller and tick task. Idempotent via the registry's
    /// `remove_stream`.
    async fn end_stream(&self, stream_id: StreamId, reason: &str) {
        let removed = self.streams.lock().await.remove_stream(stream_id);
        let Some(stream) = removed else {
            return;
        };

        for viewer_id in &stream.viewer_ids {
            self.send_to(
                *viewer_id,
                ServerMessage::StreamEnded {
                    stream_id,
                    reason: reason.to_string(),
                },
            )
            .await;
        }

        if let Some(handle) = self.tick_tasks.lock().await.remove(&stream_id) {
            handle.abort();
        }
        self.adaptive.lock().await.remove(&stream_id);
        info!(%stream_id, reason, viewers = stream.viewer_ids.len(), "stream ended");
    }

    /// Force-closes connections that have been silent past the idle
    /// timeout. Dropping the outbound queue ends the writer task, which
    /// ends the session, which runs [`Self::handle_disconnect`].
    pub async fn sweep_idle(&self) -> Vec<ConnectionId> {
        let idle = self
            .connections
            .read()
            .await
            .idle_connections(self.config.limits.idle_timeout(), Instant::now());

        for &id in &idle {
            warn!(%id, "closing idle connection");
            self.outbound.remove(id).await;
        }
        idle
    }

    // ── Inbound message dispatch ──────────────────────────────────────────────

    /// Handles one inbound text (control) frame.
    ///
    /// Malformed or unknown messages are logged and dropped; the
    /// connection stays open in every case.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        self.connections.write().await.touch(id, Instant::now());

        let message = match decode_client_message(text) {
            Ok(message) => message,
            Err(DecodeError::InvalidPayload { message_type, source }) => {
                warn!(%id, %message_type, "invalid control payload: {source}");
                // A join attempt that failed schema validation almost always
                // means a missing/garbled stream id; tell the client.
                if message_type == "join_stream" {
                    self.send_to(id, ServerMessage::error(ErrorCode::MissingStreamId))
                        .await;
                }
                return;
            }
            Err(e) => {
                warn!(%id, "dropping undecodable control message: {e}");
                return;
            }
        };

        match message {
            ClientMessage::Identification {
                client_type,
                version,
                capabilities,
            } => {
                self.handle_identification(id, client_type, version, capabilities)
                    .await;
            }
            ClientMessage::JoinStream { stream_id } => {
                self.handle_join_stream(id, stream_id).await;
            }
            ClientMessage::FrameMetadata { metadata } => {
                self.handle_frame_metadata(id, metadata).await;
            }
            ClientMessage::Heartbeat { .. } => {
                self.send_to(id, ServerMessage::Pong { timestamp: unix_millis() })
                    .await;
            }
            ClientMessage::Metrics {
                fps,
                cpu,
                memory,
                network,
            } => {
                debug!(%id, ?fps, ?cpu, ?memory, ?network, "producer metrics");
            }
            ClientMessage::Unknown { message_type } => {
                warn!(%id, %message_type, "ignoring unknown message type");
            }
        }
    }

    async fn handle_identification(
        &self,
        id: ConnectionId,
        client_type: ClientType,
        version: Option<String>,
        capabilities: Option<Vec<String>>,
    ) {
        {
            let mut connections = self.connections.write().await;
            connections.set_metadata(
                id,
                relay_core::ClientMetadata {
                    version,
                    capabilities: capabilities.unwrap_or_default(),
                },
            );
        }
        info!(%id, ?client_type, "client identified");

        match client_type {
            ClientType::CaptureClient => {
                self.connections.write().await.set_role(id, Role::Producer);
                let created = self.streams.lock().await.create_stream(id, Instant::now());
                match created {
                    Ok(stream_id) => {
                        self.adaptive.lock().await.insert(
                            stream_id,
                            AdaptiveController::new((&self.config.adaptive).into()),
                        );
                        self.spawn_tick_task(stream_id, id).await;
                        self.send_to(id, ServerMessage::StreamCreated { stream_id })
                            .await;
                    }
                    Err(e @ StreamError::ProducerAlreadyStreaming(_)) => {
                        warn!(%id, "{e}");
                        self.send_to(id, ServerMessage::error(ErrorCode::ProducerAlreadyStreaming))
                            .await;
                    }
                    Err(e) => warn!(%id, "stream creation failed: {e}"),
                }
            }
            ClientType::Viewer => {
                self.connections.write().await.set_role(id, Role::Viewer);
            }
            ClientType::Unknown => {
                debug!(%id, "client identified with unknown type; left unclassified");
            }
        }
    }

    async fn handle_join_stream(&self, id: ConnectionId, stream_id: StreamId) {
        // Joining makes the connection a viewer even without a prior
        // identification message.
        self.connections.write().await.set_role(id, Role::Viewer);

        let result = self.streams.lock().await.add_viewer(stream_id, id);
        match result {
            Ok(viewer_count) => {
                self.send_to(
                    id,
                    ServerMessage::JoinedStream {
                        stream_id,
                        viewer_count,
                    },
                )
                .await;
            }
            Err(e @ StreamError::StreamNotFound(_)) => {
                debug!(%id, "{e}");
                self.send_to(id, ServerMessage::error(ErrorCode::StreamNotFound))
                    .await;
            }
            Err(e @ StreamError::StreamFull { .. }) => {
                warn!(%id, "{e}");
                self.send_to(id, ServerMessage::error(ErrorCode::StreamFull))
                    .await;
            }
            Err(e) => warn!(%id, "join failed: {e}"),
        }
    }

    async fn handle_frame_metadata(&self, id: ConnectionId, metadata: FrameMetadata) {
        let previous = self.pending_frames.lock().await.insert(id, metadata);
        if let Some(previous) = previous {
            // Producer protocol violation: two metadata messages without a
            // payload in between. Best effort: the newer one wins.
            warn!(
                %id,
                dropped_frame = previous.frame_number,
                "frame metadata overwritten before its payload arrived"
            );
        }
    }

    /// Handles one inbound binary (frame payload) message. Errors at any
    /// stage are contained to this frame.
    pub async fn handle_binary(&self, id: ConnectionId, payload: Vec<u8>) {
        self.connections.write().await.touch(id, Instant::now());

        if payload.len() > self.config.limits.max_frame_bytes {
            warn!(
                %id,
                size = payload.len(),
                limit = self.config.limits.max_frame_bytes,
                "dropping oversized frame"
            );
            self.pending_frames.lock().await.remove(&id);
            return;
        }

        let Some(metadata) = self.pending_frames.lock().await.remove(&id) else {
            warn!(%id, "dropping binary payload with no pending frame metadata");
            return;
        };

        let stream_id = {
            let streams = self.streams.lock().await;
            match streams.stream_by_producer(id) {
                Some(stream) => stream.stream_id,
                None => {
                    warn!(%id, "dropping frame from connection with no active stream");
                    return;
                }
            }
        };

        self.streams.lock().await.record_frame_received(
            stream_id,
            payload.len() as u64,
            Instant::now(),
        );

        // Compress off the async runtime; fall back to forwarding the raw
        // buffer so delivery never stops because compression failed.
        let quality = self
            .adaptive
            .lock()
            .await
            .get(&stream_id)
            .map(|c| c.jpeg_quality())
            .unwrap_or(self.config.adaptive.initial_quality);

        let raw = Arc::new(payload);
        let (data, codec) = {
            let adapter = self.codec.clone();
            let input = Arc::clone(&raw);
            let (width, height) = (metadata.width, metadata.height);
            let compressed =
                tokio::task::spawn_blocking(move || adapter.compress(&input, width, height, quality))
                    .await;
            match compressed {
                Ok(Ok(frame)) => (Arc::new(frame.data), frame.codec),
                Ok(Err(e)) => {
                    warn!(%id, frame = metadata.frame_number, "compression failed, forwarding raw: {e}");
                    (Arc::clone(&raw), FrameCodec::Bgra)
                }
                Err(e) => {
                    warn!(%id, frame = metadata.frame_number, "compression task failed, forwarding raw: {e}");
                    (Arc::clone(&raw), FrameCodec::Bgra)
                }
            }
        };

        self.streams.lock().await.update_meta(
            stream_id,
            StreamMeta {
                width: metadata.width,
                height: metadata.height,
                codec,
            },
        );

        let viewers = self.streams.lock().await.viewers(stream_id);
        let relayed = FrameMetadata {
            size: data.len() as u64,
            ..metadata
        };
        let report = broadcast_frame(
            &self.outbound,
            &viewers,
            relayed,
            codec,
            Arc::clone(&data),
            self.config.limits.send_timeout(),
        )
        .await;

        {
            let mut streams = self.streams.lock().await;
            for viewer_id in &report.failed {
                streams.remove_viewer(stream_id, *viewer_id);
            }
            streams.record_frame_sent(stream_id, data.len() as u64, report.delivered);
        }
        // A failed delivery means a dead or hopelessly backed-up viewer;
        // closing its queue lets the session tear itself down.
        for viewer_id in report.failed {
            self.outbound.remove(viewer_id).await;
        }

        debug!(
            frame = metadata.frame_number,
            delivered = report.delivered,
            ?codec,
            "frame relayed"
        );
    }

    // ── Stream events and adaptive control ────────────────────────────────────

    /// Applies one registry event: capture starts with the first viewer
    /// and stops with the last.
    pub async fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::FirstViewerJoined { stream_id } => {
                let actions = match self.adaptive.lock().await.get_mut(&stream_id) {
                    Some(controller) => controller.on_first_viewer(),
                    None => Vec::new(),
                };
                self.push_actions(stream_id, actions).await;
            }
            StreamEvent::LastViewerLeft { stream_id } => {
                let actions = match self.adaptive.lock().await.get_mut(&stream_id) {
                    Some(controller) => controller.on_last_viewer(),
                    None => Vec::new(),
                };
                self.push_actions(stream_id, actions).await;
            }
            StreamEvent::ViewerAdded { stream_id, viewer_count, .. } => {
                debug!(%stream_id, viewer_count, "viewer added");
            }
            StreamEvent::ViewerRemoved { stream_id, viewer_id } => {
                debug!(%stream_id, %viewer_id, "viewer removed");
            }
            StreamEvent::StreamRemoved { stream_id } => {
                debug!(%stream_id, "stream removed");
            }
        }
    }

    /// Translates controller actions into control messages for the
    /// stream's producer.
    async fn push_actions(&self, stream_id: StreamId, actions: Vec<ControlAction>) {
        if actions.is_empty() {
            return;
        }
        let producer_id = {
            let streams = self.streams.lock().await;
            match streams.get_stream(stream_id) {
                Some(stream) => stream.producer_id,
                None => return,
            }
        };

        for action in actions {
            let message = match action {
                ControlAction::StartCapture => ServerMessage::Command {
                    command: CaptureCommand::StartCapture,
                },
                ControlAction::StopCapture => ServerMessage::Command {
                    command: CaptureCommand::StopCapture,
                },
                ControlAction::UpdateConfig { fps, quality } => {
                    ServerMessage::ConfigUpdate { fps, quality }
                }
            };
            self.send_to(producer_id, message).await;
        }
    }

    /// Spawns the per-stream measurement tick: every tick interval,
    /// compute bytes delivered since the previous tick and let the
    /// controller adjust quality/FPS. Ends when the stream is gone.
    async fn spawn_tick_task(&self, stream_id: StreamId, producer_id: ConnectionId) {
        let service = self.clone();
        let interval = self.config.adaptive.tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately; skip it

            let mut last_bytes: u64 = 0;
            let mut last_tick = Instant::now();

            loop {
                ticker.tick().await;

                let bytes_sent = match service.streams.lock().await.stats(stream_id) {
                    Some(stats) => stats.bytes_sent,
                    None => break, // stream removed
                };
                let now = Instant::now();
                let delta = bytes_sent.saturating_sub(last_bytes);
                let elapsed = now.duration_since(last_tick);
                last_bytes = bytes_sent;
                last_tick = now;

                let action = match service.adaptive.lock().await.get_mut(&stream_id) {
                    Some(controller) => controller.on_tick(delta, elapsed),
                    None => break,
                };
                if let Some(ControlAction::UpdateConfig { fps, quality }) = action {
                    service
                        .send_to(producer_id, ServerMessage::ConfigUpdate { fps, quality })
                        .await;
                }
            }
            debug!(%stream_id, "adaptive tick task ended");
        });

        self.tick_tasks.lock().await.insert(stream_id, handle);
    }

    // ── Helpers and accessors ─────────────────────────────────────────────────

    /// Best-effort control send; failures surface through the normal
    /// disconnect path, not here.
    async fn send_to(&self, id: ConnectionId, message: ServerMessage) {
        self.outbound
            .send_control(id, message, self.config.limits.send_timeout())
            .await;
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.stream_count()
    }

    pub async fn stream_stats(&self, stream_id: StreamId) -> Option<StreamStats> {
        self.streams.lock().await.stats(stream_id)
    }

    pub async fn viewer_ids(&self, stream_id: StreamId) -> Vec<ConnectionId> {
        self.streams.lock().await.viewers(stream_id)
    }

    pub async fn stream_of_producer(&self, id: ConnectionId) -> Option<StreamId> {
        self.streams
            .lock()
            .await
            .stream_by_producer(id)
            .map(|s| s.stream_id)
    }

    /// Current throttling parameters for a stream, for diagnostics.
    pub async fn adaptive_state(&self, stream_id: StreamId) -> Option<AdaptiveState> {
        self.adaptive
            .lock()
            .await
            .get(&stream_id)
            .map(|c| c.state().clone())
    }
}

/// Consumes stream-registry events and applies them to the service.
/// Runs until the registry (and with it the sender) is dropped.
pub async fn run_event_pump(
    service: RelayService,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        service.handle_stream_event(event).await;
    }
    debug!("stream event pump ended");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
