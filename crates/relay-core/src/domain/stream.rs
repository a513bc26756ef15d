//! Stream registry: pairs one producer with its set of subscribed viewers.
//!
//! # Membership invariants
//!
//! - A stream has exactly one producer, fixed at creation.
//! - A producer owns at most one active stream at a time.
//! - A viewer belongs to at most one stream at a time; joining a new stream
//!   implicitly leaves the previous one.
//!
//! The registry maintains explicit reverse indexes (producer id to stream,
//! viewer id to stream) updated atomically with every mutation, so
//! disconnect handling never has to scan all streams and removal can never
//! leave an orphaned back-reference.
//!
//! # Events
//!
//! Membership transitions are published on an unbounded channel returned by
//! [`StreamRegistry::new`]. The capture lifecycle hangs off two of them:
//! `FirstViewerJoined` (the viewer set went 0 to 1, start capturing) and
//! `LastViewerLeft` (non-empty to empty, stop capturing). These are emitted
//! exactly once per transition, never once per `add_viewer` call.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::messages::FrameCodec;

use super::{ConnectionId, StreamId};

/// Error type for stream registry operations.
///
/// "Not found" is a normal outcome at this boundary (disconnect races), so
/// callers translate these into `error` control messages rather than
/// treating them as failures of the relay itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("producer {0} already owns an active stream")]
    ProducerAlreadyStreaming(ConnectionId),
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),
    #[error("stream {stream_id} is full ({max_viewers} viewers)")]
    StreamFull {
        stream_id: StreamId,
        max_viewers: usize,
    },
}

/// Per-stream delivery counters.
///
/// Sent counters are per-delivery: one frame fanned out to three viewers
/// adds three to `frames_sent` and three payload sizes to `bytes_sent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Last-seen frame geometry for a stream, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    pub width: u32,
    pub height: u32,
    pub codec: FrameCodec,
}

/// One active producer-to-viewers session.
#[derive(Debug)]
pub struct Stream {
    pub stream_id: StreamId,
    pub producer_id: ConnectionId,
    pub created_at: Instant,
    pub is_active: bool,
    pub viewer_ids: HashSet<ConnectionId>,
    pub stats: StreamStats,
    pub meta: Option<StreamMeta>,
    pub last_frame_at: Option<Instant>,
}

/// Membership transitions published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ViewerAdded {
        stream_id: StreamId,
        viewer_id: ConnectionId,
        viewer_count: usize,
    },
    /// The viewer set went from empty to one; capture should start.
    FirstViewerJoined { stream_id: StreamId },
    ViewerRemoved {
        stream_id: StreamId,
        viewer_id: ConnectionId,
    },
    /// The viewer set went from non-empty to empty; capture should stop.
    LastViewerLeft { stream_id: StreamId },
    StreamRemoved { stream_id: StreamId },
}

/// In-memory registry of all active streams.
pub struct StreamRegistry {
    streams: HashMap<StreamId, Stream>,
    /// producer connection id → the stream it owns.
    producer_index: HashMap<ConnectionId, StreamId>,
    /// viewer connection id → the stream it watches.
    viewer_index: HashMap<ConnectionId, StreamId>,
    max_viewers_per_stream: usize,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamRegistry {
    /// Creates a registry and returns it together with the event receiver.
    pub fn new(max_viewers_per_stream: usize) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            streams: HashMap::new(),
            producer_index: HashMap::new(),
            viewer_index: HashMap::new(),
            max_viewers_per_stream,
            event_tx: tx,
        };
        (registry, rx)
    }

    fn emit(&self, event: StreamEvent) {
        // The receiver may be gone during shutdown or in tests that only
        // exercise the registry; losing events then is fine.
        let _ = self.event_tx.send(event);
    }

    /// Allocates a stream owned by `producer_id` with an empty viewer set.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ProducerAlreadyStreaming`] if the producer
    /// already owns an active stream.
    pub fn create_stream(
        &mut self,
        producer_id: ConnectionId,
        now: Instant,
    ) -> Result<StreamId, StreamError> {
        if self.producer_index.contains_key(&producer_id) {
            return Err(StreamError::ProducerAlreadyStreaming(producer_id));
        }

        let stream_id = Uuid::new_v4();
        self.streams.insert(
            stream_id,
            Stream {
                stream_id,
                producer_id,
                created_at: now,
                is_active: true,
                viewer_ids: HashSet::new(),
                stats: StreamStats::default(),
                meta: None,
                last_frame_at: None,
            },
        );
        self.producer_index.insert(producer_id, stream_id);

        tracing::info!(%stream_id, %producer_id, "stream created");
        Ok(stream_id)
    }

    pub fn get_stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn stream_by_producer(&self, producer_id: ConnectionId) -> Option<&Stream> {
        self.producer_index
            .get(&producer_id)
            .and_then(|id| self.streams.get(id))
    }

    /// The stream a viewer is currently subscribed to, if any.
    pub fn stream_of_viewer(&self, viewer_id: ConnectionId) -> Option<StreamId> {
        self.viewer_index.get(&viewer_id).copied()
    }

    /// Subscribes a viewer to a stream, returning the resulting viewer
    /// count. Re-adding an existing viewer is a no-op (no event). A viewer
    /// subscribed to a different stream implicitly leaves it first.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::StreamNotFound`] for an unknown id and
    /// [`StreamError::StreamFull`] when the viewer cap is reached.
    pub fn add_viewer(
        &mut self,
        stream_id: StreamId,
        viewer_id: ConnectionId,
    ) -> Result<usize, StreamError> {
        if !self.streams.contains_key(&stream_id) {
            return Err(StreamError::StreamNotFound(stream_id));
        }

        // Implicit leave: one stream per viewer at a time.
        match self.viewer_index.get(&viewer_id).copied() {
            Some(previous) if previous == stream_id => {
                // Idempotent re-join.
                return Ok(self
                    .streams
                    .get(&stream_id)
                    .map(|s| s.viewer_ids.len())
                    .unwrap_or(0));
            }
            Some(previous) => self.remove_viewer(previous, viewer_id),
            None => {}
        }

        let max_viewers = self.max_viewers_per_stream;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamNotFound(stream_id))?;

        if stream.viewer_ids.len() >= max_viewers {
            return Err(StreamError::StreamFull {
                stream_id,
                max_viewers,
            });
        }

        let was_empty = stream.viewer_ids.is_empty();
        stream.viewer_ids.insert(viewer_id);
        let viewer_count = stream.viewer_ids.len();
        self.viewer_index.insert(viewer_id, stream_id);

        tracing::info!(%stream_id, %viewer_id, viewer_count, "viewer joined");
        self.emit(StreamEvent::ViewerAdded {
            stream_id,
            viewer_id,
            viewer_count,
        });
        if was_empty {
            self.emit(StreamEvent::FirstViewerJoined { stream_id });
        }
        Ok(viewer_count)
    }

    /// Unsubscribes a viewer. Idempotent: unknown streams and absent
    /// viewers are no-ops.
    pub fn remove_viewer(&mut self, stream_id: StreamId, viewer_id: ConnectionId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.viewer_ids.remove(&viewer_id) {
            return;
        }
        self.viewer_index.remove(&viewer_id);
        let now_empty = stream.viewer_ids.is_empty();

        tracing::info!(%stream_id, %viewer_id, "viewer left");
        self.emit(StreamEvent::ViewerRemoved {
            stream_id,
            viewer_id,
        });
        if now_empty {
            self.emit(StreamEvent::LastViewerLeft { stream_id });
        }
    }

    /// Removes a stream and both of its index sides, returning the removed
    /// entry so the caller can notify its viewers. Idempotent: a second
    /// call finds nothing, emits nothing, and returns `None`.
    ///
    /// Notifying viewers is deliberately the caller's job; the registry
    /// only guarantees membership consistency.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<Stream> {
        let mut stream = self.streams.remove(&stream_id)?;
        stream.is_active = false;

        self.producer_index.remove(&stream.producer_id);
        for viewer_id in &stream.viewer_ids {
            self.viewer_index.remove(viewer_id);
        }

        tracing::info!(%stream_id, viewers = stream.viewer_ids.len(), "stream removed");
        self.emit(StreamEvent::StreamRemoved { stream_id });
        Some(stream)
    }

    /// Snapshot of the current viewer set, in no particular order.
    /// Broadcasts iterate this copy so membership changes mid-delivery
    /// cannot invalidate the iteration.
    pub fn viewers(&self, stream_id: StreamId) -> Vec<ConnectionId> {
        self.streams
            .get(&stream_id)
            .map(|s| s.viewer_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn record_frame_received(&mut self, stream_id: StreamId, size_bytes: u64, now: Instant) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.stats.frames_received += 1;
            stream.stats.bytes_received += size_bytes;
            stream.last_frame_at = Some(now);
        }
    }

    /// Records one fan-out: the cost is per-delivery, so `size_bytes` is
    /// counted once per viewer actually delivered to.
    pub fn record_frame_sent(&mut self, stream_id: StreamId, size_bytes: u64, viewer_count: usize) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.stats.frames_sent += viewer_count as u64;
            stream.stats.bytes_sent += size_bytes * viewer_count as u64;
        }
    }

    pub fn update_meta(&mut self, stream_id: StreamId, meta: StreamMeta) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.meta = Some(meta);
        }
    }

    pub fn stats(&self, stream_id: StreamId) -> Option<StreamStats> {
        self.streams.get(&stream_id).map(|s| s.stats)
    }

    pub fn active_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values().filter(|s| s.is_active)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
