//! All control messages exchanged over a relay connection.
//!
//! # JSON discriminant
//!
//! Every control message is a JSON object with a `"type"` field naming the
//! message kind in snake_case; all other fields are flattened into the same
//! object. For example:
//!
//! ```json
//! {"type":"identification","client_type":"capture_client","version":"1.0.0"}
//! {"type":"frame_metadata","width":1280,"height":720,"timestamp":17,"frame_number":4,"size":3686400}
//! ```
//!
//! Serde's `#[serde(tag = "type")]` attribute handles the discriminant.
//!
//! # Why separate inbound and outbound enums?
//!
//! The two directions carry different information: clients send requests
//! and frame metadata, the relay sends acknowledgements, relayed frames,
//! and capture commands. Using two distinct enums makes it a compile-time
//! error to send an inbound-only message to a viewer, and vice versa.

use serde::{Deserialize, Serialize};

use crate::domain::{ConnectionId, StreamId};

// ── Client roles ──────────────────────────────────────────────────────────────

/// Role a connection declares in its `identification` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// The frame producer: a screen-capture client pushing frames.
    CaptureClient,
    /// A frame consumer subscribed to one stream.
    Viewer,
    /// Declared but unrecognized role; the connection stays unclassified.
    Unknown,
}

// ── Frame codec tags ──────────────────────────────────────────────────────────

/// Encoding of a relayed binary frame payload.
///
/// `Bgra` marks an uncompressed frame, either because compression is
/// disabled for the deployment or because the encoder failed and the relay
/// fell back to forwarding the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    Bgra,
    Jpeg,
}

// ── Frame metadata ────────────────────────────────────────────────────────────

/// Descriptor for one frame payload, sent as a control message immediately
/// before the binary payload it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producer-side capture timestamp, milliseconds since Unix epoch.
    pub timestamp: u64,
    /// Monotonically increasing frame counter assigned by the producer.
    pub frame_number: u64,
    /// Declared payload size in bytes.
    pub size: u64,
}

// ── Inbound messages (client → relay) ─────────────────────────────────────────

/// All control messages a client can send to the relay.
///
/// The [`Unknown`](ClientMessage::Unknown) variant is never produced by
/// serde directly; it is the decoder's fallback for a well-formed JSON
/// object whose `type` the relay does not recognize (see
/// [`crate::protocol::decode::decode_client_message`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection: declares the client's role.
    Identification {
        client_type: ClientType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Vec<String>>,
    },

    /// A viewer requests to subscribe to a stream.
    JoinStream { stream_id: StreamId },

    /// Announces that the next binary frame from this connection carries
    /// the described payload.
    FrameMetadata {
        #[serde(flatten)]
        metadata: FrameMetadata,
    },

    /// Application-level keepalive; the relay answers with `pong`.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Producer-side performance report, logged for diagnostics.
    Metrics {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<f64>,
    },

    /// Fallback for a control message whose `type` is not recognized.
    /// Logged and ignored by the dispatcher.
    Unknown { message_type: String },
}

// ── Outbound messages (relay → client) ────────────────────────────────────────

/// Capture command pushed to the producer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureCommand {
    StartCapture,
    StopCapture,
}

/// Machine-readable error codes carried in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProducerAlreadyStreaming,
    StreamNotFound,
    StreamFull,
    MissingStreamId,
}

/// All control messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent immediately after the connection is accepted.
    Welcome { client_id: ConnectionId },

    /// Reply to a producer identification: the stream is live.
    StreamCreated { stream_id: StreamId },

    /// Reply to a successful `join_stream`.
    JoinedStream {
        stream_id: StreamId,
        viewer_count: usize,
    },

    /// Relayed frame descriptor. `size` and `codec` describe the payload as
    /// delivered (post-compression), not as received from the producer.
    FrameMetadata {
        #[serde(flatten)]
        metadata: FrameMetadata,
        codec: FrameCodec,
    },

    /// Capture control pushed to the producer.
    Command { command: CaptureCommand },

    /// New capture parameters pushed to the producer by the adaptive
    /// controller.
    ConfigUpdate { fps: u32, quality: u8 },

    /// Reply to an inbound `heartbeat`.
    Pong { timestamp: u64 },

    /// The stream is gone; subscribed viewers receive this before removal.
    StreamEnded { stream_id: StreamId, reason: String },

    /// Request-scoped failure; the connection stays open.
    Error { message: String, code: ErrorCode },
}

impl ServerMessage {
    /// Builds an `error` message from a code, with the conventional
    /// human-readable text for logs on the client side.
    pub fn error(code: ErrorCode) -> Self {
        let message = match code {
            ErrorCode::ProducerAlreadyStreaming => "producer already owns an active stream",
            ErrorCode::StreamNotFound => "stream not found",
            ErrorCode::StreamFull => "stream is full",
            ErrorCode::MissingStreamId => "missing stream id",
        };
        ServerMessage::Error {
            message: message.to_string(),
            code,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
