//! # relay-core
//!
//! Shared library for the screen-stream relay containing the control-plane
//! protocol types, the connection and stream registries, the adaptive
//! delivery controller, and the frame codec adapter.
//!
//! This crate is used by the relay server and is deliberately free of
//! sockets and transport concerns: everything here can be driven directly
//! from tests without a network.
//!
//! # Architecture overview
//!
//! The relay pairs one frame *producer* (a screen-capture client) with any
//! number of *viewers* over persistent connections:
//!
//! ```text
//! capture client ──► relay ──► viewer A
//!                       ├────► viewer B
//!                       └────► viewer C
//! ```
//!
//! This crate defines:
//!
//! - **`protocol`** – The wire message model. Control messages are JSON
//!   objects discriminated by a `"type"` field; frame payloads travel as
//!   opaque binary messages immediately after their `frame_metadata`
//!   control message.
//!
//! - **`domain`** – Pure relay state with no I/O. The
//!   [`ConnectionRegistry`] tracks every live connection and its role, the
//!   [`StreamRegistry`] pairs a producer with its viewer set and keeps
//!   delivery counters, and the [`AdaptiveController`] closes the loop
//!   between measured delivery bitrate and the producer's capture
//!   quality/FPS.
//!
//! - **`codec`** – The seam to the external frame compressor. The relay
//!   treats compression as a pure function behind the [`FrameCompressor`]
//!   trait; [`CodecAdapter`] validates buffers and reports sizes.

pub mod codec;
pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `relay_core::StreamRegistry` instead of the full module path.
pub use codec::{CodecAdapter, CodecError, CompressedFrame, FrameCompressor, PassthroughCompressor};
pub use domain::adaptive::{
    AdaptiveConfig, AdaptiveController, AdaptiveState, CaptureState, ControlAction,
};
pub use domain::connection::{ClientMetadata, Connection, ConnectionRegistry, Role};
pub use domain::stream::{Stream, StreamError, StreamEvent, StreamRegistry, StreamStats};
pub use domain::{ConnectionId, StreamId};
pub use protocol::decode::{decode_client_message, DecodeError};
pub use protocol::messages::{
    CaptureCommand, ClientMessage, ClientType, ErrorCode, FrameCodec, FrameMetadata, ServerMessage,
};
