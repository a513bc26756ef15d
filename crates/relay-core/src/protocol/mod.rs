//! Control-plane protocol for the relay connection.
//!
//! Every relay connection carries two kinds of WebSocket messages:
//!
//! - **Text frames** containing one JSON control message, discriminated by
//!   a `"type"` field (see [`messages`]).
//! - **Binary frames** containing one opaque frame payload. A binary frame
//!   is only meaningful immediately after a `frame_metadata` control
//!   message from the same connection.
//!
//! Decoding happens exactly once at the transport boundary (see
//! [`decode`]); unrecognized message types surface as an explicit
//! [`messages::ClientMessage::Unknown`] variant rather than a decode error,
//! so the relay can log and skip them without tearing the connection down.

pub mod decode;
pub mod messages;
