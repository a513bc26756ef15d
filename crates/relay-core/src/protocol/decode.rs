//! Single decode point for inbound control messages.
//!
//! The transport layer hands every WebSocket text frame to
//! [`decode_client_message`], which classifies it exactly once:
//!
//! - A well-formed message of a known kind decodes to its
//!   [`ClientMessage`] variant.
//! - A well-formed JSON object with an unrecognized `type` decodes to
//!   [`ClientMessage::Unknown`], so the dispatcher can log and skip it
//!   without special-casing serde errors.
//! - Everything else (non-JSON text, a missing `type`, or a known kind with
//!   an invalid payload) is a [`DecodeError`]: the message is dropped and
//!   the connection stays open.

use serde_json::Value;
use thiserror::Error;

use super::messages::ClientMessage;

/// Message kinds the dispatcher understands. A `type` outside this list is
/// an [`ClientMessage::Unknown`], not a decode failure.
const KNOWN_CLIENT_TYPES: &[&str] = &[
    "identification",
    "join_stream",
    "frame_metadata",
    "heartbeat",
    "metrics",
];

/// Why an inbound text frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not valid JSON.
    #[error("malformed control message: {0}")]
    Malformed(serde_json::Error),

    /// The JSON had no string `type` discriminant.
    #[error("control message has no string `type` field")]
    MissingType,

    /// The `type` was recognized but the payload did not match its schema
    /// (for example `join_stream` with a non-UUID `stream_id`).
    #[error("invalid `{message_type}` payload: {source}")]
    InvalidPayload {
        message_type: String,
        source: serde_json::Error,
    },
}

/// Decodes one inbound text frame into a [`ClientMessage`].
///
/// # Errors
///
/// Returns [`DecodeError`] for non-JSON input, a missing `type` field, or a
/// known message kind whose fields fail validation. An unrecognized `type`
/// is not an error; it yields [`ClientMessage::Unknown`].
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_owned();

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => Ok(message),
        Err(source) => {
            if KNOWN_CLIENT_TYPES.contains(&message_type.as_str()) {
                Err(DecodeError::InvalidPayload {
                    message_type,
                    source,
                })
            } else {
                Ok(ClientMessage::Unknown { message_type })
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
