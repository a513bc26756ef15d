//! Pure relay state: registries and the adaptive delivery controller.
//!
//! Nothing in this module performs I/O or touches the wall clock on its
//! own; callers inject [`std::time::Instant`] timestamps and measured
//! elapsed durations, which keeps liveness and adaptation logic fully
//! deterministic under test.

pub mod adaptive;
pub mod connection;
pub mod stream;

use uuid::Uuid;

/// Opaque identifier for one physical transport session.
pub type ConnectionId = Uuid;

/// Opaque identifier for one producer-to-viewers stream.
pub type StreamId = Uuid;
