//! Infrastructure layer: WebSocket transport and outbound send queues.

pub mod outbound;
pub mod ws_server;

pub use outbound::{Outbound, OutboundRegistry};
pub use ws_server::run_server;
