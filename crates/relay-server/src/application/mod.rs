//! Application layer: the relay protocol handler and the fan-out
//! broadcaster.

pub mod broadcast;
pub mod relay_service;

pub use broadcast::{broadcast_frame, DeliveryReport};
pub use relay_service::{run_event_pump, RelayService};
