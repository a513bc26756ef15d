//! relay-server library crate.
//!
//! This crate runs the screen-stream relay: it accepts WebSocket
//! connections, pairs one frame producer with many viewers, fans frames
//! out with per-viewer failure isolation, and throttles the producer's
//! capture parameters from measured delivery bitrate.
//!
//! # Architecture
//!
//! ```text
//! capture client / viewers (JSON + binary over WebSocket)
//!         ↕
//! [relay-server]
//!   ├── domain/          RelayConfig (plain data, TOML-loadable)
//!   ├── application/     RelayService (protocol handler), fan-out broadcast
//!   └── infrastructure/
//!         ├── ws_server/ accept loop, per-session read tasks, sweeps
//!         └── outbound/  per-connection serialized send queues
//! ```
//!
//! # Layer rules
//!
//! - `domain` holds plain configuration data: no I/O beyond file loading.
//! - `application` depends on `domain` and `relay-core`; it owns all relay
//!   state and is driven entirely through async method calls, which is what
//!   the integration tests use in place of sockets.
//! - `infrastructure` depends on everything plus `tokio` and `tungstenite`;
//!   it owns the actual transports.

/// Domain layer: configuration types.
pub mod domain;

/// Application layer: the relay protocol handler and the broadcaster.
pub mod application;

/// Infrastructure layer: WebSocket server and outbound send queues.
pub mod infrastructure;
