//! Domain layer: relay configuration.

pub mod config;

pub use config::{AdaptiveSettings, ConfigError, LimitsConfig, NetworkConfig, RelayConfig};
