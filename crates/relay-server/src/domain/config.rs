//! Relay configuration.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.
//! It is a plain struct with serde defaults on every field, so it can be
//! built from `Default` (tests, local development), loaded from a TOML file
//! (`--config relay.toml`), or partially overridden by CLI flags.
//!
//! Fields absent from the TOML file fall back to their defaults, which
//! keeps old config files working when new settings are added.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::AdaptiveConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub adaptive: AdaptiveSettings,
}

/// Bind address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address to bind the WebSocket listener to. `"0.0.0.0"` binds all
    /// interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the WebSocket listener.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NetworkConfig {
    /// The `host:port` string handed to `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Resource and liveness limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Hard cap on viewers per stream; joins beyond it get `stream_full`.
    #[serde(default = "default_max_viewers")]
    pub max_viewers_per_stream: usize,
    /// A connection with no inbound traffic for this long is force-closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Maximum time to wait for a viewer's send queue to accept a frame
    /// before the viewer is treated as dead.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Capacity of each connection's outbound queue, in messages.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Binary frames larger than this are dropped with a warning.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl LimitsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Tuning for the adaptive delivery controller (`[adaptive]` section).
///
/// Kept separate from [`relay_core::AdaptiveConfig`] so the wire/file
/// format can evolve independently of the controller's internal knobs;
/// `From` bridges the two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveSettings {
    /// Target ceiling for sustained delivery, kilobits per second.
    #[serde(default = "default_bitrate_ceiling_kbps")]
    pub bitrate_ceiling_kbps: f64,
    /// Measurement window length between controller ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Number of samples in the trailing bitrate window.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Fraction of the ceiling under which quality/FPS may be raised.
    #[serde(default = "default_raise_threshold")]
    pub raise_threshold: f64,
    #[serde(default = "default_quality_min")]
    pub quality_min: u8,
    #[serde(default = "default_quality_max")]
    pub quality_max: u8,
    #[serde(default = "default_quality_step_down")]
    pub quality_step_down: u8,
    #[serde(default = "default_quality_step_up")]
    pub quality_step_up: u8,
    #[serde(default = "default_fps_min")]
    pub fps_min: u32,
    #[serde(default = "default_fps_max")]
    pub fps_max: u32,
    #[serde(default = "default_fps_step")]
    pub fps_step: u32,
    #[serde(default = "default_initial_quality")]
    pub initial_quality: u8,
    #[serde(default = "default_initial_fps")]
    pub initial_fps: u32,
}

impl AdaptiveSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl From<&AdaptiveSettings> for AdaptiveConfig {
    fn from(settings: &AdaptiveSettings) -> Self {
        AdaptiveConfig {
            bitrate_ceiling_kbps: settings.bitrate_ceiling_kbps,
            history_len: settings.history_len,
            raise_threshold: settings.raise_threshold,
            quality_min: settings.quality_min,
            quality_max: settings.quality_max,
            quality_step_down: settings.quality_step_down,
            quality_step_up: settings.quality_step_up,
            fps_min: settings.fps_min,
            fps_max: settings.fps_max,
            fps_step: settings.fps_step,
            initial_quality: settings.initial_quality,
            initial_fps: settings.initial_fps,
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9200
}
fn default_max_viewers() -> usize {
    100
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_outbound_queue() -> usize {
    64
}
fn default_max_frame_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_bitrate_ceiling_kbps() -> f64 {
    10_000.0
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_history_len() -> usize {
    10
}
fn default_raise_threshold() -> f64 {
    0.7
}
fn default_quality_min() -> u8 {
    40
}
fn default_quality_max() -> u8 {
    95
}
fn default_quality_step_down() -> u8 {
    5
}
fn default_quality_step_up() -> u8 {
    2
}
fn default_fps_min() -> u32 {
    1
}
fn default_fps_max() -> u32 {
    30
}
fn default_fps_step() -> u32 {
    1
}
fn default_initial_quality() -> u8 {
    75
}
fn default_initial_fps() -> u32 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_viewers_per_stream: default_max_viewers(),
            idle_timeout_secs: default_idle_timeout_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_queue: default_outbound_queue(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            bitrate_ceiling_kbps: default_bitrate_ceiling_kbps(),
            tick_interval_ms: default_tick_interval_ms(),
            history_len: default_history_len(),
            raise_threshold: default_raise_threshold(),
            quality_min: default_quality_min(),
            quality_max: default_quality_max(),
            quality_step_down: default_quality_step_down(),
            quality_step_up: default_quality_step_up(),
            fps_min: default_fps_min(),
            fps_max: default_fps_max(),
            fps_step: default_fps_step(),
            initial_quality: default_initial_quality(),
            initial_fps: default_initial_fps(),
        }
    }
}

// ── File loading ──────────────────────────────────────────────────────────────

/// Loads [`RelayConfig`] from `path`, returning defaults when the file does
/// not exist (the config file is optional).
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config: RelayConfig = toml::from_str(&content)?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found; using defaults");
            Ok(RelayConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_addr_is_all_interfaces_9200() {
        let config = RelayConfig::default();
        assert_eq!(config.network.bind_addr(), "0.0.0.0:9200");
    }

    #[test]
    fn test_default_limits_match_documented_values() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_viewers_per_stream, 100);
        assert_eq!(limits.idle_timeout(), Duration::from_secs(60));
        assert_eq!(limits.send_timeout(), Duration::from_millis(5_000));
        assert_eq!(limits.max_frame_bytes, 32 * 1024 * 1024);
    }

    #[test]
    fn test_default_adaptive_settings_match_controller_defaults() {
        let settings = AdaptiveSettings::default();
        let core: AdaptiveConfig = (&settings).into();
        assert_eq!(core, AdaptiveConfig::default());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = RelayConfig::default();
        config.network.port = 9999;
        config.adaptive.bitrate_ceiling_kbps = 4_000.0;

        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let restored: RelayConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(config, restored);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: RelayConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let toml_str = r#"
[network]
port = 8080

[adaptive]
bitrate_ceiling_kbps = 2500.0
"#;

        let config: RelayConfig = toml::from_str(toml_str).expect("deserialize partial");

        assert_eq!(config.network.port, 8080);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.adaptive.bitrate_ceiling_kbps, 2_500.0);
        // Unnamed fields keep their defaults.
        assert_eq!(config.adaptive.history_len, 10);
        assert_eq!(config.limits.max_viewers_per_stream, 100);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let result: Result<RelayConfig, _> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_missing_file_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/relay/config.toml");
        let config = load_config(path).expect("missing file must not be an error");
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = std::env::temp_dir().join(format!("relay_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(&path, "[network]\nport = 4321\n").unwrap();

        let config = load_config(&path).expect("load");

        assert_eq!(config.network.port, 4321);
        std::fs::remove_dir_all(&dir).ok();
    }
}
