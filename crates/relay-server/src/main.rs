//! Screen-stream relay — entry point.
//!
//! This binary accepts WebSocket connections from one screen-capture
//! client (the producer) and any number of viewers, relays the producer's
//! frame stream to every viewer, and throttles the producer's capture
//! quality/FPS from measured delivery bitrate.
//!
//! # Usage
//!
//! ```text
//! relay-server [OPTIONS]
//!
//! Options:
//!   --bind   <IP>    Bind address [default: 0.0.0.0]
//!   --port   <PORT>  WebSocket listener port [default: 9200]
//!   --config <PATH>  Optional TOML config file
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present.
//!
//! | Variable       | Description                 |
//! |----------------|-----------------------------|
//! | `RELAY_BIND`   | Bind address                |
//! | `RELAY_PORT`   | WebSocket listener port     |
//! | `RELAY_CONFIG` | Path to a TOML config file  |
//!
//! The log level is controlled by `RUST_LOG` (e.g. `RUST_LOG=debug`).
//!
//! # Frame encoding
//!
//! The standalone binary has no encoder linked in and forwards frames
//! uncompressed (`bgra`). Deployments with a real encoder embed
//! [`relay_server::infrastructure::run_server`] and pass their own
//! [`relay_core::FrameCompressor`] implementation.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::PassthroughCompressor;
use relay_server::domain::config::{load_config, RelayConfig};
use relay_server::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Screen-stream relay server.
///
/// Pairs one screen-capture client with many viewers and adapts capture
/// parameters to the observed delivery bitrate.
#[derive(Debug, Parser)]
#[command(
    name = "relay-server",
    about = "One-producer/many-viewer screen-stream relay with adaptive delivery",
    version
)]
struct Cli {
    /// IP address to bind the WebSocket listener to.
    ///
    /// Overrides the config file when given. `0.0.0.0` accepts connections
    /// from any interface; `127.0.0.1` restricts to local clients.
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<String>,

    /// TCP port for the WebSocket listener. Overrides the config file.
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Path to a TOML configuration file. Missing file means defaults.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Resolves the effective configuration: config file (or defaults)
    /// with CLI overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => RelayConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.network.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_relay_config()?;

    info!(
        "screen-stream relay starting on {}",
        config.network.bind_addr()
    );

    // Graceful shutdown: Ctrl+C clears the flag, the accept loop checks it
    // every 200 ms and exits cleanly.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, Arc::new(PassthroughCompressor), running).await?;

    info!("screen-stream relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
