use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use tello_bridge::Bridge;
use tello_bridge::config::{BridgeConfig, FileConfig, Overrides, load_config};

#[derive(Parser)]
#[command(name = "tello-bridge")]
#[command(about = "Expose a Tello drone's UDP command and telemetry ports over WebSocket")]
#[command(version)]
struct Args {
    /// TOML config file (also reads TELLO_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device IP address
    #[arg(long)]
    device_host: Option<String>,

    /// Device command port
    #[arg(long)]
    device_port: Option<u16>,

    /// Local port for the command socket
    #[arg(long)]
    local_port: Option<u16>,

    /// Local port for the telemetry socket
    #[arg(long)]
    telemetry_port: Option<u16>,

    /// WebSocket bind address
    #[arg(long)]
    ws_host: Option<String>,

    /// WebSocket port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "tello_bridge=debug,tower_http=debug,info"
    } else {
        "tello_bridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    Overrides {
        device_host: args.device_host,
        device_port: args.device_port,
        local_port: args.local_port,
        telemetry_port: args.telemetry_port,
        ws_host: args.ws_host,
        ws_port: args.ws_port,
    }
    .apply(&mut file_config);
    let config = BridgeConfig::from_file(&file_config)?;

    info!("Starting Tello bridge");
    let bridge = Bridge::new(config);
    let addr = bridge.start().await?;
    info!("WebSocket clients: ws://{}/", addr);
    info!("  GET /health   - link state and client count");
    info!("  GET /metrics  - counters");

    let signal = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal, cleaning up...");
    bridge.stop().await;
    signal.context("Failed to listen for Ctrl+C")?;

    info!("Shutdown complete");
    Ok(())
}
