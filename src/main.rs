//! # trainwatch Entry Point
//!
//! `trainwatch serve` runs the collector; `trainwatch bridge` runs the MQTT
//! relay. Both stop on Ctrl-C.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use trainwatch::{bridge::run_bridge, config::ConfigLoader, server::run_server, telemetry};

#[derive(Parser)]
#[command(name = "trainwatch")]
#[command(about = "Train detection collector and MQTT bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector HTTP API and event store
    Serve,
    /// Relay detections from the MQTT broker to the collector
    Bridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;

    telemetry::init_tracing(&config).context("Failed to initialize tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        signal_token.cancel();
    });

    match cli.command {
        Commands::Serve => run_server(config, shutdown).await,
        Commands::Bridge => run_bridge(config, shutdown).await,
    }
}
