//! CLI entry point for the MCPHA bridge.
//!
//! # Usage
//!
//! Run the bridge:
//! ```bash
//! mcpha_bridge serve --config bridge.toml
//! ```
//!
//! Run a simulated instrument to connect the bridge to:
//! ```bash
//! mcpha_bridge simulate --port 1001
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcpha_bridge::config::BridgeConfig;
use mcpha_bridge::device::MockInstrument;
use mcpha_bridge::logging;
use mcpha_bridge::server::BridgeServer;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpha_bridge")]
#[command(about = "JSON bridge for the Red Pitaya MCPHA instrument", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Client listen address (overrides the config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a simulated MCPHA instrument
    Simulate {
        /// TCP port for the simulated device
        #[arg(long, default_value = "1001")]
        port: u16,

        /// TOML configuration file (logging section only)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => serve(config, listen).await,
        Commands::Simulate { port, config } => simulate(port, config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig> {
    let config = BridgeConfig::load(path.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.logging)?;
    if let Some(path) = path {
        tracing::info!("Loaded configuration from {}", path.display());
    }
    Ok(config)
}

async fn serve(config: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }

    let server = BridgeServer::from_config(&config)
        .await
        .with_context(|| format!("Failed to start bridge on {}", config.server.listen_addr))?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

async fn simulate(port: u16, config: Option<PathBuf>) -> Result<()> {
    load_config(config)?;

    let instrument = MockInstrument::simulating()
        .bind(&format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind simulated instrument on port {}", port))?;
    tracing::info!("Simulated MCPHA instrument ready on {}", instrument.addr());

    tokio::select! {
        _ = instrument.run_until_stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}
