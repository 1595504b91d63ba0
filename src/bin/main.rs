//! `deviceplugin` binary.
//!
//! Advertises every directory under a device root as an allocatable device
//! to the kubelet and re-registers whenever the kubelet restarts.

use anyhow::{Context, Result};
use clap::Parser;
use deviceplugin::cli::commands::Commands;
use deviceplugin::cli::{handle_config, handle_serve, init_logging};
use deviceplugin::config::ServiceConfig;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.command.config_path()).context("Failed to load configuration")?;
    if let Commands::Serve(cmd) = &cli.command {
        cmd.apply(&mut config);
    }

    let _guard = init_logging(cli.command.logging(), &config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "deviceplugin starting up");

    match cli.command {
        Commands::Serve(_) => handle_serve(config).await,
        Commands::Config(_) => handle_config(&config),
    }
}
