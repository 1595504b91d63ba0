pub mod config;
pub mod serve;

pub use config::{ConfigCommand, LoggingConfig};
pub use serve::{DeviceArgs, PluginArgs, ServeCommand};

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin, restarting it whenever the kubelet restarts
    Serve(ServeCommand),
    /// Load and print the effective configuration
    Config(ConfigCommand),
}

impl Commands {
    pub fn config_path(&self) -> Option<&std::path::Path> {
        match self {
            Commands::Serve(cmd) => cmd.config.as_deref(),
            Commands::Config(cmd) => cmd.config.as_deref(),
        }
    }

    pub fn logging(&self) -> &LoggingConfig {
        match self {
            Commands::Serve(cmd) => &cmd.logging,
            Commands::Config(cmd) => &cmd.logging,
        }
    }
}
