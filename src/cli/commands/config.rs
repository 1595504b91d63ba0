use clap::Args;
use serde::Deserialize;
use std::path::PathBuf;

/// Logging flags shared by all commands
#[derive(Debug, Clone, Default, Args, Deserialize)]
pub struct LoggingConfig {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    #[serde(skip)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "DEVICEPLUGIN_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "DEVICEPLUGIN_LOG_FILTER", global = true)]
    pub log_filter: Option<String>,

    /// Also write logs to `deviceplugin.log` in this directory
    #[arg(long = "log-dir", env = "DEVICEPLUGIN_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Level from the flags, falling back to `configured` and then `info`.
    pub fn get_effective_level<'a>(&'a self, configured: Option<&'a str>) -> &'a str {
        match (self.verbose, self.log_level.as_deref().or(configured)) {
            (v, _) if v >= 2 => "trace", // -vv flag
            (1, _) => "debug",           // -v flag
            (0, Some(level)) => level,   // Configured level
            _ => "info",                 // Default
        }
    }
}

#[derive(Debug, Args)]
pub struct ConfigCommand {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level_precedence() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.get_effective_level(None), "info");
        assert_eq!(logging.get_effective_level(Some("warn")), "warn");

        logging.log_level = Some("error".to_string());
        assert_eq!(logging.get_effective_level(Some("warn")), "error");

        logging.verbose = 1;
        assert_eq!(logging.get_effective_level(Some("warn")), "debug");
        logging.verbose = 3;
        assert_eq!(logging.get_effective_level(None), "trace");
    }
}
