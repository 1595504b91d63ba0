use super::commands::LoggingConfig;
use super::dir_source::DirDeviceSource;
use crate::config::{LoggingSettings, ServiceConfig};
use crate::handler::Handlers;
use crate::supervisor::Supervisor;
use anyhow::{anyhow, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "deviceplugin=info";
const LOG_FILE_NAME: &str = "deviceplugin.log";

/// Installs the global subscriber. Flags win over the configuration file.
///
/// The returned guard flushes the log file on drop and must be held for the
/// lifetime of the process.
pub fn init_logging(logging: &LoggingConfig, settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let level = logging.get_effective_level(settings.level.as_deref());
    let filter = logging
        .log_filter
        .as_deref()
        .or(settings.filter.as_deref())
        .unwrap_or(DEFAULT_LOG_FILTER);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or(LevelFilter::INFO).into())
        .parse_lossy(filter);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match logging.log_dir.as_ref().or(settings.dir.as_ref()) {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = RollingFileAppender::new(Rotation::NEVER, dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(non_blocking))
                .try_init()
                .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
            Ok(None)
        }
    }
}

/// Serves the directory device source until SIGINT or SIGTERM. SIGHUP
/// restarts the plugin session.
pub async fn handle_serve(config: ServiceConfig) -> Result<()> {
    config.plugin.validate().context("Invalid plugin configuration")?;

    let source = DirDeviceSource::new(&config.devices)?;
    let handlers = Handlers::new().with_allocate(source.allocator());

    let (updates_tx, updates_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(1);

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        loop {
            let restart = tokio::select! {
                _ = hangup.recv() => true,
                _ = terminate.recv() => false,
                _ = tokio::signal::ctrl_c() => false,
            };
            if restart {
                info!("Received SIGHUP, restarting device plugin");
            } else {
                info!("Received shutdown signal");
            }
            if control_tx.send(restart).await.is_err() || !restart {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = source.run(updates_tx).await {
            error!(error = %e, "Device source stopped");
        }
    });

    info!(
        resource = %config.plugin.resource_name,
        socket = %config.plugin.socket_path().display(),
        devices = %config.devices.root.display(),
        "Starting device plugin"
    );

    Supervisor::new(config.plugin, handlers)
        .with_updates(updates_rx)
        .with_control(control_rx)
        .run()
        .await
        .context("Device plugin failed")?;

    info!("Device plugin stopped");
    Ok(())
}

/// Prints the effective configuration as JSON.
pub fn handle_config(config: &ServiceConfig) -> Result<()> {
    if let Err(e) = config.plugin.validate() {
        warn!(error = %e, "Plugin configuration is not valid");
    }
    let rendered = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
    println!("{}", rendered);
    Ok(())
}
