use super::config::LoggingConfig;
use crate::config::ServiceConfig;
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Default, Args)]
pub struct PluginArgs {
    /// Extended resource name to advertise (e.g. example.com/dir)
    #[arg(long, env = "DEVICEPLUGIN_RESOURCE_NAME")]
    pub resource_name: Option<String>,

    /// Socket file name inside the plugin directory
    #[arg(long, env = "DEVICEPLUGIN_SOCKET_NAME")]
    pub socket_name: Option<String>,

    /// Directory holding the kubelet and plugin sockets
    #[arg(long, env = "DEVICEPLUGIN_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Kubelet registration socket (defaults to <plugin-dir>/kubelet.sock)
    #[arg(long, env = "DEVICEPLUGIN_KUBELET_SOCKET")]
    pub kubelet_socket: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
pub struct DeviceArgs {
    /// Directory whose sub-directories are advertised as devices
    #[arg(long, env = "DEVICEPLUGIN_DEVICE_ROOT")]
    pub device_root: Option<PathBuf>,

    /// Directory inside the container where allocated devices are mounted
    #[arg(long, env = "DEVICEPLUGIN_CONTAINER_PATH")]
    pub container_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub plugin: PluginArgs,

    #[command(flatten)]
    pub devices: DeviceArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl ServeCommand {
    /// Overrides loaded settings with the flags given on the command line.
    pub fn apply(&self, config: &mut ServiceConfig) {
        if let Some(resource_name) = &self.plugin.resource_name {
            config.plugin.resource_name = resource_name.clone();
        }
        if let Some(socket_name) = &self.plugin.socket_name {
            config.plugin.socket_name = socket_name.clone();
        }
        if let Some(plugin_dir) = &self.plugin.plugin_dir {
            config.plugin.plugin_dir = plugin_dir.clone();
        }
        if let Some(kubelet_socket) = &self.plugin.kubelet_socket {
            config.plugin.kubelet_socket = Some(kubelet_socket.clone());
        }
        if let Some(root) = &self.devices.device_root {
            config.devices.root = root.clone();
        }
        if let Some(container_path) = &self.devices.container_path {
            config.devices.container_path = container_path.clone();
        }
    }
}
