//! Configuration management for the device plugin.
//!
//! [`PluginConfig`] is what a plugin session needs; [`ServiceConfig`] is the
//! full configuration of the `deviceplugin` binary, loaded from several
//! sources in order of precedence:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/deviceplugin/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `DEVICEPLUGIN_`, `__` between
//!    section and key, e.g. `DEVICEPLUGIN_PLUGIN__RESOURCE_NAME`)
//! 5. Command-line arguments, applied by the caller

use crate::api;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const MAX_QUALIFIED_NAME_LEN: usize = 63;
const MAX_SUBDOMAIN_LEN: usize = 253;
const DEFAULT_RESOURCE_REQUESTS_PREFIX: &str = "requests.";
const NATIVE_RESOURCE_DOMAIN: &str = "kubernetes.io/";

/// Settings of a single plugin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Extended resource name advertised to the kubelet, e.g. `example.com/gpu`
    pub resource_name: String,
    /// File name of the plugin socket inside `plugin_dir`
    pub socket_name: String,
    /// Directory holding the plugin and kubelet sockets
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Kubelet registration socket, defaults to `plugin_dir/kubelet.sock`
    #[serde(default)]
    pub kubelet_socket: Option<PathBuf>,
}

impl PluginConfig {
    pub fn new(resource_name: impl Into<String>, socket_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            socket_name: socket_name.into(),
            plugin_dir: default_plugin_dir(),
            kubelet_socket: None,
        }
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    pub fn with_kubelet_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.kubelet_socket = Some(socket.into());
        self
    }

    /// Path of the socket this plugin listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.socket_name)
    }

    /// Path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(api::KUBELET_SOCKET_NAME))
    }

    /// Checks the configuration before any resource is acquired.
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.is_empty() {
            return Err(Error::Config("resource name cannot be empty".to_string()));
        }
        if self.socket_name.is_empty() {
            return Err(Error::Config("socket name cannot be empty".to_string()));
        }
        if Path::new(&self.socket_name).file_name() != Some(OsStr::new(&self.socket_name)) {
            return Err(Error::Config(format!(
                "socket name {} must be a plain file name",
                self.socket_name
            )));
        }
        validate_extended_resource_name(&self.resource_name)
    }
}

/// Checks `name` against the kubelet's extended resource name rules.
///
/// An extended resource name is domain prefixed, outside the native
/// `kubernetes.io/` namespace, and `requests.<name>` must be a valid
/// qualified name so the resource can be used in quotas.
pub fn validate_extended_resource_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::InvalidResourceName(name.to_string(), reason.to_string()));

    if !name.contains('/') {
        return invalid("missing domain prefix");
    }
    if name.contains(NATIVE_RESOURCE_DOMAIN) {
        return invalid("kubernetes.io domain is reserved for native resources");
    }
    if name.starts_with(DEFAULT_RESOURCE_REQUESTS_PREFIX) {
        return invalid("requests. prefix is reserved for quota");
    }

    let quota_name = format!("{}{}", DEFAULT_RESOURCE_REQUESTS_PREFIX, name);
    if let Err(reason) = check_qualified_name(&quota_name) {
        return invalid(&reason);
    }
    Ok(())
}

fn check_qualified_name(value: &str) -> std::result::Result<(), String> {
    let parts: Vec<&str> = value.split('/').collect();
    let (prefix, name) = match parts.as_slice() {
        [name] => (None, *name),
        [prefix, name] => (Some(*prefix), *name),
        _ => return Err("must contain at most one '/'".to_string()),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err("prefix part must be non-empty".to_string());
        }
        check_dns1123_subdomain(prefix)?;
    }

    if name.is_empty() {
        return Err("name part must be non-empty".to_string());
    }
    if name.len() > MAX_QUALIFIED_NAME_LEN {
        return Err(format!(
            "name part must be no more than {} characters",
            MAX_QUALIFIED_NAME_LEN
        ));
    }
    let bytes = name.as_bytes();
    let alnum_edges =
        bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let valid_chars = bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !alnum_edges || !valid_chars {
        return Err(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    Ok(())
}

fn check_dns1123_subdomain(value: &str) -> std::result::Result<(), String> {
    if value.len() > MAX_SUBDOMAIN_LEN {
        return Err(format!(
            "prefix part must be no more than {} characters",
            MAX_SUBDOMAIN_LEN
        ));
    }
    let label_ok = |label: &str| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    };
    if value.split('.').all(label_ok) && !value.bytes().any(|b| b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err("prefix part must be a lowercase RFC 1123 subdomain".to_string())
    }
}

/// Settings of the directory-backed sample device source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSourceConfig {
    /// Every sub-directory of this directory is advertised as one device
    pub root: PathBuf,
    /// Directory inside the container where allocated devices are mounted
    pub container_path: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Service configuration of the `deviceplugin` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub plugin: PluginConfig,
    pub devices: DeviceSourceConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ServiceConfig {
    /// Load configuration from the embedded defaults, the system-wide file,
    /// an optional user file and the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/deviceplugin/config.toml").required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("DEVICEPLUGIN")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from(api::DEVICE_PLUGIN_PATH)
}
