//! One-shot registration of a plugin endpoint with the kubelet.

use crate::api::{self, registration_client::RegistrationClient};
use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::transport;
use tracing::{debug, info};

/// Builds the registration request announcing `config`'s endpoint.
pub fn request_for(config: &PluginConfig, options: api::DevicePluginOptions) -> api::RegisterRequest {
    api::RegisterRequest {
        version: api::VERSION.to_string(),
        endpoint: config.socket_name.clone(),
        resource_name: config.resource_name.clone(),
        options: Some(options),
    }
}

/// Dials the kubelet registration socket once and registers.
///
/// Failures are returned as-is; retrying is up to the caller.
pub async fn register(config: &PluginConfig, options: api::DevicePluginOptions) -> Result<()> {
    let kubelet_socket = config.kubelet_socket();
    debug!(kubelet = %kubelet_socket.display(), "Dialing kubelet");

    let channel = transport::dial(&kubelet_socket)
        .await
        .map_err(|e| Error::Registration(e.to_string()))?;
    let mut client = RegistrationClient::new(channel);

    client
        .register(request_for(config, options))
        .await
        .map_err(|status| {
            Error::Registration(format!(
                "kubelet rejected registration: {} ({:?})",
                status.message(),
                status.code()
            ))
        })?;

    info!(
        resource = %config.resource_name,
        endpoint = %config.socket_name,
        "Registered device plugin with kubelet"
    );
    Ok(())
}
