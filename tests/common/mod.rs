//! Shared fixtures: a fake kubelet registration server and plugin clients.

#![allow(dead_code)]

use deviceplugin::api::{
    self,
    device_plugin_client::DevicePluginClient,
    registration_server::{Registration, RegistrationServer},
};
use deviceplugin::transport;
use deviceplugin::PluginConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

pub const RESOURCE_NAME: &str = "example.com/dir";
pub const SOCKET_NAME: &str = "dir.sock";
pub const WAIT: Duration = Duration::from_secs(10);

pub fn plugin_config(dir: &Path) -> PluginConfig {
    PluginConfig::new(RESOURCE_NAME, SOCKET_NAME).with_plugin_dir(dir)
}

struct RecordingRegistration {
    requests: mpsc::UnboundedSender<api::RegisterRequest>,
    delay: Duration,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> Result<Response<api::Empty>, Status> {
        tokio::time::sleep(self.delay).await;
        let request = request.into_inner();
        if request.version != api::VERSION {
            return Err(Status::invalid_argument("unsupported version"));
        }
        let _ = self.requests.send(request);
        Ok(Response::new(api::Empty {}))
    }
}

/// Registration server listening on `kubelet.sock` in a test directory.
pub struct FakeKubelet {
    socket: PathBuf,
    tx: mpsc::UnboundedSender<api::RegisterRequest>,
    requests: mpsc::UnboundedReceiver<api::RegisterRequest>,
    delay: Duration,
    stop: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl FakeKubelet {
    pub fn start(dir: &Path) -> Self {
        Self::start_with_delay(dir, Duration::ZERO)
    }

    /// Like `start`, but every registration is answered only after `delay`.
    pub fn start_with_delay(dir: &Path, delay: Duration) -> Self {
        let (tx, requests) = mpsc::unbounded_channel();
        let mut kubelet = Self {
            socket: dir.join(api::KUBELET_SOCKET_NAME),
            tx,
            requests,
            delay,
            stop: CancellationToken::new(),
            server: None,
        };
        kubelet.serve();
        kubelet
    }

    fn serve(&mut self) {
        let listener = transport::bind(&self.socket).unwrap();
        let service = RegistrationServer::new(RecordingRegistration {
            requests: self.tx.clone(),
            delay: self.delay,
        });
        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        self.stop = stop;
        self.server = Some(tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown.cancelled_owned())
                .await
                .unwrap();
        }));
    }

    /// Simulates a kubelet restart: the socket is removed and created again.
    pub async fn restart(&mut self) {
        self.shutdown().await;
        self.serve();
    }

    pub async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
        transport::remove_stale_socket(&self.socket).unwrap();
    }

    pub async fn next_registration(&mut self) -> api::RegisterRequest {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("no registration received")
            .unwrap()
    }

    pub fn try_next_registration(&mut self) -> Option<api::RegisterRequest> {
        self.requests.try_recv().ok()
    }
}

pub async fn plugin_client(socket: impl AsRef<Path>) -> DevicePluginClient<Channel> {
    DevicePluginClient::new(transport::dial(socket).await.unwrap())
}

/// Reads ListAndWatch responses until one satisfies `accept`; intermediate
/// lists may be coalesced away by the sender.
pub async fn wait_for_devices<F>(stream: &mut Streaming<api::ListAndWatchResponse>, accept: F) -> Vec<api::Device>
where
    F: Fn(&[api::Device]) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let response = stream.message().await.unwrap().expect("stream ended");
            let mut devices = response.devices;
            devices.sort_by(|a, b| a.id.cmp(&b.id));
            if accept(&devices) {
                return devices;
            }
        }
    })
    .await
    .expect("expected device list never arrived")
}

pub fn ids(devices: &[api::Device]) -> Vec<&str> {
    devices.iter().map(|d| d.id.as_str()).collect()
}
