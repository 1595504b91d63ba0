//! Plugin session: the `DevicePlugin` gRPC service and its lifecycle.
//!
//! A session owns the device inventory, the unix socket listener and the
//! ListAndWatch publishers. Its lifecycle is
//!
//! ```text
//! Stopped -> Starting -> Registered -> Serving -> Stopping -> Stopped
//!               |                                   ^
//!               +------ registration failure -------+
//! ```
//!
//! `Serving` means at least one ListAndWatch subscription is open; the
//! session falls back to `Registered` when the last one goes away.

use crate::api::{self, device_plugin_server::{DevicePlugin, DevicePluginServer}};
use crate::config::PluginConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::inventory::DeviceInventory;
use crate::registration;
use crate::transport;
use crate::update::{Snapshot, SnapshotReceiver};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// How long `stop` waits for in-flight RPCs before aborting the server.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    /// Listener bound and accepting connections
    Starting,
    /// Kubelet accepted the registration
    Registered,
    /// A ListAndWatch subscription is open
    Serving,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Registered => "registered",
            SessionState::Serving => "serving",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct Shared {
    config: PluginConfig,
    handlers: Handlers,
    inventory: DeviceInventory,
    state: watch::Sender<SessionState>,
    subscribers: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    /// Moves to `to` only while the session is in one of `from`.
    fn advance(&self, from: &[SessionState], to: SessionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(to = %to, "Session state changed");
        }
        changed
    }
}

struct Running {
    stop: CancellationToken,
    server: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

/// One run of the device plugin server, from listener bind to teardown.
pub struct PluginSession {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl PluginSession {
    /// Creates a stopped session with an empty inventory.
    pub fn new(config: PluginConfig, handlers: Handlers) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Stopped);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handlers,
                inventory: DeviceInventory::new(),
                state,
                subscribers: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.shared.config
    }

    pub fn socket_path(&self) -> PathBuf {
        self.shared.config.socket_path()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn inventory(&self) -> &DeviceInventory {
        &self.shared.inventory
    }

    pub fn add_or_update(&self, devices: impl IntoIterator<Item = Device>) -> bool {
        self.shared.inventory.add_or_update(devices)
    }

    pub fn remove<S: AsRef<str>>(&self, ids: impl IntoIterator<Item = S>) -> bool {
        self.shared.inventory.remove(ids)
    }

    pub fn replace(&self, devices: impl IntoIterator<Item = Device>) -> bool {
        self.shared.inventory.replace(devices)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.shared.inventory.snapshot()
    }

    /// Binds the plugin socket, starts serving and registers with the kubelet.
    ///
    /// On failure everything acquired so far is torn down before the error is
    /// returned.
    pub async fn start(&self) -> Result<()> {
        let stop = self.listen()?;

        if let Err(e) = self.bootstrap(&stop).await {
            let e = if stop.is_cancelled() { stopped_during_start() } else { e };
            warn!(error = %e, "Could not start device plugin");
            if let Err(stop_err) = self.stop().await {
                warn!(error = %stop_err, "Cleanup after failed start did not complete");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Binds the socket and spawns the server. The state change and the
    /// `running` slot are updated under one lock so `stop` sees either both
    /// or neither.
    fn listen(&self) -> Result<CancellationToken> {
        let mut running = self.running.lock();
        if !self.shared.advance(&[SessionState::Stopped], SessionState::Starting) {
            return Err(Error::Session(format!(
                "cannot start a session that is {}",
                self.state()
            )));
        }

        let socket = self.socket_path();
        let listener = match transport::bind(&socket) {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.set_state(SessionState::Stopped);
                return Err(e);
            }
        };

        let stop = CancellationToken::new();
        let service = DevicePluginService {
            shared: self.shared.clone(),
            stop: stop.clone(),
        };
        let shutdown = stop.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .await
        });
        *running = Some(Running {
            stop: stop.clone(),
            server,
        });
        info!(socket = %socket.display(), "Starting to serve");
        Ok(stop)
    }

    async fn bootstrap(&self, stop: &CancellationToken) -> Result<()> {
        let socket = self.socket_path();
        // The kubelet dials back as soon as it learns the endpoint.
        drop(transport::dial(&socket).await?);
        debug!(socket = %socket.display(), "Plugin socket accepts connections");

        let options = self.shared.handlers.options();
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(stopped_during_start()),
            registered = registration::register(&self.shared.config, options) => registered?,
        }

        if !self
            .shared
            .advance(&[SessionState::Starting], SessionState::Registered)
        {
            return Err(stopped_during_start());
        }
        Ok(())
    }

    /// Stops serving, removes the socket and discards the inventory.
    ///
    /// Safe to call repeatedly and on a session that never started.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().take() else {
            return Ok(());
        };

        self.shared.set_state(SessionState::Stopping);
        running.stop.cancel();

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut running.server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Plugin server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "Plugin server task failed"),
            Err(_) => {
                warn!("Plugin server did not shut down in time, aborting");
                running.server.abort();
            }
        }

        let result = transport::remove_stale_socket(&self.socket_path());
        // Devices do not outlive the session.
        self.shared.inventory.replace(std::iter::empty());
        self.shared.set_state(SessionState::Stopped);
        info!(socket = %self.socket_path().display(), "Device plugin stopped");
        result
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop.cancel();
            running.server.abort();
            let _ = transport::remove_stale_socket(&self.shared.config.socket_path());
        }
    }
}

impl fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSession")
            .field("resource_name", &self.shared.config.resource_name)
            .field("socket", &self.shared.config.socket_path())
            .field("state", &self.state())
            .field("handlers", &self.shared.handlers)
            .finish()
    }
}

/// The gRPC face of a running session.
#[derive(Clone)]
struct DevicePluginService {
    shared: Arc<Shared>,
    stop: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream = ReceiverStream<std::result::Result<api::ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> std::result::Result<Response<api::DevicePluginOptions>, Status> {
        Ok(Response::new(self.shared.handlers.options()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        if self.stop.is_cancelled() {
            return Err(Status::unavailable("device plugin is stopping"));
        }

        let (initial, updates) = self.shared.inventory.watch();
        // One slot: the publisher never gets more than one response ahead.
        let (tx, rx) = mpsc::channel(1);
        let publisher = Publisher {
            shared: self.shared.clone(),
            stop: self.stop.clone(),
            updates,
            tx,
        };
        tokio::spawn(publisher.run(initial));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<api::PreferredAllocationRequest>,
    ) -> std::result::Result<Response<api::PreferredAllocationResponse>, Status> {
        let Some(handler) = &self.shared.handlers.preferred else {
            return Err(Status::unimplemented("preferred allocation is not supported"));
        };

        let request = request.into_inner();
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in &request.container_requests {
            let device_ids = handler.preferred(container).await.map_err(|e| {
                warn!(error = %e, "Preferred allocation handler failed");
                Status::unknown(format!("preferred allocation failed: {:#}", e))
            })?;
            container_responses.push(api::ContainerPreferredAllocationResponse { device_ids });
        }
        Ok(Response::new(api::PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> std::result::Result<Response<api::AllocateResponse>, Status> {
        let request = request.into_inner();
        debug!(containers = request.container_requests.len(), "Allocate");

        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for (index, container) in request.container_requests.iter().enumerate() {
            let response = match &self.shared.handlers.allocate {
                Some(handler) => handler.allocate(&container.devices_ids).await.map_err(|e| {
                    warn!(error = %e, container = index, devices = ?container.devices_ids, "Allocation handler failed");
                    Status::unknown(format!(
                        "allocation failed for container request {}: {:#}",
                        index, e
                    ))
                })?,
                None => api::ContainerAllocateResponse::default(),
            };
            container_responses.push(response);
        }

        Ok(Response::new(api::AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<api::PreStartContainerRequest>,
    ) -> std::result::Result<Response<api::PreStartContainerResponse>, Status> {
        if let Some(handler) = &self.shared.handlers.pre_start {
            let request = request.into_inner();
            handler.pre_start(&request.devices_ids).await.map_err(|e| {
                warn!(error = %e, devices = ?request.devices_ids, "PreStartContainer handler failed");
                Status::unknown(format!("pre-start failed: {:#}", e))
            })?;
        }
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}

fn stopped_during_start() -> Error {
    Error::Session("stopped during start".to_string())
}

/// Why a publisher stopped pushing.
#[derive(Debug)]
enum PublishError {
    Stopped,
    Disconnected,
}

/// Pushes snapshots of one ListAndWatch subscription.
struct Publisher {
    shared: Arc<Shared>,
    stop: CancellationToken,
    updates: SnapshotReceiver,
    tx: mpsc::Sender<std::result::Result<api::ListAndWatchResponse, Status>>,
}

impl Publisher {
    async fn run(mut self, initial: Snapshot) {
        let _subscription = Subscription::open(self.shared.clone());
        info!(devices = initial.len(), "ListAndWatch subscription opened");

        let mut pushed = initial.generation();
        let mut outcome = self.push(&initial).await;

        while outcome.is_ok() {
            let snapshot = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Err(PublishError::Stopped),
                _ = self.tx.closed() => Err(PublishError::Disconnected),
                next = self.updates.next() => next.ok_or(PublishError::Stopped),
            };
            outcome = match snapshot {
                Ok(snapshot) if snapshot.generation() <= pushed => Ok(()),
                Ok(snapshot) => {
                    pushed = snapshot.generation();
                    self.push(&snapshot).await
                }
                Err(e) => Err(e),
            };
        }

        match outcome {
            Err(PublishError::Disconnected) => info!("ListAndWatch subscriber disconnected"),
            _ => debug!("ListAndWatch subscription closed by session stop"),
        }
    }

    async fn push(&self, snapshot: &Snapshot) -> std::result::Result<(), PublishError> {
        debug!(generation = snapshot.generation(), devices = snapshot.len(), "Pushing devices");
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(PublishError::Stopped),
            sent = self.tx.send(Ok(snapshot.to_response())) => {
                sent.map_err(|_| PublishError::Disconnected)
            }
        }
    }
}

/// Keeps the session in `Serving` while at least one subscription is open.
struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    fn open(shared: Arc<Shared>) -> Self {
        shared.subscribers.fetch_add(1, Ordering::SeqCst);
        shared.advance(
            &[SessionState::Starting, SessionState::Registered],
            SessionState::Serving,
        );
        Self { shared }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.shared.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared
                .advance(&[SessionState::Serving], SessionState::Registered);
        }
    }
}
