//! Keeps a plugin session alive across kubelet restarts.
//!
//! The supervisor starts a session, waits for a restart trigger, stops the
//! session and starts a fresh one with the same configuration, forever. A
//! session that fails to start ends the run: bind and registration failures
//! are not transient at this level.

use crate::config::PluginConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handler::Handlers;
use crate::session::PluginSession;
use crate::watch::{KubeletWatcher, RestartAction, RestartTrigger};
use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Supervisor {
    config: PluginConfig,
    handlers: Handlers,
    updates: Option<mpsc::Receiver<Vec<Device>>>,
    triggers: Vec<Box<dyn RestartTrigger>>,
    watch_kubelet: bool,
    last_devices: Option<Vec<Device>>,
    sessions: watch::Sender<Option<Arc<PluginSession>>>,
}

impl Supervisor {
    pub fn new(config: PluginConfig, handlers: Handlers) -> Self {
        let (sessions, _) = watch::channel(None);
        Self {
            config,
            handlers,
            updates: None,
            triggers: Vec::new(),
            watch_kubelet: true,
            last_devices: None,
            sessions,
        }
    }

    /// Feed of full device lists; each one replaces the session inventory.
    pub fn with_updates(mut self, updates: mpsc::Receiver<Vec<Device>>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Control channel: `true` restarts the session, `false` ends the run.
    pub fn with_control(self, control: mpsc::Receiver<bool>) -> Self {
        self.with_trigger(control)
    }

    pub fn with_trigger(mut self, trigger: impl RestartTrigger + 'static) -> Self {
        self.triggers.push(Box::new(trigger));
        self
    }

    /// Disables the built-in kubelet socket watcher.
    pub fn without_kubelet_watch(mut self) -> Self {
        self.watch_kubelet = false;
        self
    }

    /// Observes the session currently being served, `None` between sessions.
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<PluginSession>>> {
        self.sessions.subscribe()
    }

    /// Runs until a trigger asks to exit or a session fails to start.
    pub async fn run(mut self) -> Result<()> {
        self.config.validate()?;

        let mut triggers = std::mem::take(&mut self.triggers);
        if self.watch_kubelet {
            let watcher = KubeletWatcher::new(self.config.kubelet_socket())?;
            debug!(socket = %watcher.socket().display(), "Restarting on kubelet socket recreation");
            triggers.insert(0, Box::new(watcher));
        }
        if triggers.is_empty() {
            return Err(Error::Config(
                "supervisor needs at least one restart trigger".to_string(),
            ));
        }

        let mut generation = 0u64;
        loop {
            generation += 1;
            let session = Arc::new(PluginSession::new(self.config.clone(), self.handlers.clone())?);
            if let Some(devices) = &self.last_devices {
                session.replace(devices.iter().cloned());
            }

            if let Err(e) = session.start().await {
                warn!(error = %e, generation, "Failed to start device plugin session");
                return Err(e);
            }
            info!(generation, resource = %self.config.resource_name, "Device plugin session running");
            self.sessions.send_replace(Some(session.clone()));

            let action = self.serve(&session, &mut triggers).await;

            self.sessions.send_replace(None);
            if let Err(e) = session.stop().await {
                warn!(error = %e, "Session did not stop cleanly");
            }

            match action? {
                RestartAction::Restart => {
                    info!(generation, "Restarting device plugin session");
                }
                RestartAction::Exit => {
                    info!("Device plugin supervisor exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Forwards device updates into `session` until a trigger fires.
    async fn serve(
        &mut self,
        session: &PluginSession,
        triggers: &mut [Box<dyn RestartTrigger>],
    ) -> Result<RestartAction> {
        loop {
            tokio::select! {
                (action, _, _) = select_all(triggers.iter_mut().map(|trigger| trigger.wait())) => {
                    return action;
                }
                update = next_update(&mut self.updates) => match update {
                    Some(devices) => {
                        debug!(devices = devices.len(), "Received device list");
                        session.replace(devices.iter().cloned());
                        self.last_devices = Some(devices);
                    }
                    None => {
                        debug!("Device update feed closed");
                        self.updates = None;
                    }
                },
            }
        }
    }
}

/// Next device list from the feed; never resolves when there is no feed.
async fn next_update(updates: &mut Option<mpsc::Receiver<Vec<Device>>>) -> Option<Vec<Device>> {
    match updates {
        Some(updates) => updates.recv().await,
        None => futures::future::pending().await,
    }
}

/// Runs a supervised device plugin fed by `updates` until `control` says to
/// exit or a session fails to start.
pub async fn run(
    config: PluginConfig,
    handlers: Handlers,
    updates: mpsc::Receiver<Vec<Device>>,
    control: Option<mpsc::Receiver<bool>>,
) -> Result<()> {
    let mut supervisor = Supervisor::new(config, handlers).with_updates(updates);
    if let Some(control) = control {
        supervisor = supervisor.with_control(control);
    }
    supervisor.run().await
}
