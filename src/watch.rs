//! Restart triggers for the session supervisor.
//!
//! A trigger resolves when the running session should be torn down, either
//! to be recreated ([`RestartAction::Restart`]) or for good
//! ([`RestartAction::Exit`]).

use crate::error::{Error, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    Restart,
    Exit,
}

/// A source of restart conditions.
///
/// `wait` must be cancel safe: the supervisor drops the pending future
/// whenever another trigger fires first.
#[async_trait]
pub trait RestartTrigger: Send {
    async fn wait(&mut self) -> Result<RestartAction>;
}

/// Watches for the kubelet socket being recreated, which happens every time
/// the kubelet restarts and forgets all registrations.
pub struct KubeletWatcher {
    socket: PathBuf,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl KubeletWatcher {
    pub fn new(socket: impl Into<PathBuf>) -> Result<Self> {
        let mut socket = socket.into();
        // Events carry absolute paths once the directory is watched by one.
        if socket.is_relative() {
            socket = std::env::current_dir()?.join(socket);
        }
        // Watch the directory: the socket inode itself is replaced on restart.
        let dir = socket
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(socket = %socket.display(), "Watching kubelet socket for restarts");
        Ok(Self {
            socket,
            events,
            _watcher: watcher,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn is_recreated(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == &self.socket)
    }
}

impl fmt::Debug for KubeletWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeletWatcher")
            .field("socket", &self.socket)
            .finish()
    }
}

#[async_trait]
impl RestartTrigger for KubeletWatcher {
    async fn wait(&mut self) -> Result<RestartAction> {
        loop {
            match self.events.recv().await {
                Some(Ok(event)) if self.is_recreated(&event) => {
                    info!("Kubelet restarted, restarting device plugin");
                    return Ok(RestartAction::Restart);
                }
                Some(Ok(event)) => debug!(kind = ?event.kind, paths = ?event.paths, "Ignoring filesystem event"),
                Some(Err(e)) => warn!(error = %e, "Filesystem watch error"),
                None => return Err(Error::Watch("filesystem watcher stopped".to_string())),
            }
        }
    }
}

/// Control channel: `true` restarts the session, `false` ends the run.
/// A closed channel ends the run as well.
#[async_trait]
impl RestartTrigger for mpsc::Receiver<bool> {
    async fn wait(&mut self) -> Result<RestartAction> {
        match self.recv().await {
            Some(true) => {
                info!("Stopped by signal, will restart");
                Ok(RestartAction::Restart)
            }
            Some(false) => {
                info!("Exit by signal");
                Ok(RestartAction::Exit)
            }
            None => {
                info!("Control channel closed, exiting");
                Ok(RestartAction::Exit)
            }
        }
    }
}
