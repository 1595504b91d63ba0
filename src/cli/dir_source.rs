//! Sample device source: every directory under a root is one device.
//!
//! The source rescans the root whenever an entry is created, removed or
//! renamed and pushes the full list to the supervisor. Allocation bind-mounts
//! `root/<id>` to `container_path/<id>`.

use crate::api;
use crate::config::DeviceSourceConfig;
use crate::device::Device;
use crate::handler::AllocateHandler;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct DirDeviceSource {
    root: PathBuf,
    container_path: PathBuf,
}

impl DirDeviceSource {
    /// Creates the source, creating `root` if it does not exist yet.
    pub fn new(config: &DeviceSourceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("Failed to create device root {}", config.root.display()))?;
        Ok(Self {
            root: config.root.clone(),
            container_path: config.container_path.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the directories under the root as healthy devices, sorted by ID.
    pub fn scan(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => devices.push(Device::healthy(name)),
                Err(name) => warn!(name = ?name, "Skipping device directory with non UTF-8 name"),
            }
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    pub fn allocator(&self) -> DirAllocator {
        DirAllocator {
            root: self.root.clone(),
            container_path: self.container_path.clone(),
        }
    }

    /// Pushes the device list now and after every relevant change, until the
    /// receiving side goes away.
    pub async fn run(self, updates: mpsc::Sender<Vec<Device>>) -> Result<()> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .context("Failed to create filesystem watcher")?;
        watcher
            .watch(&self.root, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.root.display()))?;
        info!(root = %self.root.display(), "Watching device directory");

        if updates.send(self.scan()?).await.is_err() {
            return Ok(());
        }

        while let Some(res) = events.recv().await {
            match res {
                Ok(event) if changes_membership(&event.kind) => {
                    let devices = self.scan()?;
                    debug!(devices = devices.len(), "Device directory changed");
                    if updates.send(devices).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Device directory watch error"),
            }
        }
        Ok(())
    }
}

fn changes_membership(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Mounts each allocated device directory into the container.
#[derive(Debug, Clone)]
pub struct DirAllocator {
    root: PathBuf,
    container_path: PathBuf,
}

impl DirAllocator {
    fn mount_for(&self, id: &str) -> Result<api::Mount> {
        if id.is_empty() || id == "." || id == ".." || id.contains('/') {
            bail!("invalid device id {:?}", id);
        }
        let host_path = self.root.join(id);
        if !host_path.is_dir() {
            bail!("device {} does not exist under {}", id, self.root.display());
        }
        Ok(api::Mount {
            container_path: self.container_path.join(id).to_string_lossy().into_owned(),
            host_path: host_path.to_string_lossy().into_owned(),
            read_only: false,
        })
    }
}

#[async_trait]
impl AllocateHandler for DirAllocator {
    async fn allocate(&self, device_ids: &[String]) -> Result<api::ContainerAllocateResponse> {
        let mounts = device_ids
            .iter()
            .map(|id| self.mount_for(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(api::ContainerAllocateResponse {
            mounts,
            ..Default::default()
        })
    }
}
