//! Device plugin server runtime.
//!
//! Advertises a device inventory to the kubelet over the device plugin
//! protocol and relays allocation requests to caller supplied handlers.
//!
//! - [`PluginSession`] serves one registration: it binds the plugin socket,
//!   registers with the kubelet and streams inventory snapshots.
//! - [`Supervisor`] recreates the session whenever the kubelet restarts.
//!
//! ```rust,ignore
//! let config = PluginConfig::new("example.com/dir", "dir.sock");
//! let handlers = Handlers::new().with_allocate(|ids: &[String]| -> anyhow::Result<_> {
//!     Ok(api::ContainerAllocateResponse::default())
//! });
//! let (tx, rx) = tokio::sync::mpsc::channel(1);
//! tx.send(vec![Device::healthy("dev0")]).await?;
//! deviceplugin::run(config, handlers, rx, None).await?;
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod inventory;
pub mod registration;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod update;
pub mod watch;

pub use config::PluginConfig;
pub use device::{Device, Health};
pub use error::{Error, Result};
pub use handler::{AllocateHandler, Handlers, PreStartHandler, PreferredAllocationHandler};
pub use inventory::DeviceInventory;
pub use session::{PluginSession, SessionState};
pub use supervisor::{run, Supervisor};
pub use watch::{KubeletWatcher, RestartAction, RestartTrigger};
