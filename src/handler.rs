//! Caller-supplied callbacks invoked by the plugin session.
//!
//! Handlers may fail with any error; the failure is returned to the kubelet
//! as the failure of that one RPC and never affects the session itself.
//! Plain closures implement the traits, e.g.
//! `|ids: &[String]| -> anyhow::Result<()> { ... }`.

use crate::api;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Produces the container configuration for one workload's devices.
#[async_trait]
pub trait AllocateHandler: Send + Sync {
    async fn allocate(&self, device_ids: &[String]) -> anyhow::Result<api::ContainerAllocateResponse>;
}

#[async_trait]
impl<F> AllocateHandler for F
where
    F: Fn(&[String]) -> anyhow::Result<api::ContainerAllocateResponse> + Send + Sync,
{
    async fn allocate(&self, device_ids: &[String]) -> anyhow::Result<api::ContainerAllocateResponse> {
        self(device_ids)
    }
}

/// Runs device specific setup before a container starts.
#[async_trait]
pub trait PreStartHandler: Send + Sync {
    async fn pre_start(&self, device_ids: &[String]) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> PreStartHandler for F
where
    F: Fn(&[String]) -> anyhow::Result<()> + Send + Sync,
{
    async fn pre_start(&self, device_ids: &[String]) -> anyhow::Result<()> {
        self(device_ids)
    }
}

/// Picks the preferred devices for one container out of the available ones.
#[async_trait]
pub trait PreferredAllocationHandler: Send + Sync {
    async fn preferred(
        &self,
        request: &api::ContainerPreferredAllocationRequest,
    ) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl<F> PreferredAllocationHandler for F
where
    F: Fn(&api::ContainerPreferredAllocationRequest) -> anyhow::Result<Vec<String>> + Send + Sync,
{
    async fn preferred(
        &self,
        request: &api::ContainerPreferredAllocationRequest,
    ) -> anyhow::Result<Vec<String>> {
        self(request)
    }
}

/// The optional handlers of a plugin session.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) allocate: Option<Arc<dyn AllocateHandler>>,
    pub(crate) pre_start: Option<Arc<dyn PreStartHandler>>,
    pub(crate) preferred: Option<Arc<dyn PreferredAllocationHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocate(mut self, handler: impl AllocateHandler + 'static) -> Self {
        self.allocate = Some(Arc::new(handler));
        self
    }

    pub fn with_pre_start(mut self, handler: impl PreStartHandler + 'static) -> Self {
        self.pre_start = Some(Arc::new(handler));
        self
    }

    pub fn with_preferred_allocation(
        mut self,
        handler: impl PreferredAllocationHandler + 'static,
    ) -> Self {
        self.preferred = Some(Arc::new(handler));
        self
    }

    /// Options announced at registration and returned by the options query.
    pub fn options(&self) -> api::DevicePluginOptions {
        api::DevicePluginOptions {
            pre_start_required: self.pre_start.is_some(),
            get_preferred_allocation_available: self.preferred.is_some(),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("allocate", &self.allocate.is_some())
            .field("pre_start", &self.pre_start.is_some())
            .field("preferred", &self.preferred.is_some())
            .finish()
    }
}
