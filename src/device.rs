//! Domain device model.

use crate::api;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a device as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => api::HEALTHY,
            Health::Unhealthy => api::UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An allocatable device.
///
/// The ID and topology are fixed once the device has been observed; only
/// the health may change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub health: Health,
    /// NUMA nodes the device is attached to. Empty means no topology hint.
    #[serde(default)]
    pub numa_nodes: Vec<i64>,
}

impl Device {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
            numa_nodes: Vec::new(),
        }
    }

    pub fn healthy(id: impl Into<String>) -> Self {
        Self::new(id, Health::Healthy)
    }

    pub fn unhealthy(id: impl Into<String>) -> Self {
        Self::new(id, Health::Unhealthy)
    }

    pub fn with_numa_nodes(mut self, nodes: impl IntoIterator<Item = i64>) -> Self {
        self.numa_nodes = nodes.into_iter().collect();
        self
    }
}

impl From<&Device> for api::Device {
    fn from(device: &Device) -> Self {
        let topology = if device.numa_nodes.is_empty() {
            None
        } else {
            Some(api::TopologyInfo {
                nodes: device
                    .numa_nodes
                    .iter()
                    .map(|&id| api::NumaNode { id })
                    .collect(),
            })
        };

        api::Device {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology,
        }
    }
}
