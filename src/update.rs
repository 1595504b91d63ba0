//! Single-slot snapshot handoff between inventory mutators and publishers.
//!
//! The slot always holds the newest full device list. Mutators never block:
//! a snapshot that has not been picked up yet is overwritten by the next one,
//! and each snapshot carries the generation it was taken at so a slow
//! mutator can never replace a newer snapshot with an older one.

use crate::api;
use crate::device::Device;
use std::sync::Arc;
use tokio::sync::watch;

/// The full device list at one instant.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    generation: u64,
    devices: Arc<Vec<Device>>,
}

impl Snapshot {
    pub(crate) fn new(generation: u64, devices: Vec<Device>) -> Self {
        Self {
            generation,
            devices: Arc::new(devices),
        }
    }

    /// Monotonic counter of inventory changes this snapshot reflects.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn to_response(&self) -> api::ListAndWatchResponse {
        api::ListAndWatchResponse {
            devices: self.devices.iter().map(api::Device::from).collect(),
        }
    }
}

/// Producer side of the update channel.
#[derive(Debug)]
pub struct UpdateChannel {
    slot: watch::Sender<Snapshot>,
}

impl Default for UpdateChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateChannel {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Snapshot::default());
        Self { slot }
    }

    /// Hands a snapshot to the publishers.
    ///
    /// Returns false when the slot already holds a snapshot of the same or a
    /// later generation.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        self.slot.send_if_modified(|current| {
            if snapshot.generation > current.generation {
                *current = snapshot;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> SnapshotReceiver {
        SnapshotReceiver {
            rx: self.slot.subscribe(),
        }
    }

    /// The snapshot currently held in the slot.
    pub fn latest(&self) -> Snapshot {
        self.slot.borrow().clone()
    }
}

/// Consumer side of the update channel, one per subscription.
#[derive(Debug)]
pub struct SnapshotReceiver {
    rx: watch::Receiver<Snapshot>,
}

impl SnapshotReceiver {
    /// Takes the current snapshot and marks it as seen.
    pub fn current(&mut self) -> Snapshot {
        self.rx.borrow_and_update().clone()
    }

    /// Waits for a snapshot newer than the last one seen.
    ///
    /// Returns `None` once the channel has been dropped.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_snapshot_is_rejected() {
        let channel = UpdateChannel::new();
        assert!(channel.publish(Snapshot::new(2, vec![Device::healthy("b")])));
        assert!(!channel.publish(Snapshot::new(1, vec![Device::healthy("a")])));

        let latest = channel.latest();
        assert_eq!(latest.generation(), 2);
        assert_eq!(latest.devices()[0].id, "b");
    }

    #[tokio::test]
    async fn test_receiver_sees_only_latest() {
        let channel = UpdateChannel::new();
        let mut rx = channel.subscribe();
        assert_eq!(rx.current().generation(), 0);

        channel.publish(Snapshot::new(1, vec![Device::healthy("a")]));
        channel.publish(Snapshot::new(2, vec![Device::healthy("a"), Device::healthy("b")]));

        let snapshot = rx.next().await.unwrap();
        assert_eq!(snapshot.generation(), 2);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_receiver_ends_when_channel_dropped() {
        let channel = UpdateChannel::new();
        let mut rx = channel.subscribe();
        rx.current();
        drop(channel);
        assert!(rx.next().await.is_none());
    }
}
