//! Device inventory with change notification.
//!
//! All reads and writes go through one `RwLock`. A mutation that changes
//! membership or health bumps the generation and takes a snapshot while the
//! write guard is held; the snapshot is handed to the [`UpdateChannel`] only
//! after the guard is released.

use crate::device::Device;
use crate::update::{Snapshot, SnapshotReceiver, UpdateChannel};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct InventoryState {
    generation: u64,
    devices: HashMap<String, Device>,
}

impl InventoryState {
    fn bump(&mut self) -> Snapshot {
        self.generation += 1;
        Snapshot::new(self.generation, self.devices.values().cloned().collect())
    }
}

/// The live device set of one plugin session.
#[derive(Debug, Default)]
pub struct DeviceInventory {
    state: RwLock<InventoryState>,
    updates: UpdateChannel,
}

impl DeviceInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unknown devices and updates the health of known ones.
    ///
    /// Returns true if anything changed. Re-adding a device with the same
    /// health is a no-op and produces no notification.
    pub fn add_or_update<I>(&self, devices: I) -> bool
    where
        I: IntoIterator<Item = Device>,
    {
        let snapshot = {
            let mut state = self.state.write();
            let mut changed = false;
            for device in devices {
                match state.devices.get_mut(&device.id) {
                    Some(existing) => {
                        if existing.health != device.health {
                            trace!(id = %device.id, health = %device.health, "Device health changed");
                            existing.health = device.health;
                            changed = true;
                        }
                    }
                    None => {
                        trace!(id = %device.id, "Device added");
                        state.devices.insert(device.id.clone(), device);
                        changed = true;
                    }
                }
            }
            changed.then(|| state.bump())
        };

        self.hand_off(snapshot)
    }

    /// Removes devices by ID. Returns true if any device was present.
    pub fn remove<I, S>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = {
            let mut state = self.state.write();
            let mut changed = false;
            for id in ids {
                if state.devices.remove(id.as_ref()).is_some() {
                    trace!(id = %id.as_ref(), "Device removed");
                    changed = true;
                }
            }
            changed.then(|| state.bump())
        };

        self.hand_off(snapshot)
    }

    /// Discards the whole set and installs `devices`.
    ///
    /// Always notifies, even if the new set is empty or equal to the old one.
    /// When `devices` repeats an ID the last occurrence wins.
    pub fn replace<I>(&self, devices: I) -> bool
    where
        I: IntoIterator<Item = Device>,
    {
        let snapshot = {
            let mut state = self.state.write();
            state.devices = devices
                .into_iter()
                .map(|device| (device.id.clone(), device))
                .collect();
            Some(state.bump())
        };

        self.hand_off(snapshot)
    }

    /// Copy of the current device list. Order is unspecified.
    pub fn snapshot(&self) -> Vec<Device> {
        self.state.read().devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().devices.contains_key(id)
    }

    /// Number of changes applied so far.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Subscribes to snapshots produced by future mutations.
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.updates.subscribe()
    }

    /// Subscribes and returns the snapshot to push first.
    ///
    /// The initial snapshot is read under the inventory guard, so it reflects
    /// the devices present right now even if no mutation happened yet.
    pub(crate) fn watch(&self) -> (Snapshot, SnapshotReceiver) {
        let mut rx = self.updates.subscribe();
        let state = self.state.read();
        rx.current();
        let initial = Snapshot::new(state.generation, state.devices.values().cloned().collect());
        (initial, rx)
    }

    fn hand_off(&self, snapshot: Option<Snapshot>) -> bool {
        match snapshot {
            Some(snapshot) => {
                debug!(
                    generation = snapshot.generation(),
                    devices = snapshot.len(),
                    "Inventory changed"
                );
                self.updates.publish(snapshot);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Health;
    use std::sync::Arc;

    fn ids(devices: &[Device]) -> Vec<String> {
        let mut ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_add_or_update_is_idempotent() {
        let inventory = DeviceInventory::new();
        assert!(inventory.add_or_update(vec![Device::healthy("a"), Device::healthy("b")]));
        assert!(!inventory.add_or_update(vec![Device::healthy("a")]));
        assert_eq!(inventory.generation(), 1);
        assert_eq!(inventory.len(), 2);
    }

    #[test]
    fn test_add_or_update_changes_health_only() {
        let inventory = DeviceInventory::new();
        inventory.add_or_update(vec![Device::healthy("gpu0").with_numa_nodes([1])]);
        assert!(inventory.add_or_update(vec![Device::unhealthy("gpu0")]));

        let devices = inventory.snapshot();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].health, Health::Unhealthy);
        assert_eq!(devices[0].numa_nodes, vec![1]);
    }

    #[test]
    fn test_remove_flags_only_present_devices() {
        let inventory = DeviceInventory::new();
        inventory.add_or_update(vec![Device::healthy("a")]);
        assert!(!inventory.remove(["missing"]));
        assert!(inventory.remove(["a", "missing"]));
        assert!(inventory.is_empty());
        assert_eq!(inventory.generation(), 2);
    }

    #[test]
    fn test_replace_always_notifies() {
        let inventory = DeviceInventory::new();
        let mut rx = inventory.subscribe();

        assert!(inventory.replace(Vec::new()));
        assert_eq!(rx.current().generation(), 1);

        inventory.replace(vec![Device::healthy("a")]);
        assert!(inventory.replace(vec![Device::healthy("a")]));
        let snapshot = rx.current();
        assert_eq!(snapshot.generation(), 3);
        assert_eq!(ids(snapshot.devices()), vec!["a"]);
    }

    #[test]
    fn test_replace_discards_previous_set() {
        let inventory = DeviceInventory::new();
        inventory.add_or_update(vec![Device::healthy("a"), Device::healthy("b")]);
        inventory.replace(vec![Device::healthy("c")]);
        assert_eq!(ids(&inventory.snapshot()), vec!["c"]);
        assert!(!inventory.contains("a"));
    }

    #[test]
    fn test_watch_returns_current_devices() {
        let inventory = DeviceInventory::new();
        inventory.add_or_update(vec![Device::healthy("a")]);

        let (initial, mut rx) = inventory.watch();
        assert_eq!(ids(initial.devices()), vec!["a"]);

        inventory.remove(["a"]);
        assert_eq!(rx.current().generation(), 2);
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins_under_concurrent_mutation() {
        let inventory = Arc::new(DeviceInventory::new());
        let mut rx = inventory.subscribe();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let inventory = inventory.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                for i in 0..50 {
                    let id = format!("dev-{}-{}", worker, i);
                    inventory.add_or_update(vec![Device::healthy(id.clone())]);
                    if i % 2 == 0 {
                        inventory.remove([id]);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let published = rx.current();
        assert_eq!(published.generation(), inventory.generation());
        assert_eq!(ids(published.devices()), ids(&inventory.snapshot()));
        assert_eq!(published.len(), 8 * 25);
    }
}
