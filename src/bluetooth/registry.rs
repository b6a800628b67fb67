// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Paired and scanned device lists.

use tokio::sync::watch;
use tracing::{debug, warn};

use super::device::{Address, Device};
use super::radio::{Capability, PermissionCheck, Radio};
use crate::state::StateCell;

/// Known devices: the bonded list and everything seen while scanning.
///
/// Scanned devices are never removed; a device that goes out of range
/// stays listed for the lifetime of the registry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    paired: StateCell<Vec<Device>>,
    scanned: StateCell<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the paired list with the radio's current bonded devices.
    ///
    /// Without the scan capability this is a no-op and the previous
    /// snapshot is returned.
    pub async fn refresh_paired(
        &self,
        radio: &dyn Radio,
        permissions: &dyn PermissionCheck,
    ) -> Vec<Device> {
        if !permissions.has_capability(Capability::Scan) {
            debug!("Scan permission missing, keeping paired snapshot");
            return self.paired.get();
        }

        match radio.bonded_devices().await {
            Ok(devices) => {
                debug!("Paired devices refreshed: {}", devices.len());
                self.paired.set(devices.clone());
                devices
            }
            Err(e) => {
                warn!("Failed to enumerate bonded devices: {}", e);
                self.paired.get()
            }
        }
    }

    /// Record a device found by discovery. Returns true if it was new.
    pub fn record_scanned(&self, device: Device) -> bool {
        self.scanned.update(|devices| {
            if devices.iter().any(|d| d.address == device.address) {
                false
            } else {
                debug!("Device found: {}", device);
                devices.push(device);
                true
            }
        })
    }

    pub fn is_paired(&self, address: &Address) -> bool {
        self.paired.get().iter().any(|d| d.address == *address)
    }

    pub fn paired(&self) -> Vec<Device> {
        self.paired.get()
    }

    pub fn scanned(&self) -> Vec<Device> {
        self.scanned.get()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<Device>> {
        self.paired.subscribe()
    }

    pub fn watch_scanned(&self) -> watch::Receiver<Vec<Device>> {
        self.scanned.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory::MemoryAir;
    use crate::bluetooth::radio::AllowAll;

    fn device(last: u8, name: &str) -> Device {
        Device::new(Address::new([0, 0, 0, 0, 0, last]), name)
    }

    #[test]
    fn test_record_scanned_dedupes_and_keeps_order() {
        let registry = DeviceRegistry::new();
        let sequence = [
            device(3, "c"),
            device(1, "a"),
            device(3, "c again"),
            device(2, "b"),
            device(1, ""),
        ];

        let fresh: Vec<bool> = sequence
            .iter()
            .cloned()
            .map(|d| registry.record_scanned(d))
            .collect();
        assert_eq!(fresh, vec![true, true, false, true, false]);

        let scanned = registry.scanned();
        let addresses: Vec<u8> = scanned.iter().map(|d| d.address.0[5]).collect();
        assert_eq!(addresses, vec![3, 1, 2]);
        // first sighting wins
        assert_eq!(scanned[0].name, "c");
    }

    #[tokio::test]
    async fn test_refresh_paired_replaces_list() {
        let air = MemoryAir::new();
        let radio = air.radio(Address::new([9; 6]), "local");
        let registry = DeviceRegistry::new();

        radio.set_bonded(vec![device(1, "a"), device(2, "b")]);
        let first = registry.refresh_paired(&radio, &AllowAll).await;
        assert_eq!(first.len(), 2);

        radio.set_bonded(vec![device(3, "c")]);
        let second = registry.refresh_paired(&radio, &AllowAll).await;
        assert_eq!(second, vec![device(3, "c")]);
        assert_eq!(registry.paired(), vec![device(3, "c")]);
        assert!(registry.is_paired(&device(3, "").address));
        assert!(!registry.is_paired(&device(1, "").address));
    }

    #[tokio::test]
    async fn test_refresh_paired_without_permission_is_noop() {
        let air = MemoryAir::new();
        let radio = air.radio(Address::new([9; 6]), "local");
        let registry = DeviceRegistry::new();

        radio.set_bonded(vec![device(1, "a")]);
        registry.refresh_paired(&radio, &AllowAll).await;

        radio.set_bonded(vec![device(2, "b")]);
        let deny_scan = |cap: Capability| cap != Capability::Scan;
        let result = registry.refresh_paired(&radio, &deny_scan).await;
        assert_eq!(result, vec![device(1, "a")]);
        assert_eq!(registry.paired(), vec![device(1, "a")]);
    }
}
