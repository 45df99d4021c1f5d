// Copyright 2026 Vidyut Team
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

//! Registry of discovered and bonded devices.

use bluer::Address;

/// A Bluetooth device as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: Address,
    /// Advertised name, if the device reported one.
    pub name: Option<String>,
}

impl DeviceInfo {
    pub fn new(address: Address, name: Option<String>) -> Self {
        Self { address, name }
    }

    /// Display label: the name when known, the address otherwise.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.address.to_string(),
        }
    }
}

/// Insertion-ordered device list, deduplicated by address.
///
/// Bonded-device enumeration and discovery both merge into the same
/// list, so the same device may be offered many times.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device unless its address is already present.
    /// Returns true if the device was new.
    pub fn insert(&mut self, device: DeviceInfo) -> bool {
        if self.devices.iter().any(|d| d.address == device.address) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn get(&self, index: usize) -> Option<&DeviceInfo> {
        self.devices.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}
