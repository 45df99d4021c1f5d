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

//! Event processing and user-action routing.
//!
//! Sits between the connection manager and the frontend: manager
//! events update the shared state, user verbs call into the manager,
//! and every failure becomes a transient notification instead of an
//! error that escapes.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bluetooth::constants::{DEVICE_NAME, LED_OFF, LED_ON};
use crate::bluetooth::{BluetoothManager, DeviceInfo, ManagerEvent};
use crate::state::AppState;

/// Process events from the connection manager and route user verbs.
pub struct EventProcessor {
    manager: Arc<BluetoothManager>,
    state: Arc<AppState>,
    notice_tx: mpsc::Sender<String>,
    /// Label of the device the last connect attempt targeted.
    target_label: RwLock<Option<String>>,
}

impl EventProcessor {
    pub fn new(
        manager: Arc<BluetoothManager>,
        state: Arc<AppState>,
        notice_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            manager,
            state,
            notice_tx,
            target_label: RwLock::new(None),
        }
    }

    /// Process a single manager event.
    pub async fn process_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::DeviceDiscovered(device) => {
                debug!("Registry grew: {}", device.label());
            }
            ManagerEvent::ConnectionChanged(connected) => {
                let label = self.target_label.read().clone();
                Self::apply_connection_change(&self.state, connected, label);
                info!(
                    "Connection signal: {}",
                    if connected { "connected" } else { "disconnected" }
                );
            }
        }
    }

    /// Fold a connected-signal change into the shared state. Any
    /// settled signal also leaves the Connecting status behind.
    fn apply_connection_change(state: &AppState, connected: bool, label: Option<String>) {
        if connected {
            state.set_connected(label.unwrap_or_else(|| DEVICE_NAME.to_string()));
        } else {
            state.set_disconnected();
        }
    }

    /// Enumerate bonded devices and start a scan. Returns whether the
    /// device list is worth showing.
    pub async fn scan_devices(&self) -> bool {
        if self.manager.is_connected() {
            self.notify("Bluetooth is already connected").await;
            return false;
        }

        match self.manager.list_paired_devices().await {
            Ok(()) => true,
            Err(err) => {
                self.notify(err.to_string()).await;
                false
            }
        }
    }

    /// Connect to the chosen device.
    pub async fn connect(&self, device: &DeviceInfo) {
        self.state.set_connecting();
        *self.target_label.write() = Some(device.label());

        if let Err(err) = self.manager.connect(device).await {
            self.state.set_disconnected();
            *self.target_label.write() = None;
            self.notify(err.to_string()).await;
        }
    }

    pub async fn turn_led_on(&self) {
        if let Err(err) = self.manager.write(&[LED_ON]).await {
            self.notify(err.to_string()).await;
        }
    }

    pub async fn turn_led_off(&self) {
        if let Err(err) = self.manager.write(&[LED_OFF]).await {
            self.notify(err.to_string()).await;
        }
    }

    async fn notify(&self, message: impl Into<String>) {
        let _ = self.notice_tx.send(message.into()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionStatus;

    #[test]
    fn test_connection_change_updates_state() {
        let state = AppState::new();
        state.set_connecting();

        EventProcessor::apply_connection_change(&state, true, Some("Vidyut".into()));
        assert_eq!(state.get_status(), ConnectionStatus::Connected);
        assert_eq!(state.get_device_name().as_deref(), Some("Vidyut"));

        EventProcessor::apply_connection_change(&state, false, None);
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);
        assert_eq!(state.get_device_name(), None);
    }

    #[test]
    fn test_connection_change_clears_connecting() {
        let state = AppState::new();

        // The signal settling false while an attempt is shown as
        // Connecting must not leave the frontend stuck there
        state.set_connecting();
        EventProcessor::apply_connection_change(&state, false, None);
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connection_change_without_label_falls_back() {
        let state = AppState::new();
        EventProcessor::apply_connection_change(&state, true, None);
        assert_eq!(state.get_device_name().as_deref(), Some(DEVICE_NAME));
    }
}
