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

//! Device registry and RFCOMM connection manager.
//!
//! At most one connection is active at a time. The connected signal
//! is a watch channel driven both by `connect`/`clear` and by BlueZ
//! property notifications for the currently targeted device, so it
//! can flip to false without any call failing first.

use std::sync::Arc;

use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::constants::SPP_UUID;
use super::registry::{DeviceInfo, DeviceRegistry};
use super::{BluetoothError, Permission};

/// Events pushed to the observing layer.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A new device entered the registry (bonded enumeration or scan).
    DeviceDiscovered(DeviceInfo),
    /// The connected signal changed value.
    ConnectionChanged(bool),
}

/// Runtime permission grants consulted before Bluetooth operations.
///
/// BlueZ authorization is ambient (polkit / group membership), so the
/// binary runs with everything granted; the gate keeps permission
/// absence an expected, testable condition rather than an opaque
/// D-Bus failure.
#[derive(Debug, Clone, Copy)]
pub struct Permissions {
    connect: bool,
    scan: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            connect: true,
            scan: true,
        }
    }
}

impl Permissions {
    pub fn granted() -> Self {
        Self::default()
    }

    /// Revoke a single permission.
    pub fn deny(mut self, permission: Permission) -> Self {
        match permission {
            Permission::Connect => self.connect = false,
            Permission::Scan => self.scan = false,
        }
        self
    }

    fn check(&self, permission: Permission) -> Result<(), BluetoothError> {
        let granted = match permission {
            Permission::Connect => self.connect,
            Permission::Scan => self.scan,
        };
        if granted {
            Ok(())
        } else {
            Err(BluetoothError::PermissionDenied(permission))
        }
    }
}

/// Decide how a connection notification affects the connected signal.
///
/// Only notifications for the currently targeted device count;
/// anything else is ignored.
fn connection_signal(current: Option<Address>, device: Address, connected: bool) -> Option<bool> {
    match current {
        Some(target) if target == device => Some(connected),
        _ => None,
    }
}

/// Name allow-list applied before any socket is opened.
fn is_expected_peripheral(expected: &str, device: &DeviceInfo) -> bool {
    device.name.as_deref() == Some(expected)
}

/// All checks a connect attempt must pass before a socket is opened:
/// the name allow-list, both permission grants, and the
/// single-connection rule (an existing connection must be torn down
/// first, never silently replaced).
fn connect_preflight(
    expected: &str,
    device: &DeviceInfo,
    permissions: &Permissions,
    connected: bool,
) -> Result<(), BluetoothError> {
    if !is_expected_peripheral(expected, device) {
        return Err(BluetoothError::NameMismatch {
            expected: expected.to_string(),
        });
    }
    permissions.check(Permission::Connect)?;
    permissions.check(Permission::Scan)?;
    if connected {
        return Err(BluetoothError::AlreadyConnected);
    }
    Ok(())
}

/// Holder of the single optional socket.
///
/// A second connect attempt while one is in flight is rejected
/// instead of overwriting (and leaking) the first socket. Each
/// attempt gets a token from `begin`; `complete` and `abort` only
/// act for the attempt that owns the token, so an attempt overtaken
/// by `clear()` cannot resurrect connection state afterwards.
#[derive(Debug)]
struct ConnectionSlot<S> {
    stream: Option<S>,
    attempt: u64,
    in_flight: bool,
}

impl<S> ConnectionSlot<S> {
    fn new() -> Self {
        Self {
            stream: None,
            attempt: 0,
            in_flight: false,
        }
    }

    fn begin(&mut self) -> Result<u64, BluetoothError> {
        if self.in_flight {
            return Err(BluetoothError::ConnectInProgress);
        }
        // Any stream still here belongs to a lost connection (the
        // preflight rejects attempts while the signal is true)
        self.stream = None;
        self.in_flight = true;
        self.attempt = self.attempt.wrapping_add(1);
        Ok(self.attempt)
    }

    /// Store the freshly opened stream, unless the attempt no longer
    /// owns the slot (teardown ran while the socket was opening).
    /// Returns whether the stream was kept; an abandoned stream is
    /// dropped, which closes its socket.
    fn complete(&mut self, token: u64, stream: S) -> bool {
        if !self.in_flight || self.attempt != token {
            return false;
        }
        self.stream = Some(stream);
        self.in_flight = false;
        true
    }

    /// End a failed attempt. Returns whether the attempt still owned
    /// the slot; a stale attempt must not touch connection state.
    fn abort(&mut self, token: u64) -> bool {
        if self.in_flight && self.attempt == token {
            self.in_flight = false;
            true
        } else {
            false
        }
    }

    fn release(&mut self) {
        self.stream = None;
        self.in_flight = false;
    }

    /// The stream to write to, or `NotConnected` when there is no
    /// active connection (no stream, or the signal already settled
    /// false).
    fn writable(&mut self, connected: bool) -> Result<&mut S, BluetoothError> {
        if !connected {
            return Err(BluetoothError::NotConnected);
        }
        self.stream.as_mut().ok_or(BluetoothError::NotConnected)
    }
}

/// State shared with the discovery and watcher tasks.
struct Shared {
    registry: RwLock<DeviceRegistry>,
    /// Address of the device a connection is held (or being opened) to.
    current: Mutex<Option<Address>>,
    connected_tx: watch::Sender<bool>,
    event_tx: mpsc::Sender<ManagerEvent>,
}

impl Shared {
    async fn add_device(&self, device: DeviceInfo) {
        let added = self.registry.write().insert(device.clone());
        if added {
            debug!("Device found: {} ({})", device.label(), device.address);
            let _ = self
                .event_tx
                .send(ManagerEvent::DeviceDiscovered(device))
                .await;
        }
    }

    async fn set_connected(&self, connected: bool) {
        let previous = self.connected_tx.send_replace(connected);
        if previous != connected {
            let _ = self
                .event_tx
                .send(ManagerEvent::ConnectionChanged(connected))
                .await;
        }
    }
}

#[derive(Default)]
struct Tasks {
    discovery: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Manager for the device registry and the single RFCOMM connection.
pub struct BluetoothManager {
    adapter: Adapter,
    expected_name: String,
    channel: u8,
    permissions: Permissions,
    shared: Arc<Shared>,
    slot: AsyncMutex<ConnectionSlot<Stream>>,
    tasks: Mutex<Tasks>,
}

impl BluetoothManager {
    /// Create a manager bound to the default adapter.
    pub async fn new(
        expected_name: impl Into<String>,
        channel: u8,
        event_tx: mpsc::Sender<ManagerEvent>,
    ) -> Result<Self, BluetoothError> {
        info!("Initializing Bluetooth session...");
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let (connected_tx, _) = watch::channel(false);

        Ok(Self {
            adapter,
            expected_name: expected_name.into(),
            channel,
            permissions: Permissions::granted(),
            shared: Arc::new(Shared {
                registry: RwLock::new(DeviceRegistry::new()),
                current: Mutex::new(None),
                connected_tx,
                event_tx,
            }),
            slot: AsyncMutex::new(ConnectionSlot::new()),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Replace the permission grants (mainly for restricted setups).
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
    }

    /// Snapshot of the discovered/bonded device list, display order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared.registry.read().snapshot()
    }

    /// Subscribe to the connected signal.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Merge the adapter's bonded devices into the registry, then
    /// start a discovery scan that keeps feeding it.
    pub async fn list_paired_devices(&self) -> Result<(), BluetoothError> {
        self.permissions.check(Permission::Connect)?;

        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if device.is_paired().await.unwrap_or(false) {
                let name = device.name().await.ok().flatten();
                self.shared.add_device(DeviceInfo::new(addr, name)).await;
            }
        }

        self.start_discovery().await
    }

    async fn start_discovery(&self) -> Result<(), BluetoothError> {
        {
            let tasks = self.tasks.lock();
            let running = tasks
                .discovery
                .as_ref()
                .map_or(false, |handle| !handle.is_finished());
            if running {
                debug!("Discovery already running");
                return Ok(());
            }
        }

        let events = self.adapter.discover_devices().await?;
        info!("Discovery started on adapter {}", self.adapter.name());

        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    let name = match adapter.device(addr) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(err) => {
                            warn!("Failed to query device {}: {}", addr, err);
                            None
                        }
                    };
                    shared.add_device(DeviceInfo::new(addr, name)).await;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.discovery.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Stop a running discovery scan. Best effort; dropping the event
    /// stream ends the BlueZ discovery session.
    pub fn cancel_discovery(&self) {
        let handle = self.tasks.lock().discovery.take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Discovery cancelled");
        }
    }

    /// Open the single RFCOMM connection to the peripheral
    /// (`SPP_UUID` on the configured channel; BlueZ addresses client
    /// sockets by channel, the UUID names the service record).
    ///
    /// Rejects devices not named after the expected peripheral before
    /// any socket is opened, rejects a second attempt while one is in
    /// flight, and rejects attempts while a connection is held.
    pub async fn connect(&self, device: &DeviceInfo) -> Result<(), BluetoothError> {
        connect_preflight(
            &self.expected_name,
            device,
            &self.permissions,
            self.is_connected(),
        )?;

        let token = self.slot.lock().await.begin()?;

        // Discovery saturates the baseband and slows the connect
        self.cancel_discovery();
        *self.shared.current.lock() = Some(device.address);

        if let Ok(dev) = self.adapter.device(device.address) {
            if let Ok(Some(uuids)) = dev.uuids().await {
                if !uuids.contains(&SPP_UUID) {
                    warn!("Device {} does not list SPP ({})", device.address, SPP_UUID);
                }
            }
        }

        info!(
            "Connecting to {} on RFCOMM channel {}...",
            device.address, self.channel
        );

        match Stream::connect(SocketAddr::new(device.address, self.channel)).await {
            Ok(stream) => {
                if !self.slot.lock().await.complete(token, stream) {
                    // clear() ran while the socket was opening
                    info!("Connection to {} abandoned by teardown", device.address);
                    return Err(BluetoothError::ConnectFailed("cancelled".to_string()));
                }
                self.spawn_watcher(device.address);
                self.shared.set_connected(true).await;
                info!("Connected to {}", device.label());
                Ok(())
            }
            Err(err) => {
                // Only unwind state the attempt still owns; after a
                // concurrent clear() everything is already torn down
                if self.slot.lock().await.abort(token) {
                    *self.shared.current.lock() = None;
                    self.shared.set_connected(false).await;
                }
                Err(BluetoothError::ConnectFailed(err.to_string()))
            }
        }
    }

    /// Watch BlueZ property notifications for the connected device and
    /// drive the connected signal from them. Notifications for any
    /// other device leave the signal untouched.
    fn spawn_watcher(&self, address: Address) {
        let device = match self.adapter.device(address) {
            Ok(device) => device,
            Err(err) => {
                warn!("Cannot watch device {}: {}", address, err);
                return;
            }
        };

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("Cannot watch device {}: {}", address, err);
                    return;
                }
            };
            futures::pin_mut!(events);
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                if let DeviceProperty::Connected(connected) = property {
                    let current = *shared.current.lock();
                    if let Some(signal) = connection_signal(current, address, connected) {
                        debug!("Device {} reported connected={}", address, signal);
                        shared.set_connected(signal).await;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.watcher.replace(handle) {
            old.abort();
        }
    }

    /// Write raw bytes to the socket of the active connection.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BluetoothError> {
        let connected = self.is_connected();
        let mut slot = self.slot.lock().await;
        let stream = slot.writable(connected)?;
        stream
            .write_all(bytes)
            .await
            .map_err(|err| BluetoothError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    /// Tear everything down: stop discovery and the watcher, release
    /// the socket, force the signal false. Safe to call from any
    /// state, any number of times.
    pub async fn clear(&self) {
        let (discovery, watcher) = {
            let mut tasks = self.tasks.lock();
            (tasks.discovery.take(), tasks.watcher.take())
        };
        if let Some(handle) = discovery {
            handle.abort();
        }
        if let Some(handle) = watcher {
            handle.abort();
        }

        self.slot.lock().await.release();
        *self.shared.current.lock() = None;
        self.shared.set_connected(false).await;
        info!("Bluetooth manager cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        Address::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn shared(event_tx: mpsc::Sender<ManagerEvent>) -> Shared {
        Shared {
            registry: RwLock::new(DeviceRegistry::new()),
            current: Mutex::new(None),
            connected_tx: watch::channel(false).0,
            event_tx,
        }
    }

    #[test]
    fn test_name_allow_list() {
        let vidyut = DeviceInfo::new(addr(1), Some("Vidyut".into()));
        let other = DeviceInfo::new(addr(2), Some("Headset".into()));
        let unnamed = DeviceInfo::new(addr(3), None);

        assert!(is_expected_peripheral("Vidyut", &vidyut));
        assert!(!is_expected_peripheral("Vidyut", &other));
        assert!(!is_expected_peripheral("Vidyut", &unnamed));
    }

    #[test]
    fn test_connection_signal_ignores_other_devices() {
        let current = Some(addr(1));

        // Disconnect notification for a different device: no change
        assert_eq!(connection_signal(current, addr(2), false), None);
        assert_eq!(connection_signal(current, addr(2), true), None);

        // Notification for the current device flips the signal
        assert_eq!(connection_signal(current, addr(1), false), Some(false));
        assert_eq!(connection_signal(current, addr(1), true), Some(true));

        // No current device: everything is ignored
        assert_eq!(connection_signal(None, addr(1), false), None);
    }

    #[test]
    fn test_permissions_gate() {
        let granted = Permissions::granted();
        assert!(granted.check(Permission::Connect).is_ok());
        assert!(granted.check(Permission::Scan).is_ok());

        let no_scan = Permissions::granted().deny(Permission::Scan);
        assert!(no_scan.check(Permission::Connect).is_ok());
        assert!(matches!(
            no_scan.check(Permission::Scan),
            Err(BluetoothError::PermissionDenied(Permission::Scan))
        ));
    }

    #[test]
    fn test_preflight_rejects_while_connected() {
        let vidyut = DeviceInfo::new(addr(1), Some("Vidyut".into()));
        let granted = Permissions::granted();

        assert!(connect_preflight("Vidyut", &vidyut, &granted, false).is_ok());
        assert!(matches!(
            connect_preflight("Vidyut", &vidyut, &granted, true),
            Err(BluetoothError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_preflight_check_order() {
        let other = DeviceInfo::new(addr(2), Some("Headset".into()));
        let vidyut = DeviceInfo::new(addr(1), Some("Vidyut".into()));
        let no_scan = Permissions::granted().deny(Permission::Scan);
        let none = Permissions::granted()
            .deny(Permission::Connect)
            .deny(Permission::Scan);

        // The name allow-list is checked before anything else
        assert!(matches!(
            connect_preflight("Vidyut", &other, &none, true),
            Err(BluetoothError::NameMismatch { .. })
        ));
        assert!(matches!(
            connect_preflight("Vidyut", &vidyut, &none, false),
            Err(BluetoothError::PermissionDenied(Permission::Connect))
        ));
        assert!(matches!(
            connect_preflight("Vidyut", &vidyut, &no_scan, false),
            Err(BluetoothError::PermissionDenied(Permission::Scan))
        ));
    }

    #[test]
    fn test_slot_rejects_racing_connect() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();

        let token = slot.begin().unwrap();
        assert!(matches!(slot.begin(), Err(BluetoothError::ConnectInProgress)));

        // A failed attempt frees the slot again
        assert!(slot.abort(token));
        let token = slot.begin().unwrap();
        assert!(slot.complete(token, vec![1]));
        assert!(slot.stream.is_some());
    }

    #[test]
    fn test_slot_release_is_idempotent() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();
        let token = slot.begin().unwrap();
        slot.complete(token, vec![1]);

        slot.release();
        assert!(slot.stream.is_none());

        // Second release is a no-op, not an error
        slot.release();
        assert!(slot.stream.is_none());
        slot.begin().unwrap();
    }

    #[test]
    fn test_slot_drops_stream_opened_after_teardown() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();

        // Attempt starts, teardown runs while the socket is opening
        let token = slot.begin().unwrap();
        slot.release();

        // The late-arriving stream must not be stored
        assert!(!slot.complete(token, vec![1]));
        assert!(slot.stream.is_none());
    }

    #[test]
    fn test_slot_tokens_are_per_attempt() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();

        let stale = slot.begin().unwrap();
        slot.release();
        let fresh = slot.begin().unwrap();

        // The overtaken attempt can neither store its stream nor
        // cancel the newer attempt
        assert!(!slot.complete(stale, vec![1]));
        assert!(!slot.abort(stale));

        assert!(slot.complete(fresh, vec![2]));
        assert_eq!(slot.stream.as_deref(), Some(&[2u8][..]));
    }

    #[test]
    fn test_slot_begin_drops_stale_stream() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();
        let token = slot.begin().unwrap();
        slot.complete(token, vec![1]);

        // Connection was lost (signal false); a reconnect attempt
        // replaces the dead socket instead of being blocked by it
        let token = slot.begin().unwrap();
        assert!(slot.stream.is_none());
        assert!(slot.complete(token, vec![2]));
    }

    #[test]
    fn test_write_gate_requires_active_connection() {
        let mut slot: ConnectionSlot<Vec<u8>> = ConnectionSlot::new();

        // Before any successful connect: no stream, signal false
        assert!(matches!(
            slot.writable(false),
            Err(BluetoothError::NotConnected)
        ));
        // Signal true but nothing stored (never connected)
        assert!(matches!(
            slot.writable(true),
            Err(BluetoothError::NotConnected)
        ));

        let token = slot.begin().unwrap();
        slot.complete(token, vec![1]);

        // Stream held but the signal already settled false
        assert!(matches!(
            slot.writable(false),
            Err(BluetoothError::NotConnected)
        ));
        assert!(slot.writable(true).is_ok());
    }

    #[tokio::test]
    async fn test_set_connected_deduplicates_events() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let shared = shared(event_tx);

        shared.set_connected(true).await;
        shared.set_connected(true).await;
        shared.set_connected(false).await;

        assert!(matches!(
            event_rx.recv().await,
            Some(ManagerEvent::ConnectionChanged(true))
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(ManagerEvent::ConnectionChanged(false))
        ));
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_add_device_emits_once_per_address() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let shared = shared(event_tx);

        shared
            .add_device(DeviceInfo::new(addr(1), Some("Vidyut".into())))
            .await;
        shared
            .add_device(DeviceInfo::new(addr(1), Some("Vidyut".into())))
            .await;

        assert!(matches!(
            event_rx.recv().await,
            Some(ManagerEvent::DeviceDiscovered(_))
        ));
        assert!(event_rx.try_recv().is_err());
        assert_eq!(shared.registry.read().len(), 1);
    }
}
