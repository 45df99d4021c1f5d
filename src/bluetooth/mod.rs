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

//! Bluetooth communication module.
//!
//! Owns the device registry and the single RFCOMM connection to the
//! Vidyut peripheral.

pub mod constants;
mod manager;
mod registry;

pub use manager::{BluetoothManager, ManagerEvent, Permissions};
pub use registry::{DeviceInfo, DeviceRegistry};

use std::fmt;

use thiserror::Error;

/// Runtime permissions gating Bluetooth operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Required to enumerate bonded devices and open a socket.
    Connect,
    /// Required to run a discovery scan.
    Scan,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Connect => write!(f, "connect"),
            Permission::Scan => write!(f, "scan"),
        }
    }
}

/// Bluetooth errors.
///
/// Messages are user-facing; the frontend forwards them verbatim as
/// transient notifications.
#[derive(Error, Debug)]
pub enum BluetoothError {
    /// A required runtime permission is absent.
    #[error("No Bluetooth {0} permission")]
    PermissionDenied(Permission),

    /// The selected device is not the expected peripheral.
    #[error("Please choose \"{expected}\"")]
    NameMismatch { expected: String },

    /// Another connection attempt is already in flight.
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// A connection is already held; tear it down first.
    #[error("Bluetooth is already connected")]
    AlreadyConnected,

    /// Opening the RFCOMM socket failed.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// No active connection.
    #[error("Bluetooth not connected")]
    NotConnected,

    /// Writing to the socket failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Adapter or session level failure.
    #[error("Adapter error: {0}")]
    Adapter(String),
}

impl From<bluer::Error> for BluetoothError {
    fn from(err: bluer::Error) -> Self {
        BluetoothError::Adapter(err.to_string())
    }
}
