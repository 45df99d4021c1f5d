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

//! Vidyut Link: Linux companion for the Vidyut Bluetooth LED
//! peripheral.
//!
//! Discovers the paired "Vidyut" peripheral, holds a single RFCOMM
//! connection to it, and sends the one-byte LED commands.

pub mod bluetooth;
pub mod config;
pub mod events;
pub mod state;
