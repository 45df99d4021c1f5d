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

//! Fixed identifiers for the Vidyut peripheral.

use uuid::Uuid;

/// Serial Port Profile UUID the peripheral registers its RFCOMM
/// service under.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Advertised name of the peripheral. Connecting to anything else is
/// rejected before a socket is opened.
pub const DEVICE_NAME: &str = "Vidyut";

/// Default RFCOMM channel. BlueZ addresses client sockets by
/// (address, channel); the peripheral binds its SPP service here.
pub const RFCOMM_CHANNEL: u8 = 1;

/// Byte payload that turns the LED on.
pub const LED_ON: u8 = b'a';

/// Byte payload that turns the LED off.
pub const LED_OFF: u8 = b'b';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spp_uuid_format() {
        // The well-known SPP UUID, not a project-specific one
        assert_eq!(
            SPP_UUID.to_string().to_lowercase(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_led_payloads() {
        assert_eq!(LED_ON, 0x61);
        assert_eq!(LED_OFF, 0x62);
        assert_ne!(LED_ON, LED_OFF);
    }
}
