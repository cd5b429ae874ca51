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

//! BLE service and characteristic UUIDs for the Dogfit IMU collar.

use uuid::Uuid;

/// UART-style GATT service exposed by the collar.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Command RX characteristic UUID (we write `START` / `STOP` here).
/// Properties: Write, Write Without Response
pub const COMMAND_RX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Telemetry TX characteristic UUID (the collar streams CSV lines here).
/// Properties: Notify
pub const TELEMETRY_TX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CONFIG_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Substring every collar carries in its advertised name.
pub const PRODUCT_NAME_FILTER: &str = "DOGFIT-IMU";

/// Link configuration constants.
pub mod config {
    use std::time::Duration;

    /// Delay between a link loss and the next scan.
    pub const RETRY_DELAY: Duration = Duration::from_millis(2000);

    /// Upper bound for a connection request.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Poll interval while BlueZ resolves the remote GATT database.
    pub const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// Check whether an advertised name belongs to a collar.
pub fn matches_product(name: &str, filter: &str) -> bool {
    name.to_lowercase().contains(&filter.to_lowercase())
}
