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

//! Application state management.

use parking_lot::RwLock;
use std::sync::Arc;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connected => "Connected",
        }
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current connection status.
    pub connection_status: RwLock<ConnectionStatus>,

    /// Connected device name.
    pub connected_device: RwLock<Option<String>>,

    /// Telemetry lines received since launch.
    pub lines_received: RwLock<u64>,

    /// Last status message shown to the user.
    pub last_status: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection_status: RwLock::new(ConnectionStatus::Disconnected),
            connected_device: RwLock::new(None),
            lines_received: RwLock::new(0),
            last_status: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connected(&self, device_name: String) {
        *self.connection_status.write() = ConnectionStatus::Connected;
        *self.connected_device.write() = Some(device_name);
    }

    pub fn set_disconnected(&self) {
        *self.connection_status.write() = ConnectionStatus::Disconnected;
        *self.connected_device.write() = None;
    }

    pub fn is_connected(&self) -> bool {
        *self.connection_status.read() == ConnectionStatus::Connected
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.connection_status.read()
    }

    pub fn get_device_name(&self) -> Option<String> {
        self.connected_device.read().clone()
    }

    /// Count one received line and return the new total.
    pub fn record_line(&self) -> u64 {
        let mut lines = self.lines_received.write();
        *lines += 1;
        *lines
    }

    pub fn get_lines_received(&self) -> u64 {
        *self.lines_received.read()
    }

    pub fn set_last_status(&self, message: String) {
        *self.last_status.write() = Some(message);
    }

    pub fn get_last_status(&self) -> Option<String> {
        self.last_status.read().clone()
    }

    /// One-line summary: message, connection flag and line count.
    pub fn summary(&self, message: &str) -> String {
        format!(
            "{} | {} | lines: {}",
            message,
            self.get_status().as_str(),
            self.get_lines_received()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let state = AppState::new();
        assert!(!state.is_connected());
        state.set_connected("DOGFIT-IMU-7".to_string());
        assert!(state.is_connected());
        assert_eq!(state.get_device_name().as_deref(), Some("DOGFIT-IMU-7"));
        state.set_disconnected();
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);
        assert!(state.get_device_name().is_none());
    }

    #[test]
    fn test_summary() {
        let state = AppState::new();
        state.record_line();
        state.record_line();
        assert_eq!(state.summary("Receiving data"), "Receiving data | Disconnected | lines: 2");
    }
}
