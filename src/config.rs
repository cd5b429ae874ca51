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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::{ble_constants, CentralConfig, LinkConfig};
use crate::coordinator::SessionSettings;

const APP_DIR: &str = "dogfit-logger";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Session file settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Case-insensitive substring of the collar's advertised name.
    pub name_filter: String,

    /// Delay before scanning again after a link loss.
    pub retry_delay_ms: u64,

    /// Upper bound for one connection request.
    pub connect_timeout_ms: u64,

    /// Give up after this many consecutive failures. Unset retries forever.
    pub max_retries: Option<u32>,

    /// Adapter name such as `hci0`. Unset uses the default adapter.
    pub adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            name_filter: ble_constants::PRODUCT_NAME_FILTER.to_string(),
            retry_delay_ms: ble_constants::config::RETRY_DELAY.as_millis() as u64,
            connect_timeout_ms: ble_constants::config::CONNECT_TIMEOUT.as_millis() as u64,
            max_retries: None,
            adapter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Folder under the documents directory receiving session files.
    pub folder: String,

    /// Prefix of session file names.
    pub session_label: String,

    /// Show a progress status every N received lines.
    pub status_every: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            folder: "DogfitLogs".to_string(),
            session_label: "imu".to_string(),
            status_every: 10,
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::load_from(&config_dir.join("config.toml"))
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            return Ok(toml::from_str(&content)?);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(&config)?)?;
        Ok(config)
    }

    /// Directory receiving session files.
    pub fn output_dir(&self) -> PathBuf {
        dirs::document_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&self.logging.folder)
    }

    pub fn central_config(&self) -> CentralConfig {
        CentralConfig {
            link: LinkConfig {
                name_filter: self.bluetooth.name_filter.clone(),
                retry_delay: Duration::from_millis(self.bluetooth.retry_delay_ms),
                max_retries: self.bluetooth.max_retries,
            },
            connect_timeout: Duration::from_millis(self.bluetooth.connect_timeout_ms),
            adapter: self.bluetooth.adapter.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            label: self.logging.session_label.clone(),
            status_every: self.logging.status_every,
        }
    }
}
