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
//! Handles loading and saving session settings.

use anyhow::{Context, Result};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::{SessionSettings, CHUNK_SIZE, SERVICE_NAME, SERVICE_UUID};

const APP_DIR: &str = "rfcomm-chat";

/// Get a sanitized hostname suitable for a Bluetooth device name.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
fn get_sanitized_hostname() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    let sanitized: String = hostname
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "Desktop".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Transport settings.
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Device name advertised over Bluetooth.
    /// Computed at runtime from the system hostname unless set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Service record name of the listening socket.
    pub service_name: String,

    /// Service record UUID. Both peers must agree on it.
    pub service_uuid: Uuid,

    /// Give up on a client connect after this many milliseconds.
    pub connect_timeout_ms: Option<u64>,

    /// Give up waiting for a peer after this many milliseconds.
    pub accept_timeout_ms: Option<u64>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            service_name: SERVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            connect_timeout_ms: None,
            accept_timeout_ms: None,
        }
    }
}

impl BluetoothConfig {
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(get_sanitized_hostname)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes per socket read; each read becomes one message.
    pub chunk_size: usize,

    /// Buffered connection events per attempt.
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            event_capacity: 32,
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default file or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Connection settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            service_name: self.bluetooth.service_name.clone(),
            service_uuid: self.bluetooth.service_uuid,
            connect_timeout: self.bluetooth.connect_timeout_ms.map(Duration::from_millis),
            accept_timeout: self.bluetooth.accept_timeout_ms.map(Duration::from_millis),
            chunk_size: self.transport.chunk_size,
            event_capacity: self.transport.event_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.bluetooth.service_uuid, SERVICE_UUID);
        assert_eq!(config.transport.chunk_size, 1024);

        let settings = config.session_settings();
        assert_eq!(settings.connect_timeout, None);
        assert_eq!(settings.service_name, SERVICE_NAME);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\nconnect_timeout_ms = 5000\ndevice_name = \"Bench\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bluetooth.device_name(), "Bench");
        assert_eq!(config.bluetooth.service_name, SERVICE_NAME);
        assert_eq!(config.transport.event_capacity, 32);
        assert_eq!(
            config.session_settings().connect_timeout,
            Some(Duration::from_millis(5000))
        );
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bluetooth]\nservice_uuid = \"not-a-uuid\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_hostname_fallback_is_sane() {
        let name = BluetoothConfig::default().device_name();
        assert!(!name.is_empty());
        assert!(!name.starts_with('-'));
    }
}
