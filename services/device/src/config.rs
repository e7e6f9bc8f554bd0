//! Device configuration files.
//!
//! All configuration lives as YAML in the device's working directory:
//! - `device_config` — the device identity
//! - `device_connection` — how to reach the server
//! - `device_drivers` — the list of driver configurations
//!
//! Startup fails with a non-zero exit code when any of these are missing or
//! invalid.

use std::path::{Path, PathBuf};

use meridian_edge::{DeviceId, websocket_endpoint, websocket_token_endpoint};
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub const DEVICE_CONFIG_FILE: &str = "device_config";
pub const CONNECTION_SETTINGS_FILE: &str = "device_connection";
pub const DRIVER_CONFIG_FILE: &str = "device_drivers";

/// Path of the local sample buffer database, relative to the working
/// directory.
pub const STORAGE_FILE: &str = "storage.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// The pure device settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// The unique identifier of the device.
    pub device_id: DeviceId,
}

/// The settings required to reach the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// HTTP(S) base URL of the server, e.g. `https://meridian.example.com`.
    pub server_url: String,
}

impl ConnectionSettings {
    /// The websocket URI for this device: the scheme-swapped base plus the
    /// device endpoint, with the token appended when given.
    pub fn websocket_uri(&self, device_id: DeviceId, token: Option<&str>) -> String {
        let base = swap_to_websocket_scheme(&self.server_url);
        let uri = format!("{}{}", base, websocket_endpoint(device_id));
        match token {
            Some(token) => format!("{uri}?token={token}"),
            None => uri,
        }
    }

    /// The HTTP URI the device fetches its connection token from.
    pub fn websocket_token_uri(&self, device_id: DeviceId) -> String {
        format!(
            "{}{}",
            self.server_url.trim_end_matches('/'),
            websocket_token_endpoint(device_id)
        )
    }
}

fn swap_to_websocket_scheme(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_owned()
    }
}

/// Read and parse one YAML config file.
pub fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Read the device identity from the working directory.
pub fn read_device_config() -> Result<DeviceConfig, ConfigError> {
    read_config_file(&std::env::current_dir().unwrap_or_default().join(DEVICE_CONFIG_FILE))
}

/// Read the connection settings from the working directory.
pub fn read_connection_settings() -> Result<ConnectionSettings, ConfigError> {
    read_config_file(
        &std::env::current_dir()
            .unwrap_or_default()
            .join(CONNECTION_SETTINGS_FILE),
    )
}

/// Read the raw driver configuration list from the working directory.
///
/// Each entry is kept as a raw YAML value: the driver registry validates it
/// against the schema of the configured `driver_module`.
pub fn read_driver_configs() -> Result<Vec<serde_yaml::Value>, ConfigError> {
    read_config_file(&std::env::current_dir().unwrap_or_default().join(DRIVER_CONFIG_FILE))
}
