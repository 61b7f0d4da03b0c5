//! Configuration types for droidherd
//!
//! Defines:
//! - `Settings` - The whole `config.toml`
//! - One section struct per scanner family plus discovery tuning

use std::time::Duration;

use serde::{Deserialize, Serialize};

use herd_bridge::SshScannerConfig;

use crate::identity::DEFAULT_MARKER_PATH;
use crate::rediscovery::RediscoveryPolicy;

/// Application settings (`config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub usb: UsbSettings,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub rediscovery: RediscoveryPolicy,
}

/// USB debug bridge scanner
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UsbSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Explicit `adb` binary; looked up on PATH and in the SDK when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adb_path: Option<String>,

    #[serde(default = "default_max_server_restarts")]
    pub max_server_restarts: u32,

    /// Timeout for a single `adb devices` call
    #[serde(default = "default_adb_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            adb_path: None,
            max_server_restarts: default_max_server_restarts(),
            timeout_secs: default_adb_timeout_secs(),
        }
    }
}

impl UsbSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Secure-shell scanner over an address range.
///
/// Disabled unless the config file turns it on, since it needs an address
/// range and credentials.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SshSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_path: Option<String>,

    #[serde(flatten)]
    pub scanner: SshScannerConfig,
}

/// Identity markers and periodic rescans
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_marker_path")]
    pub marker_path: String,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            marker_path: default_marker_path(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl DiscoverySettings {
    /// Never zero, so a refresh loop cannot spin
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_max_server_restarts() -> u32 {
    3
}

fn default_adb_timeout_secs() -> u64 {
    10
}

fn default_marker_path() -> String {
    DEFAULT_MARKER_PATH.to_string()
}

fn default_refresh_interval_secs() -> u64 {
    5
}
