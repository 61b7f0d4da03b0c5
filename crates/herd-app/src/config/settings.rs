//! Settings parser for `<config_dir>/droidherd/config.toml`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use herd_bridge::{AdbScanner, AdbScannerConfig, Scanner, SshScanner, ToolAvailability};
use herd_core::prelude::*;

use super::types::Settings;
use crate::identity::IdentityResolver;
use crate::registry::RegistryOptions;

const CONFIG_DIR: &str = "droidherd";
const CONFIG_FILENAME: &str = "config.toml";

/// Where settings are read from when no `--config` is given
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load settings from the default location.
///
/// A missing file means defaults. A file that cannot be read or parsed is
/// logged and also falls back to defaults.
pub fn load_settings() -> Settings {
    let Some(config_path) = default_config_path() else {
        debug!("No config directory on this platform, using defaults");
        return Settings::default();
    };

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match load_settings_from(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{}, using defaults", e);
            Settings::default()
        }
    }
}

/// Load settings from a file the user named explicitly
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
    let settings = toml::from_str(&content)
        .map_err(|e| Error::config(format!("Failed to parse {}: {}", path.display(), e)))?;

    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

impl Settings {
    /// Scanners for every enabled section whose tool could be located.
    ///
    /// An explicit tool path in the config wins over the detected one.
    /// Sections whose tool is missing are skipped with a warning.
    pub fn build_scanners(&self, tools: &ToolAvailability) -> Vec<Arc<dyn Scanner>> {
        let mut scanners: Vec<Arc<dyn Scanner>> = Vec::new();

        if self.usb.enabled {
            match self.usb.adb_path.clone().or_else(|| tools.adb_path.clone()) {
                Some(adb_path) => scanners.push(Arc::new(AdbScanner::new(AdbScannerConfig {
                    adb_path,
                    max_server_restarts: self.usb.max_server_restarts,
                    timeout: self.usb.timeout(),
                }))),
                None => warn!(
                    "USB scanning disabled: {}",
                    tools.adb_unavailable_message().unwrap_or("adb not found")
                ),
            }
        }

        if self.ssh.enabled {
            match self.ssh.ssh_path.clone().or_else(|| tools.ssh_path.clone()) {
                Some(ssh_path) => {
                    scanners.push(Arc::new(SshScanner::new(self.ssh.scanner.clone(), ssh_path)))
                }
                None => warn!(
                    "SSH scanning disabled: {}",
                    tools.ssh_unavailable_message().unwrap_or("ssh not found")
                ),
            }
        }

        scanners
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            identity: IdentityResolver::new(self.discovery.marker_path.clone()),
            rediscovery: self.rediscovery.clone(),
        }
    }
}
