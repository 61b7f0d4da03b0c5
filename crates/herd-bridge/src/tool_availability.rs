//! Locating the host tools the transports drive
//!
//! The USB scanner needs `adb` from the Android SDK platform tools, the SSH
//! scanner needs an OpenSSH client. Both are looked up once at startup.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Resolved paths of the external tools used for device discovery
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Path to a working `adb`, if found
    pub adb_path: Option<String>,

    /// Path to the `ssh` client, if found
    pub ssh_path: Option<String>,
}

impl ToolAvailability {
    /// Check tool availability (run once at startup)
    pub async fn check() -> Self {
        let adb_path = Self::find_adb().await;
        let ssh_path = Self::find_ssh();
        tracing::debug!("Tool availability: adb={:?} ssh={:?}", adb_path, ssh_path);

        Self { adb_path, ssh_path }
    }

    pub fn adb_available(&self) -> bool {
        self.adb_path.is_some()
    }

    pub fn ssh_available(&self) -> bool {
        self.ssh_path.is_some()
    }

    /// First candidate that answers `adb version`
    async fn find_adb() -> Option<String> {
        for path in Self::get_adb_paths() {
            let works = Command::new(&path)
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .inspect_err(|e| tracing::debug!("adb check failed for {}: {}", path, e))
                .unwrap_or(false);
            if works {
                return Some(path);
            }
        }
        None
    }

    fn find_ssh() -> Option<String> {
        which::which("ssh")
            .inspect_err(|e| tracing::debug!("ssh lookup failed: {}", e))
            .ok()
            .map(|path| path.to_string_lossy().into_owned())
    }

    /// Candidate adb locations, most specific last
    fn get_adb_paths() -> Vec<String> {
        let mut paths = Vec::new();

        match which::which("adb") {
            Ok(path) => paths.push(path.to_string_lossy().into_owned()),
            Err(_) => paths.push("adb".to_string()),
        }

        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Ok(root) = std::env::var(var) {
                let candidate = Path::new(&root).join("platform-tools").join("adb");
                paths.push(candidate.to_string_lossy().into_owned());
            }
        }

        paths
    }

    /// User-facing message when the USB scanner cannot run
    pub fn adb_unavailable_message(&self) -> Option<&'static str> {
        if self.adb_available() {
            None
        } else {
            Some("adb not found. Install the Android SDK platform tools or set ANDROID_HOME.")
        }
    }

    /// User-facing message when the SSH scanner cannot run
    pub fn ssh_unavailable_message(&self) -> Option<&'static str> {
        if self.ssh_available() {
            None
        } else {
            Some("ssh not found. Install an OpenSSH client to reach devices over the network.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_tool_availability_default() {
        let availability = ToolAvailability::default();
        assert!(!availability.adb_available());
        assert!(!availability.ssh_available());
        assert!(availability.adb_unavailable_message().is_some());
        assert!(availability.ssh_unavailable_message().is_some());
    }

    #[test]
    #[serial]
    fn test_adb_paths_includes_android_home() {
        std::env::set_var("ANDROID_HOME", "/test/android");
        let paths = ToolAvailability::get_adb_paths();
        assert!(paths
            .iter()
            .any(|p| p.ends_with("/test/android/platform-tools/adb")));
        std::env::remove_var("ANDROID_HOME");
    }

    #[test]
    #[serial]
    fn test_adb_paths_includes_sdk_root() {
        std::env::set_var("ANDROID_SDK_ROOT", "/test/sdk");
        let paths = ToolAvailability::get_adb_paths();
        assert!(paths.iter().any(|p| p.contains("/test/sdk")));
        std::env::remove_var("ANDROID_SDK_ROOT");
    }

    #[test]
    #[serial]
    fn test_adb_paths_always_has_a_path_candidate() {
        let paths = ToolAvailability::get_adb_paths();
        assert!(!paths.is_empty());
        assert!(paths[0].ends_with("adb"));
    }

    #[test]
    fn test_available_tools_have_no_message() {
        let availability = ToolAvailability {
            adb_path: Some("/opt/sdk/platform-tools/adb".to_string()),
            ssh_path: Some("/usr/bin/ssh".to_string()),
        };
        assert!(availability.adb_unavailable_message().is_none());
        assert!(availability.ssh_unavailable_message().is_none());
    }
}
