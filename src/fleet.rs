//! Fleet-wide operations
//!
//! Every command runs on all selected devices at once. A device that is
//! waiting for a reconnect holds up only its own result; interrupting the
//! run turns every unfinished one into `Cancelled`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use herd_app::{DeviceRegistry, PersistentDevice};
use herd_core::prelude::*;
use herd_core::TransferOptions;

/// Receives `(stable_id, fraction)` for every transfer step
pub type ProgressSink = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Result of one operation on one device
#[derive(Debug)]
pub struct Outcome<T> {
    pub stable_id: String,
    pub result: Result<T>,
}

/// A registry plus the device filter and cancellation of one CLI run
#[derive(Debug, Clone)]
pub struct Fleet {
    registry: DeviceRegistry,
    filter: Option<String>,
    cancel: CancellationToken,
}

impl Fleet {
    pub fn new(registry: DeviceRegistry, filter: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            registry,
            filter,
            cancel,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Scan once and wait for the discovered devices to settle
    pub async fn discover(&self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = self.registry.refresh() => Ok(()),
        }
    }

    /// Devices matching the `--device` prefix, in discovery order
    pub fn selected(&self) -> Vec<PersistentDevice> {
        self.registry
            .devices()
            .into_iter()
            .filter(|d| matches_filter(d.stable_id(), self.filter.as_deref()))
            .collect()
    }

    pub async fn exec(&self, command: &str) -> Result<Vec<Outcome<String>>> {
        self.for_each(|device| {
            let command = command.to_string();
            async move { device.shell(&command).await }
        })
        .await
    }

    pub async fn reboot(&self) -> Result<Vec<Outcome<()>>> {
        self.for_each(|device| async move { device.reboot().await })
            .await
    }

    pub async fn push(
        &self,
        local: &Path,
        remote: &str,
        as_root: bool,
        progress: Option<ProgressSink>,
    ) -> Result<Vec<Outcome<()>>> {
        let metadata = std::fs::metadata(local)?;
        if !metadata.is_file() {
            return Err(Error::operation(format!("{} is not a file", local.display())));
        }

        self.for_each(|device| {
            let options = self.transfer_options(device.stable_id(), progress.clone());
            let local = local.to_path_buf();
            let remote = remote.to_string();
            async move {
                if as_root {
                    device.push_file_as_root(&local, &remote, options).await
                } else {
                    device.push_file(&local, &remote, options).await
                }
            }
        })
        .await
    }

    /// Pull `remote` from each device into `local_dir/<sanitised stable id>`
    pub async fn pull(
        &self,
        remote: &str,
        local_dir: &Path,
        as_root: bool,
        progress: Option<ProgressSink>,
    ) -> Result<Vec<Outcome<PathBuf>>> {
        std::fs::create_dir_all(local_dir)?;

        self.for_each(|device| {
            let options = self.transfer_options(device.stable_id(), progress.clone());
            let target = local_dir.join(sanitize_file_name(device.stable_id()));
            let remote = remote.to_string();
            async move {
                if as_root {
                    device.pull_file_as_root(&remote, &target, options).await?;
                } else {
                    device.pull_file(&remote, &target, options).await?;
                }
                Ok(target)
            }
        })
        .await
    }

    fn transfer_options(&self, stable_id: &str, progress: Option<ProgressSink>) -> TransferOptions {
        let options = TransferOptions::new().with_cancel(self.cancel.child_token());
        match progress {
            Some(sink) => {
                let stable_id = stable_id.to_string();
                options.with_progress(move |fraction| sink(&stable_id, fraction))
            }
            None => options,
        }
    }

    async fn for_each<T, F, Fut>(&self, op: F) -> Result<Vec<Outcome<T>>>
    where
        F: Fn(PersistentDevice) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let devices = self.selected();
        if devices.is_empty() {
            return Err(match &self.filter {
                Some(prefix) => Error::operation(format!("No device id starts with '{}'", prefix)),
                None => Error::operation("No devices found"),
            });
        }

        let runs = devices.into_iter().map(|device| {
            let stable_id = device.stable_id().to_string();
            let work = op(device);
            async move {
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    result = work => result,
                };
                Outcome { stable_id, result }
            }
        });
        Ok(join_all(runs).await)
    }
}

pub fn matches_filter(stable_id: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |prefix| stable_id.starts_with(prefix))
}

/// Turn a stable id into a file name safe on every host platform
pub fn sanitize_file_name(stable_id: &str) -> String {
    let name: String = stable_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_matches('.');
    if name.is_empty() {
        "device".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("lab-phone_3"), "lab-phone_3");
        assert_eq!(
            sanitize_file_name("droidherd: first seen 2024-01-01 10:00:00 as 10.0.0.5. ab12"),
            "droidherd__first_seen_2024-01-01_10_00_00_as_10.0.0.5._ab12"
        );
        assert_eq!(sanitize_file_name("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_file_name(".."), "device");
        assert_eq!(sanitize_file_name(""), "device");
    }

    #[test]
    fn test_matches_filter() {
        assert!(matches_filter("lab-1", None));
        assert!(matches_filter("lab-1", Some("lab")));
        assert!(!matches_filter("lab-1", Some("rack")));
    }
}
