//! USB debug-bridge transport driven through the `adb` CLI
//!
//! [`AdbScanner`] lists attached devices with `adb devices`, restarting a
//! wedged server when needed, and hands out one [`AdbConnection`] per online
//! serial.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use herd_core::prelude::*;
use herd_core::{ScannerId, TransferOptions};

use crate::connection::{CommandResult, Connection};
use crate::process::{
    first_line, missing_path, run_captured, shell_quote, spawn_shell, stream_from_remote,
    stream_to_remote, Invocation,
};
use crate::scanner::{ScanReporter, Scanner};

/// Default timeout for a single `adb devices` call
pub const DEFAULT_ADB_TIMEOUT: Duration = Duration::from_secs(10);

/// Parallel operations allowed per device; adb falls over beyond this
const MAX_CONCURRENT_OPERATIONS: usize = 4;

/// Header printed by `adb devices`
const LIST_HEADER: &str = "List of devices attached";

/// Matches `serial<whitespace>state`
static DEVICE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(.+?)\s*$").expect("Invalid device line regex"));

/// Prefixes of lines adb itself prints; anything else came from the remote process
const ADB_DIAGNOSTIC_PREFIXES: &[&str] = &["error:", "adb:", "* daemon"];

/// Fragments of adb diagnostics meaning the transport to the device is gone
const CONNECTION_MARKERS: &[&str] = &[
    "error: device",
    "device offline",
    "no devices/emulators found",
    "error: closed",
    "protocol fault",
    "connection reset",
    "broken pipe",
    "cannot connect to daemon",
    "daemon not running",
];

/// First adb diagnostic line naming a lost transport
fn transport_failure(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).find(|line| {
        let lower = line.to_lowercase();
        ADB_DIAGNOSTIC_PREFIXES.iter().any(|p| lower.starts_with(p))
            && CONNECTION_MARKERS.iter().any(|m| lower.contains(m))
    })
}

fn classify_adb(code: Option<i32>, stderr: &str) -> Error {
    if let Some(line) = transport_failure(stderr) {
        return Error::connection(format!("adb: {}", line));
    }
    if let Some(path) = missing_path(stderr) {
        return Error::not_found(path);
    }
    match code {
        Some(code) => Error::operation(format!("adb exited with {}: {}", code, first_line(stderr))),
        None => Error::operation(format!("adb was terminated: {}", first_line(stderr))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device listing
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed `adb devices` output
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AdbListing {
    /// Serials in state `device`
    pub online: Vec<String>,
    /// `(serial, state)` for every other state
    pub offline: Vec<(String, String)>,
    /// Serials reported more than once, with their count
    pub duplicates: Vec<(String, usize)>,
}

impl AdbListing {
    /// Warning for offline entries, if any
    pub fn offline_warning(&self) -> Option<String> {
        if self.offline.is_empty() {
            return None;
        }
        let entries: Vec<String> = self
            .offline
            .iter()
            .map(|(serial, state)| format!("{}: {}", serial, state))
            .collect();
        Some(format!(
            "Skipping {} offline device(s) (which cannot be controlled)\n{}",
            self.offline.len(),
            entries.join(", ")
        ))
    }

    /// Warning for colliding serials, if any
    pub fn duplicate_warning(&self) -> Option<String> {
        if self.duplicates.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .duplicates
            .iter()
            .map(|(serial, count)| format!("{}: {} devices", serial, count))
            .collect();
        Some(format!(
            "Skipping the following duplicate device IDs, which ADB cannot control:\n{}",
            lines.join("\n")
        ))
    }
}

/// Parse the output of `adb devices`.
///
/// A serial that appears more than once cannot be addressed with `-s`, so all
/// of its entries are dropped in favour of a duplicate report.
pub fn parse_devices_output(output: &str) -> AdbListing {
    let entries: Vec<(String, String)> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*') && *line != LIST_HEADER)
        .filter_map(|line| {
            DEVICE_LINE
                .captures(line)
                .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        })
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (serial, _) in &entries {
        *counts.entry(serial.as_str()).or_default() += 1;
    }

    let mut listing = AdbListing::default();
    for (serial, state) in &entries {
        let count = counts[serial.as_str()];
        if count > 1 {
            if !listing.duplicates.iter().any(|(s, _)| s == serial) {
                listing.duplicates.push((serial.clone(), count));
            }
        } else if state == "device" {
            listing.online.push(serial.clone());
        } else {
            listing.offline.push((serial.clone(), state.clone()));
        }
    }
    listing
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for [`AdbScanner`]
#[derive(Debug, Clone)]
pub struct AdbScannerConfig {
    pub adb_path: String,
    /// How many times a wedged server may be restarted in one scan
    pub max_server_restarts: u32,
    pub timeout: Duration,
}

impl Default for AdbScannerConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            max_server_restarts: 3,
            timeout: DEFAULT_ADB_TIMEOUT,
        }
    }
}

/// Discovers devices attached to the local adb server
#[derive(Debug)]
pub struct AdbScanner {
    config: AdbScannerConfig,
}

impl AdbScanner {
    pub fn new(config: AdbScannerConfig) -> Self {
        Self { config }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new(self.config.adb_path.clone())
    }

    /// Run `adb devices`, restarting the server while it is unreachable
    async fn list_devices(&self, reporter: &ScanReporter) -> Result<String> {
        let devices = self.invocation().arg("devices");
        let mut restarts = 0;

        loop {
            let failure = match timeout(self.config.timeout, run_captured(&devices, classify_adb)).await
            {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) if !e.is_connection_error() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => Error::connection("adb devices timed out"),
            };

            if restarts >= self.config.max_server_restarts {
                warn!("Giving up on adb server after {} restarts", restarts);
                return Err(failure);
            }
            debug!("adb server unreachable: {}", failure);
            reporter.warning("Starting ADB server...");

            if restarts > 0 {
                // A server that survived a plain restart is wedged
                let kill = self.invocation().arg("kill-server");
                if let Err(e) = run_captured(&kill, classify_adb).await {
                    debug!("adb kill-server failed: {}", e);
                }
            }
            let start = self.invocation().arg("start-server");
            match timeout(self.config.timeout, run_captured(&start, classify_adb)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if matches!(e, Error::ToolNotFound { .. }) => return Err(e),
                Ok(Err(e)) => debug!("adb start-server failed: {}", e),
                Err(_) => debug!("adb start-server timed out"),
            }
            restarts += 1;
        }
    }
}

#[async_trait]
impl Scanner for AdbScanner {
    fn display_name(&self) -> &str {
        "USB"
    }

    fn configuration_error(&self) -> Option<String> {
        if self.config.adb_path.trim().is_empty() {
            Some("adb path must not be empty".to_string())
        } else if self.config.timeout.is_zero() {
            Some("adb timeout must be greater than zero".to_string())
        } else {
            None
        }
    }

    async fn scan(&self, reporter: &ScanReporter) -> Result<()> {
        let output = self.list_devices(reporter).await?;
        let listing = parse_devices_output(&output);

        if let Some(warning) = listing.offline_warning() {
            reporter.warning(warning);
        }
        if let Some(warning) = listing.duplicate_warning() {
            reporter.warning(warning);
        }

        info!("adb reported {} online device(s)", listing.online.len());
        for serial in listing.online {
            let connection = AdbConnection::new(
                serial,
                reporter.scanner_id(),
                self.config.adb_path.clone(),
            );
            reporter.discovered(Arc::new(connection));
        }
        Ok(())
    }

    async fn scan_for(&self, target: &str, reporter: &ScanReporter) -> Result<()> {
        debug!("Rescanning adb for {}", target);
        self.scan(reporter).await
    }

    fn rediscovery_scope(&self, _target: &str) -> String {
        "*".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// One adb-addressable device, identified by its serial
#[derive(Debug)]
pub struct AdbConnection {
    serial: String,
    owner: ScannerId,
    adb_path: String,
    limiter: Arc<Semaphore>,
    disposed: AtomicBool,
}

impl AdbConnection {
    pub fn new(serial: impl Into<String>, owner: ScannerId, adb_path: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            owner,
            adb_path: adb_path.into(),
            limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_OPERATIONS)),
            disposed: AtomicBool::new(false),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new(self.adb_path.clone()).args(["-s", self.serial.as_str()])
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.limiter.acquire().await.map_err(|_| Error::ChannelClosed)
    }

    async fn remote_size(&self, device_path: &str) -> Result<Option<u64>> {
        let stat = self
            .invocation()
            .args(["shell".to_string(), format!("stat -c %s {}", shell_quote(device_path))]);
        let output = run_captured(&stat, classify_adb).await?;
        if let Some(path) = missing_path(&output) {
            // Older adb servers report remote failures on stdout with exit 0
            return Err(Error::not_found(path));
        }
        Ok(output.trim().parse().ok())
    }
}

#[async_trait]
impl Connection for AdbConnection {
    fn connection_id(&self) -> &str {
        &self.serial
    }

    fn owner(&self) -> ScannerId {
        self.owner
    }

    async fn reboot(&self) -> Result<()> {
        let _permit = self.permit().await?;
        info!("Rebooting {} via adb", self.serial);
        run_captured(&self.invocation().arg("reboot"), classify_adb).await?;
        Ok(())
    }

    async fn push_file(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        let _permit = self.permit().await?;
        let exec = self
            .invocation()
            .args(["exec-in".to_string(), format!("cat > {}", shell_quote(device_path))]);
        stream_to_remote(&exec, local_path, &options, classify_adb).await
    }

    async fn pull_file(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()> {
        let _permit = self.permit().await?;
        let total = self.remote_size(device_path).await?;
        let exec = self
            .invocation()
            .args(["exec-out".to_string(), format!("cat {}", shell_quote(device_path))]);
        stream_from_remote(&exec, local_path, total, &options, classify_adb).await
    }

    fn execute_shell_command(&self, command: &str) -> CommandResult {
        let invocation = self.invocation().arg("shell").arg(command);
        spawn_shell(
            command,
            invocation,
            classify_adb,
            Some(Arc::clone(&self.limiter)),
        )
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            trace!("Disposed adb connection {}", self.serial);
        }
    }
}
