//! Secure-shell transport driven through the OpenSSH client
//!
//! [`SshScanner`] dials every address of a configured inclusive range. Each
//! reachable address becomes an [`SshConnection`] that owns an OpenSSH
//! control-master session, so subsequent commands reuse one TCP connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use herd_core::prelude::*;
use herd_core::{ScannerId, TransferOptions};

use crate::connection::{CommandResult, Connection};
use crate::process::{
    first_line, missing_path, run_captured, shell_quote, spawn_shell, stream_from_remote,
    stream_to_remote, Invocation,
};
use crate::scanner::{ScanReporter, Scanner};

/// Largest address range a single scanner may cover
pub const MAX_RANGE_SIZE: u128 = 65_536;

/// Addresses dialled at the same time during a scan
const DIAL_CONCURRENCY: usize = 32;

/// Pause between the shutdown broadcast and the reboot command
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long an idle control master survives after its last client exits
const CONTROL_PERSIST_SECS: u64 = 600;

static CONTROL_NONCE: AtomicU64 = AtomicU64::new(0);

/// OpenSSH reserves exit status 255 for its own failures
fn classify_ssh(code: Option<i32>, stderr: &str) -> Error {
    match code {
        Some(255) | None => Error::connection(format!("ssh: {}", first_line(stderr))),
        Some(code) => match missing_path(stderr) {
            Some(path) => Error::not_found(path),
            None => Error::operation(format!(
                "remote command exited with {}: {}",
                code,
                first_line(stderr)
            )),
        },
    }
}

/// Expand a leading `~/` to the home directory
fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => format!("{}/{}", home.to_string_lossy(), rest),
        _ => path.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for [`SshScanner`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshScannerConfig {
    /// First address of the inclusive range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_address: Option<IpAddr>,

    /// Last address of the inclusive range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_address: Option<IpAddr>,

    pub port: u16,
    pub user: String,

    /// Private keys offered to the device, `~/` is expanded
    pub identity_files: Vec<String>,

    pub connect_timeout_secs: u64,

    /// Verify host keys against `known_hosts`. Fleet devices are usually
    /// reflashed often enough that this is off by default.
    pub strict_host_key_checking: bool,

    /// Directory for control-master sockets (default: system temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_dir: Option<PathBuf>,
}

impl Default for SshScannerConfig {
    fn default() -> Self {
        Self {
            start_address: None,
            end_address: None,
            port: 22,
            user: "root".to_string(),
            identity_files: Vec::new(),
            connect_timeout_secs: 5,
            strict_host_key_checking: false,
            control_dir: None,
        }
    }
}

impl SshScannerConfig {
    /// Describe the first problem with these settings, if any
    pub fn validate(&self) -> Option<String> {
        let (Some(start), Some(end)) = (self.start_address, self.end_address) else {
            return Some("Both start and end addresses must be set".to_string());
        };
        match range_size(start, end) {
            Err(message) => return Some(message),
            Ok(size) if size > MAX_RANGE_SIZE => {
                return Some(format!(
                    "Address range {} - {} spans {} addresses (at most {} allowed)",
                    start, end, size, MAX_RANGE_SIZE
                ))
            }
            Ok(_) => {}
        }
        if self.port == 0 {
            return Some("Port must be between 1 and 65535".to_string());
        }
        if self.user.trim().is_empty() {
            return Some("A user name is required".to_string());
        }
        if self.identity_files.is_empty() {
            return Some("At least one identity file is required".to_string());
        }
        if self.connect_timeout_secs == 0 {
            return Some("Connect timeout must be greater than zero".to_string());
        }
        None
    }

    fn control_dir(&self) -> PathBuf {
        self.control_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Number of addresses in the inclusive range `start..=end`
fn range_size(start: IpAddr, end: IpAddr) -> std::result::Result<u128, String> {
    let (first, last) = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s) as u128, u32::from(e) as u128),
        (IpAddr::V6(s), IpAddr::V6(e)) => (u128::from(s), u128::from(e)),
        _ => {
            return Err(format!(
                "Start address {} and end address {} are of different IP versions",
                start, end
            ))
        }
    };
    if first > last {
        return Err(format!(
            "Start address {} comes after end address {}",
            start, end
        ));
    }
    Ok((last - first).saturating_add(1))
}

/// Every address of a validated range, in ascending order
pub fn address_range(start: IpAddr, end: IpAddr) -> Result<Vec<IpAddr>> {
    let size = range_size(start, end).map_err(Error::configuration)?;
    if size > MAX_RANGE_SIZE {
        return Err(Error::configuration(format!(
            "Address range spans {} addresses",
            size
        )));
    }
    let addresses = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s)..=u32::from(e))
            .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
            .collect(),
        (IpAddr::V6(s), IpAddr::V6(e)) => (u128::from(s)..=u128::from(e))
            .map(|n| IpAddr::V6(Ipv6Addr::from(n)))
            .collect(),
        _ => Vec::new(),
    };
    Ok(addresses)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// Session parameters shared by every connection of one scanner
#[derive(Debug)]
struct SessionSettings {
    ssh_path: String,
    port: u16,
    user: String,
    identity_files: Vec<String>,
    connect_timeout_secs: u64,
    strict_host_key_checking: bool,
    control_dir: PathBuf,
}

/// Discovers devices answering SSH on an address range
#[derive(Debug)]
pub struct SshScanner {
    config: SshScannerConfig,
    session: Arc<SessionSettings>,
}

impl SshScanner {
    pub fn new(config: SshScannerConfig, ssh_path: impl Into<String>) -> Self {
        let session = Arc::new(SessionSettings {
            ssh_path: ssh_path.into(),
            port: config.port,
            user: config.user.clone(),
            identity_files: config.identity_files.iter().map(|f| expand_tilde(f)).collect(),
            connect_timeout_secs: config.connect_timeout_secs,
            strict_host_key_checking: config.strict_host_key_checking,
            control_dir: config.control_dir(),
        });
        Self { config, session }
    }

    pub fn config(&self) -> &SshScannerConfig {
        &self.config
    }

    fn addresses(&self) -> Result<Vec<IpAddr>> {
        match (self.config.start_address, self.config.end_address) {
            (Some(start), Some(end)) => address_range(start, end),
            _ => Err(Error::configuration("SSH address range is not configured")),
        }
    }

    /// Open a session to `address`, publishing it on success
    async fn dial(&self, address: IpAddr, reporter: &ScanReporter) -> Result<()> {
        let connection = SshConnection::new(address, reporter.scanner_id(), Arc::clone(&self.session));
        // Generous upper bound in case ConnectTimeout is not honoured
        let limit = Duration::from_secs(self.session.connect_timeout_secs.saturating_mul(2) + 5);

        let outcome = match timeout(limit, run_captured(&connection.remote("true"), classify_ssh)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::connection("timed out")),
        };

        match outcome {
            Ok(_) => {
                debug!("SSH session established with {}", address);
                reporter.discovered(Arc::new(connection));
                Ok(())
            }
            Err(e) => {
                connection.dispose().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Scanner for SshScanner {
    fn display_name(&self) -> &str {
        "SSH"
    }

    fn configuration_error(&self) -> Option<String> {
        if self.session.ssh_path.trim().is_empty() {
            return Some("ssh path must not be empty".to_string());
        }
        self.config.validate()
    }

    async fn scan(&self, reporter: &ScanReporter) -> Result<()> {
        let addresses = self.addresses()?;
        info!("Probing {} SSH address(es)", addresses.len());

        stream::iter(addresses)
            .for_each_concurrent(DIAL_CONCURRENCY, |address| async move {
                if let Err(e) = self.dial(address, reporter).await {
                    reporter.warning(format!("{}: {}", address, e));
                }
            })
            .await;
        Ok(())
    }

    async fn scan_for(&self, target: &str, reporter: &ScanReporter) -> Result<()> {
        let address: IpAddr = target
            .parse()
            .map_err(|_| Error::operation(format!("{} is not an IP address", target)))?;
        self.dial(address, reporter).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// One device reached over SSH, identified by its address
#[derive(Debug)]
pub struct SshConnection {
    address: String,
    owner: ScannerId,
    session: Arc<SessionSettings>,
    control_path: PathBuf,
    disposed: AtomicBool,
}

impl SshConnection {
    fn new(address: IpAddr, owner: ScannerId, session: Arc<SessionSettings>) -> Self {
        let nonce = CONTROL_NONCE.fetch_add(1, Ordering::Relaxed);
        let control_path = session
            .control_dir
            .join(format!("droidherd-{}-{}.sock", std::process::id(), nonce));
        Self {
            address: address.to_string(),
            owner,
            session,
            control_path,
            disposed: AtomicBool::new(false),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.session.user, self.address)
    }

    fn control_option(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }

    /// `ssh` with every session option, up to and including the destination
    fn base(&self) -> Invocation {
        let session = &self.session;
        let mut invocation = Invocation::new(session.ssh_path.clone())
            .arg("-p")
            .arg(session.port.to_string());
        for identity in &session.identity_files {
            invocation = invocation.arg("-i").arg(identity.clone());
        }
        invocation = invocation.args([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", session.connect_timeout_secs),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            self.control_option(),
            "-o".to_string(),
            format!("ControlPersist={}", CONTROL_PERSIST_SECS),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);
        if !session.strict_host_key_checking {
            invocation = invocation.args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
            ]);
        }
        invocation.arg(self.destination())
    }

    /// Run `command` through the device's shell
    fn remote(&self, command: &str) -> Invocation {
        self.base().arg(command)
    }

    async fn remote_size(&self, device_path: &str) -> Result<Option<u64>> {
        let stat = self.remote(&format!("stat -c %s {}", shell_quote(device_path)));
        let output = run_captured(&stat, classify_ssh).await?;
        Ok(output.trim().parse().ok())
    }

    /// Run a reboot command; the session dropping mid-command counts as success
    async fn try_reboot(&self, command: &str) -> Result<()> {
        match run_captured(&self.remote(command), classify_ssh).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_error() => {
                debug!("{} hung up during reboot: {}", self.address, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn connection_id(&self) -> &str {
        &self.address
    }

    fn owner(&self) -> ScannerId {
        self.owner
    }

    async fn reboot(&self) -> Result<()> {
        info!("Rebooting {} over SSH", self.address);
        let broadcast = self.remote("am broadcast -a android.intent.action.ACTION_SHUTDOWN");
        if let Err(e) = run_captured(&broadcast, classify_ssh).await {
            if e.is_connection_error() {
                return Err(e);
            }
            debug!("Shutdown broadcast on {} failed: {}", self.address, e);
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        match self.try_reboot("reboot").await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Plain reboot failed on {}: {}, retrying as root", self.address, e);
                self.try_reboot("su -c reboot").await
            }
        }
    }

    async fn push_file(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        let cat = self.remote(&format!("cat > {}", shell_quote(device_path)));
        stream_to_remote(&cat, local_path, &options, classify_ssh).await
    }

    async fn pull_file(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()> {
        let total = self.remote_size(device_path).await?;
        let cat = self.remote(&format!("cat {}", shell_quote(device_path)));
        stream_from_remote(&cat, local_path, total, &options, classify_ssh).await
    }

    fn execute_shell_command(&self, command: &str) -> CommandResult {
        spawn_shell(command, self.remote(command), classify_ssh, None)
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let exit = Invocation::new(self.session.ssh_path.clone())
            .args(["-o".to_string(), self.control_option()])
            .args(["-O", "exit"])
            .arg(self.destination());
        match run_captured(&exit, classify_ssh).await {
            Ok(_) => trace!("Closed SSH control master for {}", self.address),
            // No master running, e.g. the dial never connected
            Err(e) => trace!("ssh -O exit for {}: {}", self.address, e),
        }
    }
}
