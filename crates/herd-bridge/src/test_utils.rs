//! Test utilities for connections and scanners
//!
//! [`FakeDevice`] is an in-memory stand-in for one physical device: every
//! [`FakeConnection`] made from it sees the same filesystem, the way two adb
//! sessions to one phone do. [`FakeScanner`] hands out a fresh connection per
//! attached device on every scan.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use herd_core::prelude::*;
use herd_core::{ScannerId, TransferOptions};

use crate::connection::{CommandResult, Connection};
use crate::scanner::{ScanReporter, Scanner};

/// Number of chunks a fake transfer is split into
const TRANSFER_CHUNKS: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Split a command line into words, honouring single quotes and backslashes
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

// ─────────────────────────────────────────────────────────────────────────────
// FakeDevice
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DeviceState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    responses: Mutex<HashMap<String, String>>,
    history: Mutex<Vec<String>>,
    reboots: AtomicUsize,
}

/// One simulated physical device with a tiny shell
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    state: Arc<DeviceState>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.write_file(path, contents);
        self
    }

    pub fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.state.files).insert(path.to_string(), contents.into());
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state.files).get(path).cloned()
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.read_file(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.state.files).keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Canned output for a command line the built-in shell does not know
    pub fn respond(&self, command: &str, output: &str) {
        lock(&self.state.responses).insert(command.to_string(), output.to_string());
    }

    /// Every command line executed, in order
    pub fn history(&self) -> Vec<String> {
        lock(&self.state.history).clone()
    }

    pub fn reboot_count(&self) -> usize {
        self.state.reboots.load(Ordering::SeqCst)
    }

    /// Open a new session to this device
    pub fn connect(&self, connection_id: &str, owner: ScannerId) -> Arc<FakeConnection> {
        Arc::new(FakeConnection::new(connection_id, owner, self.clone()))
    }

    fn run(&self, command: &str) -> Result<String> {
        lock(&self.state.history).push(command.to_string());
        if let Some(output) = lock(&self.state.responses).get(command) {
            return Ok(output.clone());
        }

        let tokens = tokenize(command);
        let mut output = String::new();
        for segment in tokens.split(|t| t == "&&") {
            output.push_str(&self.run_segment(segment)?);
        }
        Ok(output)
    }

    fn run_segment(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["cat", path] => self
                .file_text(path)
                .ok_or_else(|| Error::not_found(*path)),
            ["echo", words @ .., ">", path] => {
                self.write_file(path, format!("{}\n", words.join(" ")));
                Ok(String::new())
            }
            ["echo", words @ ..] => Ok(format!("{}\n", words.join(" "))),
            ["su", "-c", inner] => self.run(inner),
            ["mv", from, to] => {
                let mut files = lock(&self.state.files);
                let contents = files.remove(*from).ok_or_else(|| Error::not_found(*from))?;
                files.insert(to.to_string(), contents);
                Ok(String::new())
            }
            ["cp", from, to] => {
                let contents = self.read_file(from).ok_or_else(|| Error::not_found(*from))?;
                self.write_file(to, contents);
                Ok(String::new())
            }
            ["rm", "-f", path] => {
                lock(&self.state.files).remove(*path);
                Ok(String::new())
            }
            ["chmod", ..] => Ok(String::new()),
            ["stat", "-c", "%s", path] => self
                .read_file(path)
                .map(|bytes| format!("{}\n", bytes.len()))
                .ok_or_else(|| Error::not_found(*path)),
            ["reboot"] => {
                self.state.reboots.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FakeConnection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ConnectionState {
    id: String,
    owner: ScannerId,
    device: FakeDevice,
    severed: AtomicBool,
    scripted_failures: AtomicUsize,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    operations: AtomicUsize,
    disposed: AtomicBool,
    dispose_calls: AtomicUsize,
    use_after_dispose: AtomicUsize,
    disposed_while_busy: AtomicUsize,
}

/// Marks an operation as running until dropped
struct InFlight(Arc<ConnectionState>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionState {
    fn begin(self: &Arc<Self>) -> Result<InFlight> {
        if self.disposed.load(Ordering::SeqCst) {
            self.use_after_dispose.fetch_add(1, Ordering::SeqCst);
            return Err(Error::operation(format!(
                "connection {} used after dispose",
                self.id
            )));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.operations.fetch_add(1, Ordering::SeqCst);
        Ok(InFlight(Arc::clone(self)))
    }

    fn check_link(&self) -> Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{}: connection lost", self.id)));
        }
        let scripted = self
            .scripted_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(Error::connection(format!("{}: connection reset", self.id)));
        }
        Ok(())
    }

    /// Sleep for the configured latency, aborting on cancellation
    async fn stall(&self, options: Option<&TransferOptions>) -> Result<()> {
        let latency = *lock(&self.latency);
        match options {
            Some(options) => tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(latency) => Ok(()),
            },
            None => {
                tokio::time::sleep(latency).await;
                Ok(())
            }
        }
    }

    async fn run_shell(self: &Arc<Self>, command: &str, writer: &crate::CommandWriter) -> Result<String> {
        let _op = self.begin()?;
        self.check_link()?;
        self.stall(None).await?;
        self.check_link()?;
        let output = self.device.run(command)?;
        writer.append(&output);
        Ok(writer.output())
    }

    async fn push(
        self: &Arc<Self>,
        local_path: &Path,
        device_path: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let _op = self.begin()?;
        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let data = tokio::fs::read(local_path).await?;
        let total = data.len() as u64;
        let mut tracker = options.tracker();
        tracker.report(0, Some(total));

        let chunk = (data.len() / TRANSFER_CHUNKS).max(1);
        let mut sent = 0usize;
        for piece in data.chunks(chunk) {
            self.stall(Some(options)).await?;
            self.check_link()?;
            sent += piece.len();
            tracker.report(sent as u64, Some(total));
        }
        self.device.write_file(device_path, data);
        tracker.finish();
        Ok(())
    }

    async fn pull(
        self: &Arc<Self>,
        device_path: &str,
        local_path: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        let _op = self.begin()?;
        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.check_link()?;
        let data = self
            .device
            .read_file(device_path)
            .ok_or_else(|| Error::not_found(device_path))?;

        match self.write_chunks(&data, local_path, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(local_path).await;
                Err(e)
            }
        }
    }

    async fn write_chunks(
        &self,
        data: &[u8],
        local_path: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let total = data.len() as u64;
        let mut tracker = options.tracker();
        tracker.report(0, Some(total));

        let mut file = tokio::fs::File::create(local_path).await?;
        let chunk = (data.len() / TRANSFER_CHUNKS).max(1);
        let mut received = 0usize;
        for piece in data.chunks(chunk) {
            self.stall(Some(options)).await?;
            self.check_link()?;
            file.write_all(piece).await?;
            received += piece.len();
            tracker.report(received as u64, Some(total));
        }
        file.flush().await?;
        tracker.finish();
        Ok(())
    }
}

/// A scripted connection to a [`FakeDevice`]
#[derive(Debug)]
pub struct FakeConnection {
    state: Arc<ConnectionState>,
}

impl FakeConnection {
    pub fn new(connection_id: &str, owner: ScannerId, device: FakeDevice) -> Self {
        Self {
            state: Arc::new(ConnectionState {
                id: connection_id.to_string(),
                owner,
                device,
                severed: AtomicBool::new(false),
                scripted_failures: AtomicUsize::new(0),
                latency: Mutex::new(Duration::ZERO),
                in_flight: AtomicUsize::new(0),
                operations: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                dispose_calls: AtomicUsize::new(0),
                use_after_dispose: AtomicUsize::new(0),
                disposed_while_busy: AtomicUsize::new(0),
            }),
        }
    }

    pub fn device(&self) -> &FakeDevice {
        &self.state.device
    }

    /// Every later operation fails with a connection error
    pub fn sever(&self) {
        self.state.severed.store(true, Ordering::SeqCst);
    }

    /// The next `count` link checks fail with a connection error
    pub fn fail_next(&self, count: usize) {
        self.state.scripted_failures.store(count, Ordering::SeqCst);
    }

    /// Delay applied inside every operation (per chunk for transfers)
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.state.dispose_calls.load(Ordering::SeqCst)
    }

    /// Operations attempted after `dispose()`
    pub fn use_after_dispose_count(&self) -> usize {
        self.state.use_after_dispose.load(Ordering::SeqCst)
    }

    /// `dispose()` calls made while an operation was still running
    pub fn disposed_while_busy_count(&self) -> usize {
        self.state.disposed_while_busy.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Operations started on this connection
    pub fn operation_count(&self) -> usize {
        self.state.operations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn connection_id(&self) -> &str {
        &self.state.id
    }

    fn owner(&self) -> ScannerId {
        self.state.owner
    }

    async fn reboot(&self) -> Result<()> {
        let _op = self.state.begin()?;
        self.state.stall(None).await?;
        self.state.check_link()?;
        self.state.device.run("reboot").map(|_| ())
    }

    async fn push_file(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        self.state.push(local_path, device_path, &options).await
    }

    async fn pull_file(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()> {
        self.state.pull(device_path, local_path, &options).await
    }

    fn execute_shell_command(&self, command: &str) -> CommandResult {
        let (writer, result) = CommandResult::channel(command);
        let state = Arc::clone(&self.state);
        let command = command.to_string();
        tokio::spawn(async move {
            let outcome = state.run_shell(&command, &writer).await;
            writer.finish(outcome);
        });
        result
    }

    async fn dispose(&self) {
        self.state.dispose_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.in_flight.load(Ordering::SeqCst) > 0 {
            self.state.disposed_while_busy.fetch_add(1, Ordering::SeqCst);
        }
        self.state.disposed.store(true, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FakeScanner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Attachment {
    address: String,
    device: FakeDevice,
    attached: bool,
}

/// Scanner over a fixed set of [`FakeDevice`]s
#[derive(Debug, Default)]
pub struct FakeScanner {
    name: String,
    attachments: Mutex<Vec<Attachment>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    scan_for_calls: Mutex<Vec<String>>,
    scans: AtomicUsize,
    configuration_error: Mutex<Option<String>>,
    scan_failure: Mutex<Option<String>>,
    warnings: Mutex<Vec<String>>,
}

impl FakeScanner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_device(self, address: &str, device: FakeDevice) -> Self {
        self.add_device(address, device);
        self
    }

    pub fn add_device(&self, address: &str, device: FakeDevice) {
        lock(&self.attachments).push(Attachment {
            address: address.to_string(),
            device,
            attached: true,
        });
    }

    /// Simulate unplugging; later scans skip this address
    pub fn detach(&self, address: &str) {
        self.set_attached(address, false);
    }

    pub fn attach(&self, address: &str) {
        self.set_attached(address, true);
    }

    fn set_attached(&self, address: &str, attached: bool) {
        for attachment in lock(&self.attachments).iter_mut() {
            if attachment.address == address {
                attachment.attached = attached;
            }
        }
    }

    pub fn set_configuration_error(&self, error: Option<&str>) {
        *lock(&self.configuration_error) = error.map(str::to_string);
    }

    /// Make every later scan fail with an operation error
    pub fn fail_scans(&self, message: &str) {
        *lock(&self.scan_failure) = Some(message.to_string());
    }

    /// Warning published on every later scan
    pub fn warn_on_scan(&self, message: &str) {
        lock(&self.warnings).push(message.to_string());
    }

    /// Every connection handed out so far
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        lock(&self.connections).clone()
    }

    pub fn scan_for_calls(&self) -> Vec<String> {
        lock(&self.scan_for_calls).clone()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn discover(&self, address: &str, device: &FakeDevice, reporter: &ScanReporter) {
        let connection = device.connect(address, reporter.scanner_id());
        lock(&self.connections).push(Arc::clone(&connection));
        reporter.discovered(connection);
    }

    fn attached(&self) -> Vec<(String, FakeDevice)> {
        lock(&self.attachments)
            .iter()
            .filter(|a| a.attached)
            .map(|a| (a.address.clone(), a.device.clone()))
            .collect()
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn configuration_error(&self) -> Option<String> {
        lock(&self.configuration_error).clone()
    }

    async fn scan(&self, reporter: &ScanReporter) -> Result<()> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.scan_failure).clone() {
            return Err(Error::operation(message));
        }
        for warning in lock(&self.warnings).clone() {
            reporter.warning(warning);
        }
        for (address, device) in self.attached() {
            self.discover(&address, &device, reporter);
        }
        Ok(())
    }

    async fn scan_for(&self, target: &str, reporter: &ScanReporter) -> Result<()> {
        lock(&self.scan_for_calls).push(target.to_string());
        match self.attached().into_iter().find(|(address, _)| address == target) {
            Some((address, device)) => {
                self.discover(&address, &device, reporter);
                Ok(())
            }
            None => Err(Error::connection(format!("{} is not reachable", target))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_handles_quotes() {
        assert_eq!(
            tokenize("echo 'it'\\''s here' > /sdcard/a\\ b"),
            vec!["echo", "it's here", ">", "/sdcard/a b"]
        );
        assert_eq!(tokenize("  ls   -l "), vec!["ls", "-l"]);
        assert_eq!(tokenize("echo ''"), vec!["echo", ""]);
    }

    #[tokio::test]
    async fn test_fake_shell_reads_and_writes_files() {
        let device = FakeDevice::new();
        let connection = device.connect("fake-1", ScannerId(0));

        let missing = connection.execute_shell_command("cat /sdcard/id").complete().await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));

        connection
            .execute_shell_command("echo 'hello world' > /sdcard/id")
            .complete()
            .await
            .unwrap();
        let read = connection.execute_shell_command("cat /sdcard/id").complete().await;
        assert_eq!(read.unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn test_su_and_move() {
        let device = FakeDevice::new().with_file("/data/local/tmp/x", "payload");
        let connection = device.connect("fake-1", ScannerId(0));

        connection
            .execute_shell_command("su -c 'mv /data/local/tmp/x /system/x && chmod 644 /system/x'")
            .complete()
            .await
            .unwrap();
        assert_eq!(device.file_text("/system/x").as_deref(), Some("payload"));
        assert!(device.read_file("/data/local/tmp/x").is_none());
    }

    #[tokio::test]
    async fn test_connections_share_device_state() {
        let device = FakeDevice::new();
        let first = device.connect("a", ScannerId(0));
        let second = device.connect("b", ScannerId(0));

        first
            .execute_shell_command("echo shared > /sdcard/f")
            .complete()
            .await
            .unwrap();
        let read = second.execute_shell_command("cat /sdcard/f").complete().await;
        assert_eq!(read.unwrap(), "shared\n");
    }

    #[tokio::test]
    async fn test_severed_connection_fails_with_connection_error() {
        let connection = FakeDevice::new().connect("a", ScannerId(0));
        connection.sever();
        let err = connection.reboot().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_use_after_dispose_is_counted() {
        let connection = FakeDevice::new().connect("a", ScannerId(0));
        connection.dispose().await;
        assert!(connection.reboot().await.is_err());
        assert_eq!(connection.use_after_dispose_count(), 1);
        assert_eq!(connection.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let connection = FakeDevice::new().connect("a", ScannerId(0));
        connection.fail_next(1);
        assert!(connection.reboot().await.unwrap_err().is_connection_error());
        connection.reboot().await.unwrap();
        assert_eq!(connection.device().reboot_count(), 1);
    }

    #[tokio::test]
    async fn test_pull_cancellation_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let device = FakeDevice::new().with_file("/sdcard/big", vec![1u8; 1024]);
        let connection = device.connect("a", ScannerId(0));
        connection.set_latency(Duration::from_millis(50));

        let options = TransferOptions::new();
        let cancel = options.cancel.clone();
        let pull = {
            let connection = Arc::clone(&connection);
            let target = target.clone();
            tokio::spawn(async move { connection.pull_file("/sdcard/big", &target, options).await })
        };
        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel.cancel();

        assert!(pull.await.unwrap().unwrap_err().is_cancelled());
        assert!(!target.exists());
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_scanner_hands_out_fresh_connections() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = ScanReporter::new(
            ScannerId(4),
            tx,
            Arc::new(crate::scanner::PendingDiscoveries::new()),
        );
        let scanner = FakeScanner::new("fake").with_device("10.0.0.1", FakeDevice::new());

        scanner.scan(&reporter).await.unwrap();
        scanner.scan(&reporter).await.unwrap();
        assert_eq!(scanner.connections().len(), 2);
        assert!(!Arc::ptr_eq(&scanner.connections()[0], &scanner.connections()[1]));

        scanner.detach("10.0.0.1");
        assert!(scanner.scan_for("10.0.0.1", &reporter).await.is_err());
        assert_eq!(scanner.scan_for_calls(), vec!["10.0.0.1"]);

        let mut discovered = 0;
        while let Ok(event) = rx.try_recv() {
            if let crate::scanner::ScanEvent::Discovered(c) = event {
                assert_eq!(c.owner(), ScannerId(4));
                discovered += 1;
            }
        }
        assert_eq!(discovered, 2);
    }
}
