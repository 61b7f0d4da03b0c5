//! A device handle that survives connection churn
//!
//! [`PersistentDevice`] owns one replaceable connection slot. Operations run
//! against whatever connection currently fills the slot; a connection error
//! empties it and the operation waits for the registry to supply the next
//! connection, then retries.
//!
//! ## Slot discipline
//!
//! - The slot is swapped or disposed only under the write side of `gate`.
//!   Operations hold the read side while they run, so a connection is never
//!   replaced or disposed underneath an operation.
//! - A failed slot is replaced by compare-and-swap, so concurrent failures
//!   install exactly one pending slot.
//! - A pending slot is resolved in place through its watch channel, so every
//!   waiter wakes on the same connection.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;

use herd_bridge::{CommandResult, Connection};
use herd_core::prelude::*;
use herd_core::{ScannerId, TransferOptions};

/// Buffered device events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Directory used to stage files for root copies
const STAGING_DIR: &str = "/data/local/tmp";

/// Notifications raised by a [`PersistentDevice`]
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The current connection failed; the device now waits for a new one
    ConnectionLost {
        connection_id: String,
        owner: ScannerId,
        error: Arc<Error>,
    },
    /// A new connection was installed
    ConnectionEstablished { connection_id: String },
}

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Resolved(Arc<dyn Connection>),
    Closed,
}

#[derive(Debug)]
struct Slot {
    state: watch::Sender<SlotState>,
}

impl Slot {
    fn new(state: SlotState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self { state })
    }

    fn snapshot(&self) -> SlotState {
        self.state.borrow().clone()
    }

    /// Wait until the slot holds a connection
    async fn connection(&self, stable_id: &str) -> Result<Arc<dyn Connection>> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, SlotState::Pending))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        match &*state {
            SlotState::Resolved(connection) => Ok(Arc::clone(connection)),
            _ => Err(Error::device_closed(stable_id)),
        }
    }
}

#[derive(Debug)]
struct Inner {
    stable_id: String,
    gate: RwLock<()>,
    slot: Mutex<Arc<Slot>>,
    closed: AtomicBool,
    events: broadcast::Sender<DeviceEvent>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Arc<Slot>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_slot(&self) -> Arc<Slot> {
        Arc::clone(&self.slot())
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Swap `failed` for a pending slot and dispose its connection once drained
    fn handle_connection_error(
        self: &Arc<Self>,
        failed: &Arc<Slot>,
        connection: Arc<dyn Connection>,
        error: Error,
    ) {
        let swapped = {
            let mut slot = self.slot();
            if Arc::ptr_eq(&slot, failed) && !self.closed.load(Ordering::SeqCst) {
                *slot = Slot::new(SlotState::Pending);
                true
            } else {
                false
            }
        };
        if !swapped {
            trace!("{}: slot already replaced", self.stable_id);
            return;
        }

        warn!(
            "{}: connection {} lost: {}",
            self.stable_id,
            connection.connection_id(),
            error
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.emit(DeviceEvent::ConnectionLost {
                connection_id: connection.connection_id().to_string(),
                owner: connection.owner(),
                error: Arc::new(error),
            });
            let _gate = inner.gate.write().await;
            connection.dispose().await;
        });
    }
}

/// Stable handle to one physical device.
///
/// Cloning is cheap and every clone refers to the same device.
#[derive(Debug, Clone)]
pub struct PersistentDevice {
    inner: Arc<Inner>,
}

impl PersistentDevice {
    pub fn new(stable_id: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                stable_id: stable_id.into(),
                gate: RwLock::new(()),
                slot: Mutex::new(Slot::new(SlotState::Resolved(connection))),
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn stable_id(&self) -> &str {
        &self.inner.stable_id
    }

    /// Whether the slot currently holds a live connection
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.current_slot().snapshot(), SlotState::Resolved(_))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Transport id of the current connection, if any
    pub fn connection_id(&self) -> Option<String> {
        match self.inner.current_slot().snapshot() {
            SlotState::Resolved(connection) => Some(connection.connection_id().to_string()),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Whether two handles refer to the same device
    pub fn same_device(&self, other: &PersistentDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `op` against the current connection, retrying on connection errors.
    ///
    /// Retries are unbounded; use [`PersistentDevice::execute_until`] or an
    /// outer timeout to bound the wait for a reconnect.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_until(&CancellationToken::new(), op).await
    }

    /// [`PersistentDevice::execute`] that gives up with `Cancelled` if `cancel`
    /// fires while waiting for a connection
    pub async fn execute_until<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let slot = self.inner.current_slot();
            let connection = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                connection = slot.connection(&self.inner.stable_id) => connection?,
            };

            let gate = self.inner.gate.read().await;
            if self.is_closed() {
                return Err(Error::device_closed(self.stable_id()));
            }
            if !Arc::ptr_eq(&slot, &self.inner.current_slot()) {
                drop(gate);
                continue;
            }

            match op(Arc::clone(&connection)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_error() => {
                    self.inner.handle_connection_error(&slot, connection, e);
                    drop(gate);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Install a freshly discovered connection.
    ///
    /// Waits for running operations to finish. A pending slot is resolved in
    /// place; a resolved slot is replaced and its old connection disposed.
    pub async fn set_device(&self, connection: Arc<dyn Connection>) {
        let connection_id = connection.connection_id().to_string();
        if self.is_closed() {
            debug!("{}: closed, dropping {}", self.stable_id(), connection_id);
            connection.dispose().await;
            return;
        }

        let installed = {
            let _gate = self.inner.gate.write().await;
            let current = self.inner.current_slot();
            match current.snapshot() {
                SlotState::Pending => {
                    current.state.send_replace(SlotState::Resolved(connection));
                    true
                }
                SlotState::Resolved(old) if Arc::ptr_eq(&old, &connection) => false,
                SlotState::Resolved(old) => {
                    *self.inner.slot() = Slot::new(SlotState::Resolved(connection));
                    debug!(
                        "{}: replacing {} with {}",
                        self.stable_id(),
                        old.connection_id(),
                        connection_id
                    );
                    old.dispose().await;
                    true
                }
                SlotState::Closed => {
                    connection.dispose().await;
                    false
                }
            }
        };

        if installed {
            info!("{}: connected via {}", self.stable_id(), connection_id);
            self.inner
                .emit(DeviceEvent::ConnectionEstablished { connection_id });
        }
    }

    /// Close the slot and dispose the current connection.
    ///
    /// Waiting and later operations fail with `DeviceClosed`.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _gate = self.inner.gate.write().await;
        let previous = self
            .inner
            .current_slot()
            .state
            .send_replace(SlotState::Closed);
        if let SlotState::Resolved(connection) = previous {
            connection.dispose().await;
        }
        debug!("{}: shut down", self.stable_id());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn reboot(&self) -> Result<()> {
        self.execute(|connection| async move { connection.reboot().await })
            .await
    }

    pub async fn push_file(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        let cancel = options.cancel.clone();
        self.execute_until(&cancel, |connection| {
            let options = options.clone();
            async move { connection.push_file(local_path, device_path, options).await }
        })
        .await
    }

    pub async fn pull_file(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()> {
        let cancel = options.cancel.clone();
        self.execute_until(&cancel, |connection| {
            let options = options.clone();
            async move { connection.pull_file(device_path, local_path, options).await }
        })
        .await
    }

    /// Start a shell command. The returned handle follows the command across
    /// reconnects and shows the output of the attempt that completes.
    pub fn execute_shell_command(&self, command: &str) -> CommandResult {
        let (writer, result) = CommandResult::channel(command);
        let device = self.clone();
        let command = command.to_string();

        tokio::spawn(async move {
            let outcome = device
                .execute(|connection| writer.forward(connection.execute_shell_command(&command)))
                .await;
            writer.finish(outcome);
        });
        result
    }

    /// Run a command and wait for its full output
    pub async fn shell(&self, command: &str) -> Result<String> {
        self.execute_shell_command(command).complete().await
    }

    /// Push into a location only root can write, staging through `/data/local/tmp`
    pub async fn push_file_as_root(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        let staging = staging_path();
        self.push_file(local_path, &staging, options).await?;

        let moved = self
            .shell(&as_root(&format!("mv {} {}", quote(&staging), quote(device_path))))
            .await;
        if moved.is_err() {
            self.remove_staging(&staging).await;
        }
        moved.map(|_| ())
    }

    /// Pull a file only root can read, staging through `/data/local/tmp`
    pub async fn pull_file_as_root(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()> {
        let staging = staging_path();
        let copy = format!(
            "cp {} {} && chmod 644 {}",
            quote(device_path),
            quote(&staging),
            quote(&staging)
        );

        let outcome = match self.shell(&as_root(&copy)).await {
            Ok(_) => self.pull_file(&staging, local_path, options).await,
            Err(e) => Err(e),
        };
        self.remove_staging(&staging).await;
        outcome
    }

    async fn remove_staging(&self, staging: &str) {
        if let Err(e) = self.shell(&as_root(&format!("rm -f {}", quote(staging)))).await {
            debug!("{}: could not remove {}: {}", self.stable_id(), staging, e);
        }
    }
}

fn quote(word: &str) -> String {
    shell_escape::unix::escape(word.into()).into_owned()
}

fn as_root(command: &str) -> String {
    format!("su -c {}", quote(command))
}

fn staging_path() -> String {
    format!("{}/droidherd-{:032x}", STAGING_DIR, rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use herd_bridge::test_utils::{FakeConnection, FakeDevice};
    use tokio::sync::{broadcast::error::TryRecvError, Notify};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fake(id: &str, device: &FakeDevice) -> Arc<FakeConnection> {
        device.connect(id, ScannerId(0))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_set_device_waits_for_running_operation() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        let c2 = fake("c2", &phone);
        let device = PersistentDevice::new("phone", c1.clone());

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let op = {
            let device = device.clone();
            let (started, release) = (started.clone(), release.clone());
            tokio::spawn(async move {
                device
                    .execute(|connection| {
                        let (started, release) = (started.clone(), release.clone());
                        async move {
                            started.notify_one();
                            release.notified().await;
                            Ok(connection.connection_id().to_string())
                        }
                    })
                    .await
            })
        };
        started.notified().await;

        let swap = {
            let device = device.clone();
            let c2 = c2.clone();
            tokio::spawn(async move { device.set_device(c2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!swap.is_finished());
        assert!(!c1.is_disposed());

        release.notify_one();
        assert_eq!(op.await.unwrap().unwrap(), "c1");
        tokio::time::timeout(TIMEOUT, swap).await.unwrap().unwrap();

        assert_eq!(c1.dispose_count(), 1);
        assert_eq!(c1.disposed_while_busy_count(), 0);
        assert_eq!(device.connection_id().as_deref(), Some("c2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_operations_wait_for_reconnect_after_connection_error() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        let c2 = fake("c2", &phone);
        let device = PersistentDevice::new("phone", c1.clone());
        let mut events = device.subscribe();

        c1.sever();
        let first = tokio::spawn({
            let device = device.clone();
            async move { device.reboot().await }
        });
        eventually(|| !device.is_connected()).await;

        let second = tokio::spawn({
            let device = device.clone();
            async move { device.shell("echo still here").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        device.set_device(c2.clone()).await;
        tokio::time::timeout(TIMEOUT, first).await.unwrap().unwrap().unwrap();
        let output = tokio::time::timeout(TIMEOUT, second).await.unwrap().unwrap();
        assert_eq!(output.unwrap(), "still here\n");

        eventually(|| c1.dispose_count() == 1).await;
        assert_eq!(c1.use_after_dispose_count(), 0);
        assert_eq!(phone.reboot_count(), 1);
        assert!(!c2.is_disposed());

        match events.recv().await.unwrap() {
            DeviceEvent::ConnectionLost {
                connection_id,
                error,
                ..
            } => {
                assert_eq!(connection_id, "c1");
                assert!(error.is_connection_error());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_install_one_pending_slot() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        let c2 = fake("c2", &phone);
        c1.set_latency(Duration::from_millis(100));
        let device = PersistentDevice::new("phone", c1.clone());
        let mut events = device.subscribe();

        let ops: Vec<_> = (0..8)
            .map(|_| {
                let device = device.clone();
                tokio::spawn(async move { device.reboot().await })
            })
            .collect();
        eventually(|| c1.in_flight() == 8).await;
        c1.sever();
        eventually(|| !device.is_connected() && c1.in_flight() == 0).await;

        device.set_device(c2.clone()).await;
        for op in ops {
            tokio::time::timeout(TIMEOUT, op).await.unwrap().unwrap().unwrap();
        }

        assert_eq!(c2.operation_count(), 8);
        eventually(|| c1.dispose_count() == 1).await;

        let mut lost = 0;
        let mut established = 0;
        loop {
            match events.try_recv() {
                Ok(DeviceEvent::ConnectionLost { .. }) => lost += 1,
                Ok(DeviceEvent::ConnectionEstablished { .. }) => established += 1,
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("event channel failed: {:?}", e),
            }
        }
        assert_eq!(lost, 1);
        assert_eq!(established, 1);
    }

    #[tokio::test]
    async fn test_superseded_connections_disposed_exactly_once() {
        let phone = FakeDevice::new();
        let (c1, c2, c3) = (fake("c1", &phone), fake("c2", &phone), fake("c3", &phone));
        let device = PersistentDevice::new("phone", c1.clone());

        device.set_device(c2.clone()).await;
        device.set_device(c3.clone()).await;
        device.set_device(c3.clone()).await;

        assert_eq!(c1.dispose_count(), 1);
        assert_eq!(c2.dispose_count(), 1);
        assert_eq!(c3.dispose_count(), 0);

        device.shutdown().await;
        device.shutdown().await;
        assert_eq!(c3.dispose_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_pull_leaves_slot_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("log.txt");
        let phone = FakeDevice::new().with_file("/sdcard/log.txt", vec![b'x'; 4096]);
        let c1 = fake("c1", &phone);
        c1.set_latency(Duration::from_millis(50));
        let device = PersistentDevice::new("phone", c1.clone());
        let mut events = device.subscribe();

        let options = TransferOptions::new();
        let cancel = options.cancel.clone();
        let pull = tokio::spawn({
            let device = device.clone();
            let target = target.clone();
            async move { device.pull_file("/sdcard/log.txt", &target, options).await }
        });
        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel.cancel();

        let err = tokio::time::timeout(TIMEOUT, pull).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(device.is_connected());
        assert!(!c1.is_disposed());
        assert!(!target.exists());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_operation_errors_are_not_retried() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        let device = PersistentDevice::new("phone", c1.clone());

        let err = device.shell("cat /sdcard/missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(device.is_connected());
        assert_eq!(c1.operation_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shell_handle_follows_reconnect() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        let c2 = fake("c2", &phone);
        c1.sever();
        let device = PersistentDevice::new("phone", c1.clone());

        let handle = device.execute_shell_command("echo hello");
        eventually(|| !device.is_connected()).await;
        device.set_device(c2).await;

        let mut output = handle.subscribe();
        let result = tokio::time::timeout(TIMEOUT, handle.complete()).await.unwrap();
        assert_eq!(result.unwrap(), "hello\n");
        assert_eq!(*output.borrow_and_update(), "hello\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_waiters() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        c1.sever();
        let device = PersistentDevice::new("phone", c1.clone());

        let waiting = tokio::spawn({
            let device = device.clone();
            async move { device.reboot().await }
        });
        eventually(|| !device.is_connected()).await;
        device.shutdown().await;

        let err = tokio::time::timeout(TIMEOUT, waiting).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, Error::DeviceClosed { .. }));

        let late = fake("c2", &phone);
        device.set_device(late.clone()).await;
        assert_eq!(late.dispose_count(), 1);
        eventually(|| c1.dispose_count() == 1).await;
    }

    #[tokio::test]
    async fn test_execute_until_cancels_wait_for_connection() {
        let phone = FakeDevice::new();
        let c1 = fake("c1", &phone);
        c1.sever();
        let device = PersistentDevice::new("phone", c1);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = device
            .execute_until(&cancel, |connection| async move { connection.reboot().await })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_root_copies_stage_through_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("hosts");
        std::fs::write(&local, "127.0.0.1 localhost\n").unwrap();

        let phone = FakeDevice::new();
        let device = PersistentDevice::new("phone", fake("c1", &phone));

        device
            .push_file_as_root(&local, "/system/etc/hosts", TransferOptions::new())
            .await
            .unwrap();
        assert_eq!(
            phone.file_text("/system/etc/hosts").as_deref(),
            Some("127.0.0.1 localhost\n")
        );

        let pulled = dir.path().join("pulled");
        device
            .pull_file_as_root("/system/etc/hosts", &pulled, TransferOptions::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&pulled).unwrap(), "127.0.0.1 localhost\n");

        assert!(phone
            .file_paths()
            .iter()
            .all(|path| !path.starts_with(STAGING_DIR)));
    }

    #[test]
    fn test_as_root_quotes_inner_command() {
        assert_eq!(as_root("rm -f /a"), "su -c 'rm -f /a'");
        assert!(staging_path().starts_with("/data/local/tmp/droidherd-"));
    }
}
