//! Device registry: one [`PersistentDevice`] per stable identity
//!
//! Scanners publish connections through a channel drained by a pump task. Each
//! connection is identified, then either becomes a new device or is handed to
//! the existing device with the same identity. Lost connections trigger
//! bounded rediscovery through the scanner that produced them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use herd_bridge::{Connection, PendingDiscoveries, ScanEvent, ScanReporter, Scanner};
use herd_core::prelude::*;
use herd_core::ScannerId;

use crate::identity::IdentityResolver;
use crate::persistent::{DeviceEvent, PersistentDevice};
use crate::rediscovery::{Rediscovery, RediscoveryPolicy};

/// Buffered registry events per subscriber
const EVENT_CAPACITY: usize = 256;

/// Notifications for registry subscribers
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was seen for the first time. Raised once per identity.
    DeviceDiscovered(PersistentDevice),
    /// Advisory text from discovery, identification or connection loss
    DiscoveryWarning(String),
    /// The device lost its connection and is awaiting reconnect
    DeviceDisconnected {
        stable_id: String,
        connection_id: String,
    },
    /// The device received a new connection
    DeviceReconnected {
        stable_id: String,
        connection_id: String,
    },
}

/// Construction options for [`DeviceRegistry`]
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub identity: IdentityResolver,
    pub rediscovery: RediscoveryPolicy,
}

#[derive(Debug, Default)]
struct DeviceTable {
    by_id: HashMap<String, PersistentDevice>,
    order: Vec<PersistentDevice>,
}

enum Lookup {
    Created(PersistentDevice, broadcast::Receiver<DeviceEvent>),
    Existing(PersistentDevice),
    ShuttingDown,
}

struct RegistryInner {
    scanners: RwLock<Vec<Arc<dyn Scanner>>>,
    devices: Mutex<DeviceTable>,
    events: broadcast::Sender<RegistryEvent>,
    scan_tx: mpsc::UnboundedSender<ScanEvent>,
    pending: Arc<PendingDiscoveries>,
    identity: IdentityResolver,
    rediscovery: Arc<Rediscovery>,
    cancel: CancellationToken,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RegistryInner {
    fn table(&self) -> MutexGuard<'_, DeviceTable> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scanner(&self, id: ScannerId) -> Option<Arc<dyn Scanner>> {
        self.scanners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id.0)
            .cloned()
    }

    fn reporter(&self, id: ScannerId) -> ScanReporter {
        ScanReporter::new(id, self.scan_tx.clone(), Arc::clone(&self.pending))
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.publish(RegistryEvent::DiscoveryWarning(message));
    }

    /// Find the device for `stable_id`, creating it around `connection` if new.
    ///
    /// A new device is returned with its event receiver, subscribed before any
    /// other task can see the device. Nothing is created once shutdown has
    /// started; the shutdown snapshot is taken under the same lock.
    fn get_or_create(&self, stable_id: &str, connection: &Arc<dyn Connection>) -> Lookup {
        let mut table = self.table();
        if self.cancel.is_cancelled() {
            return Lookup::ShuttingDown;
        }
        if let Some(device) = table.by_id.get(stable_id) {
            return Lookup::Existing(device.clone());
        }
        let device = PersistentDevice::new(stable_id, Arc::clone(connection));
        let events = device.subscribe();
        table.by_id.insert(stable_id.to_string(), device.clone());
        table.order.push(device.clone());
        Lookup::Created(device, events)
    }

    async fn on_connection_discovered(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        if self.cancel.is_cancelled() {
            connection.dispose().await;
            return;
        }

        let stable_id = match self.identity.resolve(&connection).await {
            Ok(id) => id,
            Err(e) => {
                self.warn(format!(
                    "An error occurred while identifying {}:\n{}",
                    connection.connection_id(),
                    e
                ));
                connection.dispose().await;
                return;
            }
        };

        match self.get_or_create(&stable_id, &connection) {
            Lookup::ShuttingDown => {
                debug!(
                    "Shutting down, dropping {} ({})",
                    connection.connection_id(),
                    stable_id
                );
                connection.dispose().await;
            }
            Lookup::Created(device, events) => {
                info!(
                    "Discovered {} via {}",
                    stable_id,
                    connection.connection_id()
                );
                self.watch(stable_id, events);
                self.publish(RegistryEvent::DeviceDiscovered(device));
            }
            Lookup::Existing(device) => {
                debug!(
                    "{} rediscovered via {}",
                    stable_id,
                    connection.connection_id()
                );
                device.set_device(connection).await;
            }
        }
    }

    /// Relay one device's events until the device or the registry goes away
    fn watch(self: &Arc<Self>, stable_id: String, mut events: broadcast::Receiver<DeviceEvent>) {
        let registry = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                match event {
                    Ok(DeviceEvent::ConnectionLost {
                        connection_id,
                        owner,
                        error,
                    }) => {
                        inner.warn(format!(
                            "A connection error occurred on {}:\n{}",
                            connection_id, error
                        ));
                        inner.publish(RegistryEvent::DeviceDisconnected {
                            stable_id: stable_id.clone(),
                            connection_id: connection_id.clone(),
                        });
                        inner.request_rediscovery(&stable_id, owner, &connection_id);
                    }
                    Ok(DeviceEvent::ConnectionEstablished { connection_id }) => {
                        inner.publish(RegistryEvent::DeviceReconnected {
                            stable_id: stable_id.clone(),
                            connection_id,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("{}: missed {} device events", stable_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            trace!("Stopped watching {}", stable_id);
        });
    }

    fn request_rediscovery(&self, stable_id: &str, owner: ScannerId, target: &str) {
        let Some(device) = self.table().by_id.get(stable_id).cloned() else {
            return;
        };
        let Some(scanner) = self.scanner(owner) else {
            warn!("{}: owning {} is not registered", stable_id, owner);
            return;
        };
        self.rediscovery
            .request(scanner, self.reporter(owner), target, device);
    }
}

/// Receive scanner events and handle each discovered connection on its own task
async fn pump(
    registry: Weak<RegistryInner>,
    mut rx: mpsc::UnboundedReceiver<ScanEvent>,
    pending: Arc<PendingDiscoveries>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = registry.upgrade() else {
            drop_event(event, &pending).await;
            break;
        };

        match event {
            ScanEvent::Discovered(connection) => {
                let pending = Arc::clone(&pending);
                tokio::spawn(async move {
                    inner.on_connection_discovered(connection).await;
                    pending.end();
                });
            }
            ScanEvent::Warning { scanner, message } => {
                debug!("Warning from {}", scanner);
                inner.warn(message);
            }
        }
    }

    // Connections still queued belong to nobody
    rx.close();
    while let Ok(event) = rx.try_recv() {
        drop_event(event, &pending).await;
    }
}

async fn drop_event(event: ScanEvent, pending: &PendingDiscoveries) {
    if let ScanEvent::Discovered(connection) = event {
        connection.dispose().await;
        pending.end();
    }
}

/// Owns every known device and the scanners that find them.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.inner.table().order.len())
            .field("pending", &self.inner.pending.count())
            .finish()
    }
}

impl DeviceRegistry {
    /// Create a registry. Must be called inside a tokio runtime.
    pub fn new(options: RegistryOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingDiscoveries::new());
        let cancel = CancellationToken::new();

        let inner = Arc::new(RegistryInner {
            scanners: RwLock::new(Vec::new()),
            devices: Mutex::new(DeviceTable::default()),
            events,
            scan_tx,
            pending: Arc::clone(&pending),
            identity: options.identity,
            rediscovery: Rediscovery::new(options.rediscovery, cancel.child_token()),
            cancel: cancel.clone(),
        });

        tokio::spawn(pump(Arc::downgrade(&inner), scan_rx, pending, cancel));
        Self { inner }
    }

    /// Register a scanner after validating its configuration
    pub fn add_scanner(&self, scanner: Arc<dyn Scanner>) -> Result<ScannerId> {
        if let Some(problem) = scanner.configuration_error() {
            return Err(Error::configuration(format!(
                "{}: {}",
                scanner.display_name(),
                problem
            )));
        }
        let mut scanners = self
            .inner
            .scanners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let id = ScannerId(scanners.len());
        info!("Registered {} scanner as {}", scanner.display_name(), id);
        scanners.push(scanner);
        Ok(id)
    }

    pub fn scanner_count(&self) -> usize {
        self.inner
            .scanners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run every scanner once, concurrently, and wait until every connection
    /// they found has been identified and merged
    pub async fn refresh(&self) {
        let scanners: Vec<(ScannerId, Arc<dyn Scanner>)> = self
            .inner
            .scanners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .enumerate()
            .map(|(i, s)| (ScannerId(i), Arc::clone(s)))
            .collect();

        let scans = scanners.iter().map(|(id, scanner)| {
            let reporter = self.inner.reporter(*id);
            async move { scanner.scan(&reporter).await }
        });
        for result in join_all(scans).await {
            if let Err(e) = result {
                self.inner.warn(format!(
                    "An error occurred while scanning for devices: {}",
                    e
                ));
            }
        }

        self.inner.pending.wait_idle().await;
    }

    /// Refresh every `interval` until `cancel` fires
    pub async fn run_refresh_loop(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.refresh() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Refresh loop stopped");
    }

    /// Every known device, in discovery order
    pub fn devices(&self) -> Vec<PersistentDevice> {
        self.inner.table().order.clone()
    }

    pub fn device(&self, stable_id: &str) -> Option<PersistentDevice> {
        self.inner.table().by_id.get(stable_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Stop background work and shut down every device
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let devices = self.devices();
        join_all(devices.iter().map(|d| d.shutdown())).await;
        info!("Registry shut down ({} devices)", devices.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_bridge::test_utils::{FakeDevice, FakeScanner};
    use tokio::sync::broadcast::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const MARKER: &str = crate::identity::DEFAULT_MARKER_PATH;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(RegistryOptions {
            rediscovery: RediscoveryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
                max_concurrent: 2,
            },
            ..Default::default()
        })
    }

    fn drain(events: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut seen = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Empty) => return seen,
                Err(e) => panic!("event channel failed: {:?}", e),
            }
        }
    }

    fn warnings(events: &[RegistryEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::DiscoveryWarning(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rescan_merges_into_existing_device() {
        let phone = FakeDevice::new();
        let scanner = Arc::new(FakeScanner::new("usb").with_device("usb-1", phone.clone()));
        let registry = registry();
        registry.add_scanner(scanner.clone()).unwrap();
        let mut events = registry.subscribe();

        registry.refresh().await;
        let devices = registry.devices();
        assert_eq!(devices.len(), 1);
        let stable_id = phone.file_text(MARKER).unwrap().trim().to_string();
        assert_eq!(devices[0].stable_id(), stable_id);

        registry.refresh().await;
        assert_eq!(registry.devices().len(), 1);
        assert!(registry.devices()[0].same_device(&devices[0]));

        let connections = scanner.connections();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].dispose_count(), 1);
        assert_eq!(connections[1].dispose_count(), 0);

        let discovered = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::DeviceDiscovered(_)))
            .count();
        assert_eq!(discovered, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_discovery_creates_one_device() {
        let phone = FakeDevice::new().with_file(MARKER, "shared-id\n");
        let usb = Arc::new(FakeScanner::new("usb").with_device("usb-1", phone.clone()));
        let ssh = Arc::new(FakeScanner::new("ssh").with_device("10.0.0.5", phone.clone()));
        let registry = registry();
        registry.add_scanner(usb.clone()).unwrap();
        registry.add_scanner(ssh.clone()).unwrap();

        registry.refresh().await;

        assert_eq!(registry.devices().len(), 1);
        let device = registry.device("shared-id").unwrap();
        assert!(device.is_connected());

        let all: Vec<_> = usb.connections().into_iter().chain(ssh.connections()).collect();
        let disposals: Vec<usize> = all.iter().map(|c| c.dispose_count()).collect();
        assert_eq!(disposals.iter().sum::<usize>(), 1);
        assert!(disposals.iter().all(|&n| n <= 1));

        registry.shutdown().await;
        assert!(all.iter().all(|c| c.dispose_count() == 1));
    }

    #[tokio::test]
    async fn test_identity_failure_is_reported_and_connection_dropped() {
        let phone = FakeDevice::new().with_file(MARKER, "one\ntwo\n");
        let scanner = Arc::new(FakeScanner::new("usb").with_device("usb-1", phone));
        let registry = registry();
        registry.add_scanner(scanner.clone()).unwrap();
        let mut events = registry.subscribe();

        registry.refresh().await;

        assert!(registry.devices().is_empty());
        assert_eq!(scanner.connections()[0].dispose_count(), 1);
        let warnings = warnings(&drain(&mut events));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("An error occurred while identifying usb-1:\n"));
    }

    #[tokio::test]
    async fn test_scanner_warnings_and_failures_are_published() {
        let noisy = Arc::new(FakeScanner::new("usb"));
        noisy.warn_on_scan("Skipping 1 offline device(s) (which cannot be controlled)\nX: offline");
        let broken = Arc::new(FakeScanner::new("ssh"));
        broken.fail_scans("network unreachable");

        let registry = registry();
        registry.add_scanner(noisy).unwrap();
        registry.add_scanner(broken).unwrap();
        let mut events = registry.subscribe();

        registry.refresh().await;
        eventually(|| events.len() >= 2).await;

        let mut warnings = warnings(&drain(&mut events));
        warnings.sort();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("An error occurred while scanning for devices: "));
        assert!(warnings[0].contains("network unreachable"));
        assert!(warnings[1].starts_with("Skipping 1 offline device(s)"));
    }

    #[tokio::test]
    async fn test_misconfigured_scanner_is_refused() {
        let scanner = Arc::new(FakeScanner::new("ssh"));
        scanner.set_configuration_error(Some("Start address comes after end address"));

        let registry = registry();
        let err = registry.add_scanner(scanner.clone()).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(registry.scanner_count(), 0);
        assert_eq!(scanner.scan_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lost_connection_is_rediscovered() {
        let phone = FakeDevice::new();
        let scanner = Arc::new(FakeScanner::new("ssh").with_device("10.0.0.5", phone.clone()));
        let registry = registry();
        registry.add_scanner(scanner.clone()).unwrap();
        registry.refresh().await;
        let mut events = registry.subscribe();

        let device = registry.devices().remove(0);
        scanner.connections()[0].sever();

        tokio::time::timeout(TIMEOUT, device.reboot())
            .await
            .expect("reboot should complete after rediscovery")
            .unwrap();

        assert_eq!(phone.reboot_count(), 1);
        let targets = scanner.scan_for_calls();
        assert!(!targets.is_empty());
        assert!(targets.iter().all(|target| target == "10.0.0.5"));
        eventually(|| scanner.connections()[0].dispose_count() == 1).await;

        let seen = drain(&mut events);
        assert!(warnings(&seen)[0].starts_with("A connection error occurred on 10.0.0.5:\n"));
        assert!(seen
            .iter()
            .any(|e| matches!(e, RegistryEvent::DeviceDisconnected { connection_id, .. } if connection_id == "10.0.0.5")));
        assert!(seen
            .iter()
            .any(|e| matches!(e, RegistryEvent::DeviceReconnected { stable_id, .. } if stable_id == device.stable_id())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_loop_stops_on_cancel() {
        let scanner = Arc::new(FakeScanner::new("usb"));
        let registry = registry();
        registry.add_scanner(scanner.clone()).unwrap();

        let cancel = CancellationToken::new();
        let looping = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move {
                registry
                    .run_refresh_loop(Duration::from_millis(10), cancel)
                    .await
            }
        });

        eventually(|| scanner.scan_count() >= 3).await;
        cancel.cancel();
        tokio::time::timeout(TIMEOUT, looping).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_discovery_finishing_after_shutdown_releases_the_connection() {
        let phone = FakeDevice::new().with_file(MARKER, "late-1\n");
        let connection = phone.connect("usb-7", ScannerId(0));
        connection.set_latency(Duration::from_millis(200));
        let registry = registry();

        let discovering = tokio::spawn({
            let inner = Arc::clone(&registry.inner);
            let connection: Arc<dyn Connection> = connection.clone();
            async move { inner.on_connection_discovered(connection).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.shutdown().await;
        tokio::time::timeout(TIMEOUT, discovering).await.unwrap().unwrap();

        assert!(registry.devices().is_empty());
        assert_eq!(connection.dispose_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_closes_devices() {
        let phone = FakeDevice::new();
        let scanner = Arc::new(FakeScanner::new("usb").with_device("usb-1", phone));
        let registry = registry();
        registry.add_scanner(scanner.clone()).unwrap();
        registry.refresh().await;

        let device = registry.devices().remove(0);
        registry.shutdown().await;

        assert!(device.is_closed());
        assert_eq!(scanner.connections()[0].dispose_count(), 1);
        assert!(matches!(
            device.reboot().await,
            Err(Error::DeviceClosed { .. })
        ));
    }
}
