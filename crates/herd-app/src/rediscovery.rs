//! Bounded rediscovery of lost devices
//!
//! When a connection drops, the registry asks the originating scanner to
//! scan the target again. Requests are deduplicated per scanner scope, limited
//! fleet-wide by a semaphore, and retried with exponential backoff until the
//! waiting devices are connected again or the attempts run out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use herd_bridge::{ScanReporter, Scanner};
use herd_core::prelude::*;
use herd_core::ScannerId;

use crate::persistent::PersistentDevice;

/// Retry and concurrency limits for rediscovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RediscoveryPolicy {
    /// `scan_for` calls per request before giving up
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Rediscovery scans running at once across the whole fleet
    pub max_concurrent: usize,
}

impl Default for RediscoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_concurrent: 4,
        }
    }
}

impl RediscoveryPolicy {
    /// Delay after the given zero-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

type RequestKey = (ScannerId, String);

/// Tracks in-flight rediscovery requests
#[derive(Debug)]
pub struct Rediscovery {
    policy: RediscoveryPolicy,
    limiter: Arc<Semaphore>,
    waiting: Mutex<HashMap<RequestKey, Vec<PersistentDevice>>>,
    cancel: CancellationToken,
}

impl Rediscovery {
    pub fn new(policy: RediscoveryPolicy, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            limiter: Arc::new(Semaphore::new(policy.max_concurrent.max(1))),
            policy,
            waiting: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn policy(&self) -> &RediscoveryPolicy {
        &self.policy
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<RequestKey, Vec<PersistentDevice>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of distinct requests still running
    pub fn in_flight(&self) -> usize {
        self.waiting().len()
    }

    /// Ask `scanner` to find `device` again at `target`.
    ///
    /// Returns `false` when a request with the same scope is already running;
    /// the device then joins that request instead.
    pub fn request(
        self: &Arc<Self>,
        scanner: Arc<dyn Scanner>,
        reporter: ScanReporter,
        target: &str,
        device: PersistentDevice,
    ) -> bool {
        let key = (reporter.scanner_id(), scanner.rediscovery_scope(target));
        {
            let mut waiting = self.waiting();
            if let Some(devices) = waiting.get_mut(&key) {
                if !devices.iter().any(|d| d.same_device(&device)) {
                    devices.push(device);
                }
                debug!("Rediscovery for {:?} already running", key);
                return false;
            }
            waiting.insert(key.clone(), vec![device]);
        }

        let this = Arc::clone(self);
        let target = target.to_string();
        tokio::spawn(async move { this.run(key, scanner, reporter, target).await });
        true
    }

    fn settled(&self, key: &RequestKey) -> bool {
        self.waiting()
            .get(key)
            .map_or(true, |devices| devices.iter().all(is_settled))
    }

    async fn run(
        self: Arc<Self>,
        key: RequestKey,
        scanner: Arc<dyn Scanner>,
        reporter: ScanReporter,
        target: String,
    ) {
        loop {
            let exhausted = self.attempt(&key, scanner.as_ref(), &reporter, &target).await;
            if self.finish(&key, exhausted) {
                return;
            }
            debug!("{} was lost again before its request closed", target);
        }
    }

    /// Scan until the request settles; `true` when the attempts ran out
    async fn attempt(
        &self,
        key: &RequestKey,
        scanner: &dyn Scanner,
        reporter: &ScanReporter,
        target: &str,
    ) -> bool {
        for attempt in 0..self.policy.max_attempts {
            if self.settled(key) || self.cancel.is_cancelled() {
                return false;
            }

            let outcome = {
                let Ok(_permit) = self.limiter.acquire().await else {
                    return true;
                };
                debug!(
                    "Rediscovering {} via {} (attempt {})",
                    target,
                    scanner.display_name(),
                    attempt + 1
                );
                scanner.scan_for(target, reporter).await
            };
            if let Err(e) = outcome {
                debug!("Rediscovery of {} failed: {}", target, e);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.policy.backoff(attempt)) => {}
            }
        }
        true
    }

    /// Close the request for `key` unless it has to keep going.
    ///
    /// Checked and removed under one lock, so a device that joins after the
    /// last scan is never dropped. Returns `false` when a waiting device is
    /// unsettled and neither the attempts are spent nor shutdown has begun.
    fn finish(&self, key: &RequestKey, exhausted: bool) -> bool {
        let cancelled = self.cancel.is_cancelled();
        let lost: Vec<String> = {
            let mut waiting = self.waiting();
            let lost = waiting.get(key).map_or_else(Vec::new, |devices| {
                devices
                    .iter()
                    .filter(|d| !is_settled(d))
                    .map(|d| d.stable_id().to_string())
                    .collect()
            });
            if !lost.is_empty() && !exhausted && !cancelled {
                return false;
            }
            waiting.remove(key);
            lost
        };

        if !lost.is_empty() && !cancelled {
            warn!(
                "Gave up rediscovering {} after {} attempts; waiting for the next scan",
                lost.join(", "),
                self.policy.max_attempts
            );
        }
        true
    }
}

fn is_settled(device: &PersistentDevice) -> bool {
    device.is_connected() || device.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_bridge::test_utils::{FakeDevice, FakeScanner};
    use herd_bridge::{PendingDiscoveries, ScanEvent};
    use tokio::sync::mpsc;

    fn fast_policy() -> RediscoveryPolicy {
        RediscoveryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            max_concurrent: 2,
        }
    }

    fn reporter(id: usize) -> (ScanReporter, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ScanReporter::new(ScannerId(id), tx, Arc::new(PendingDiscoveries::new())),
            rx,
        )
    }

    async fn wait_idle(rediscovery: &Rediscovery) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while rediscovery.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rediscovery did not finish");
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RediscoveryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(200), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let scanner = Arc::new(FakeScanner::new("fake"));
        let device = disconnected_device(&FakeDevice::new()).await;

        let rediscovery = Rediscovery::new(fast_policy(), CancellationToken::new());
        let (reporter, _rx) = reporter(0);
        assert!(rediscovery.request(scanner.clone(), reporter, "10.0.0.5", device));
        wait_idle(&rediscovery).await;

        assert_eq!(scanner.scan_for_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_scopes_are_collapsed() {
        let scanner = Arc::new(FakeScanner::new("fake"));
        let phone = FakeDevice::new();
        let device = PersistentDevice::new("phone", phone.connect("10.0.0.5", ScannerId(0)));
        device.shutdown().await;

        let rediscovery = Rediscovery::new(fast_policy(), CancellationToken::new());
        let (reporter, _rx) = reporter(0);
        // Closed devices count as settled, so the first request ends at once
        let first = rediscovery.request(scanner.clone(), reporter.clone(), "10.0.0.5", device.clone());
        let second = rediscovery.request(scanner.clone(), reporter, "10.0.0.5", device);
        assert!(first);
        assert!(!second);
        wait_idle(&rediscovery).await;
        assert!(scanner.scan_for_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_requests() {
        let scanner = Arc::new(FakeScanner::new("fake"));
        let device = disconnected_device(&FakeDevice::new()).await;

        let cancel = CancellationToken::new();
        let policy = RediscoveryPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..fast_policy()
        };
        let rediscovery = Rediscovery::new(policy, cancel.clone());
        let (reporter, _rx) = reporter(0);
        rediscovery.request(scanner.clone(), reporter, "10.0.0.5", device);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        wait_idle(&rediscovery).await;
        assert_eq!(scanner.scan_for_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_request_stays_open_while_a_device_is_lost() {
        let device = disconnected_device(&FakeDevice::new()).await;
        let rediscovery = Rediscovery::new(fast_policy(), CancellationToken::new());
        let key = (ScannerId(0), "10.0.0.5".to_string());
        rediscovery.waiting().insert(key.clone(), vec![device]);

        // The scan loop saw the request settled, then the device dropped again
        assert!(!rediscovery.finish(&key, false));
        assert_eq!(rediscovery.in_flight(), 1);

        assert!(rediscovery.finish(&key, true));
        assert_eq!(rediscovery.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_closes_once_devices_settle() {
        let phone = FakeDevice::new();
        let connected = PersistentDevice::new("phone", phone.connect("10.0.0.5", ScannerId(0)));
        let closed = PersistentDevice::new("tablet", phone.connect("10.0.0.6", ScannerId(0)));
        closed.shutdown().await;
        let rediscovery = Rediscovery::new(fast_policy(), CancellationToken::new());
        let key = (ScannerId(0), "10.0.0.5".to_string());
        rediscovery.waiting().insert(key.clone(), vec![connected, closed]);

        assert!(rediscovery.finish(&key, false));
        assert_eq!(rediscovery.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_closes_with_lost_devices() {
        let device = disconnected_device(&FakeDevice::new()).await;
        let cancel = CancellationToken::new();
        let rediscovery = Rediscovery::new(fast_policy(), cancel.clone());
        let key = (ScannerId(0), "10.0.0.5".to_string());
        rediscovery.waiting().insert(key.clone(), vec![device]);

        cancel.cancel();
        assert!(rediscovery.finish(&key, false));
        assert_eq!(rediscovery.in_flight(), 0);
    }

    /// Device whose only connection is already broken and noticed
    async fn disconnected_device(phone: &FakeDevice) -> PersistentDevice {
        let lost = phone.connect("10.0.0.5", ScannerId(0));
        lost.sever();
        let device = PersistentDevice::new("phone", lost);
        tokio::spawn({
            let device = device.clone();
            async move {
                let _ = device.reboot().await;
            }
        });
        while device.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        device
    }
}
