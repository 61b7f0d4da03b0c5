//! Discovery strategies and the reporter they publish through

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use herd_core::prelude::*;
use herd_core::ScannerId;

use crate::connection::Connection;

/// A discovery strategy for one transport family.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Short label shown in warnings, e.g. "USB" or "SSH"
    fn display_name(&self) -> &str;

    /// Validate the scanner's own settings before any network activity.
    /// `None` means the configuration is usable.
    fn configuration_error(&self) -> Option<String>;

    /// Perform one full discovery pass
    async fn scan(&self, reporter: &ScanReporter) -> Result<()>;

    /// Scan one previously known target again after its connection was lost
    async fn scan_for(&self, target: &str, reporter: &ScanReporter) -> Result<()>;

    /// Rediscovery requests with equal scope are interchangeable. Scanners
    /// whose `scan_for` is a full scan return one scope for every target.
    fn rediscovery_scope(&self, target: &str) -> String {
        target.to_string()
    }
}

/// Notifications published by scanners
pub enum ScanEvent {
    Discovered(Arc<dyn Connection>),
    Warning { scanner: ScannerId, message: String },
}

impl fmt::Debug for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanEvent::Discovered(c) => f.debug_tuple("Discovered").field(&c.connection_id()).finish(),
            ScanEvent::Warning { scanner, message } => f
                .debug_struct("Warning")
                .field("scanner", scanner)
                .field("message", message)
                .finish(),
        }
    }
}

/// Counts discovered connections that have not been handled yet.
#[derive(Debug, Default)]
pub struct PendingDiscoveries {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingDiscoveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until every begun discovery has ended
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Fire-and-forget publishing handle given to a scanner for each pass.
#[derive(Clone)]
pub struct ScanReporter {
    scanner: ScannerId,
    tx: mpsc::UnboundedSender<ScanEvent>,
    pending: Arc<PendingDiscoveries>,
}

impl fmt::Debug for ScanReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanReporter")
            .field("scanner", &self.scanner)
            .field("pending", &self.pending.count())
            .finish()
    }
}

impl ScanReporter {
    pub fn new(
        scanner: ScannerId,
        tx: mpsc::UnboundedSender<ScanEvent>,
        pending: Arc<PendingDiscoveries>,
    ) -> Self {
        Self {
            scanner,
            tx,
            pending,
        }
    }

    /// Id to stamp on connections this scanner creates
    pub fn scanner_id(&self) -> ScannerId {
        self.scanner
    }

    /// Publish a newly established connection
    pub fn discovered(&self, connection: Arc<dyn Connection>) {
        debug!(
            "{} discovered connection {}",
            self.scanner,
            connection.connection_id()
        );
        self.pending.begin();
        if self.tx.send(ScanEvent::Discovered(connection)).is_err() {
            // The registry is gone; nobody will ever handle it
            self.pending.end();
            warn!("Discovery channel closed, dropping connection");
        }
    }

    /// Publish a non-fatal discovery problem
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{} warning: {}", self.scanner, message);
        let _ = self.tx.send(ScanEvent::Warning {
            scanner: self.scanner,
            message,
        });
    }
}
