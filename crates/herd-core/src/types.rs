//! Shared value types: scanner identity and file-transfer options

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Identifies a registered scanner.
///
/// Connections carry this instead of a pointer to the scanner that produced
/// them, so a short-lived connection never keeps a scanner alive. The
/// registry resolves it back to the scanner when rediscovery is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScannerId(pub usize);

impl fmt::Display for ScannerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scanner#{}", self.0)
    }
}

/// Callback receiving transfer progress as a fraction in `[0, 1]`
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Cancellation and progress reporting for a push or pull
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Cancelling this token aborts the transfer with `Error::Cancelled`
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Start tracking progress for one transfer call
    pub fn tracker(&self) -> ProgressTracker {
        ProgressTracker {
            callback: self.progress.clone(),
            last: 0.0,
        }
    }
}

/// Turns byte counts into clamped, non-decreasing progress fractions.
pub struct ProgressTracker {
    callback: Option<ProgressFn>,
    last: f64,
}

impl ProgressTracker {
    /// Report `done` of `total` bytes. Unknown or zero totals report nothing
    /// until [`ProgressTracker::finish`].
    pub fn report(&mut self, done: u64, total: Option<u64>) {
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
        self.emit(fraction);
    }

    /// Report completion
    pub fn finish(&mut self) {
        self.emit(1.0);
    }

    fn emit(&mut self, fraction: f64) {
        if fraction < self.last {
            return;
        }
        self.last = fraction;
        if let Some(callback) = &self.callback {
            callback(fraction);
        }
    }
}
