use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why a running pip was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    LowMemory,
    DiskExhausted,
    BuildCancelled,
    Timeout,
}

impl CancelReason {
    /// Cancellations the scheduler may retry under the resource retry budget.
    pub fn is_resource_retryable(self) -> bool {
        matches!(self, CancelReason::LowMemory)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::LowMemory => "low memory",
            CancelReason::DiskExhausted => "disk exhausted",
            CancelReason::BuildCancelled => "build cancelled",
            CancelReason::Timeout => "timeout",
        })
    }
}

/// Cooperative control channel between the resource manager and one running pip.
///
/// Clones share state. The executor observes [`PipControl::cancelled`] and
/// [`PipControl::suspended_flag`]; the manager drives them.
#[derive(Debug, Clone, Default)]
pub struct PipControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    cancel: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
    suspended: Arc<AtomicBool>,
    changed: Notify,
}

impl PipControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason sticks.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancel.cancel();
        self.inner.changed.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// Token tripped on cancellation; hand it to process runners.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Shared flag polled by synchronous runners to stop and continue the child.
    pub fn suspended_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.suspended)
    }

    /// Wait until the pip is neither suspended nor about to be. Returns early on cancellation.
    pub async fn wait_while_suspended(&self) {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            // Register before checking so a concurrent `resume` cannot be missed.
            changed.as_mut().enable();
            if !self.is_suspended() || self.is_cancelled() {
                return;
            }
            changed.await;
        }
    }
}
