//! Store health as seen from the write path.
//!
//! Sessions report every append outcome; after `threshold` consecutive
//! failures the status flips to `Degraded` until the next success.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Healthy,
    Degraded,
}

#[derive(Debug)]
struct HealthInner {
    consecutive_failures: AtomicU32,
    threshold: u32,
    status: watch::Sender<StoreStatus>,
}

#[derive(Debug, Clone)]
pub struct StoreHealth {
    inner: Arc<HealthInner>,
}

impl StoreHealth {
    pub fn new(threshold: u32) -> Self {
        let (status, _) = watch::channel(StoreStatus::Healthy);
        Self {
            inner: Arc::new(HealthInner {
                consecutive_failures: AtomicU32::new(0),
                threshold: threshold.max(1),
                status,
            }),
        }
    }

    pub fn record_success(&self) {
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        if self.set(StoreStatus::Healthy) {
            info!("store recovered");
        }
    }

    pub fn record_failure(&self) {
        let failures = self
            .inner
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if failures >= self.inner.threshold && self.set(StoreStatus::Degraded) {
            warn!(failures, "store degraded after repeated append failures");
        }
    }

    pub fn status(&self) -> StoreStatus {
        *self.inner.status.borrow()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreStatus> {
        self.inner.status.subscribe()
    }

    /// Returns whether the status changed.
    fn set(&self, next: StoreStatus) -> bool {
        self.inner.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new(3)
    }
}
