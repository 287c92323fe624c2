//! The fan-out task: the only bridge from the store to the hub.
//!
//! It reads [`MessageStore::tail`] and calls [`BroadcastHub::publish`] for
//! every record, so all subscribers see the durable log's order. When the
//! tail breaks it retries once after `reconnect_backoff_ms`; if that fails it
//! goes `Degraded` and probes every `degraded_probe_interval_ms` until a tail
//! attaches again. Nothing is published while no tail is attached.

pub mod health;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FanOutSettings;
use crate::hub::BroadcastHub;
use crate::store::{MessageStore, Tail};
use crate::utils::error::PersistenceError;

pub use health::{StoreHealth, StoreStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutState {
    Starting,
    /// Tail attached and forwarding.
    Live,
    /// Tail broke; waiting out the backoff before the single retry.
    Reconnecting,
    /// No tail, or the store is failing appends. See module docs.
    Degraded,
    Stopped,
}

enum PumpEnd {
    Cancelled,
    Broken { delivered: u64 },
}

pub struct FanOut {
    store: Arc<dyn MessageStore>,
    hub: BroadcastHub,
    health: StoreHealth,
    settings: FanOutSettings,
    state: watch::Sender<FanOutState>,
}

impl FanOut {
    pub fn new(
        store: Arc<dyn MessageStore>,
        hub: BroadcastHub,
        health: StoreHealth,
        settings: FanOutSettings,
    ) -> Self {
        let (state, _) = watch::channel(FanOutState::Starting);
        Self {
            store,
            hub,
            health,
            settings,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<FanOutState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` is cancelled. `initial` is a tail attached ahead
    /// of time so nothing appended before the task is scheduled is missed.
    pub async fn run(self, initial: Option<Tail>, shutdown: CancellationToken) {
        let mut health = self.health.subscribe();
        let mut next = initial;
        let mut from_retry = false;
        let mut skip_retry = false;

        loop {
            let tail = match next.take() {
                Some(tail) => tail,
                None => match self.attach(skip_retry, &shutdown).await {
                    Some(tail) => {
                        from_retry = true;
                        tail
                    }
                    None => break,
                },
            };

            self.set_state(FanOutState::Live);
            match self.pump(tail, &shutdown, &mut health).await {
                PumpEnd::Cancelled => break,
                PumpEnd::Broken { delivered } => {
                    warn!(delivered, "store tail broken");
                    // A retried tail that breaks before delivering anything
                    // counts as the failed retry.
                    skip_retry = from_retry && delivered == 0;
                }
            }
        }

        self.set_state(FanOutState::Stopped);
        info!("fan-out task stopped");
    }

    /// Attach a fresh tail: one retry after the backoff, then degraded
    /// probing. `skip_retry` goes straight to probing.
    async fn attach(&self, skip_retry: bool, shutdown: &CancellationToken) -> Option<Tail> {
        if !skip_retry {
            self.set_state(FanOutState::Reconnecting);
            if !sleep_or_cancel(self.settings.reconnect_backoff_ms, shutdown).await {
                return None;
            }
            match self.store.tail().await {
                Ok(tail) => {
                    info!("store tail re-established");
                    return Some(tail);
                }
                Err(e) => warn!(error = %e, "tail reconnection failed"),
            }
        }

        self.set_state(FanOutState::Degraded);
        error!("live fan-out degraded, probing store");
        loop {
            if !sleep_or_cancel(self.settings.degraded_probe_interval_ms, shutdown).await {
                return None;
            }
            match self.store.tail().await {
                Ok(tail) => {
                    info!("store tail recovered");
                    return Some(tail);
                }
                Err(e) => debug!(error = %e, "store still unavailable"),
            }
        }
    }

    async fn pump(
        &self,
        mut tail: Tail,
        shutdown: &CancellationToken,
        health: &mut watch::Receiver<StoreStatus>,
    ) -> PumpEnd {
        let mut delivered = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return PumpEnd::Cancelled,
                Ok(()) = health.changed() => {
                    let status = *health.borrow_and_update();
                    match status {
                        StoreStatus::Degraded => self.set_state(FanOutState::Degraded),
                        StoreStatus::Healthy => self.set_state(FanOutState::Live),
                    }
                }
                item = tail.next() => match item {
                    Some(Ok(msg)) => {
                        delivered += 1;
                        let report = self.hub.publish(msg);
                        if report.dropped + report.evicted + report.disconnected > 0 {
                            debug!(?report, "publish overflowed some subscribers");
                        }
                    }
                    Some(Err(PersistenceError::TailBroken)) | None => {
                        return PumpEnd::Broken { delivered };
                    }
                    Some(Err(e)) => warn!(error = %e, "skipping unreadable tail record"),
                },
            }
        }
    }

    fn set_state(&self, next: FanOutState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = ?*current, to = ?next, "fan-out state");
                *current = next;
                true
            }
        });
    }
}

/// Returns `false` if cancelled first.
async fn sleep_or_cancel(ms: u64, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
    }
}
