//! Hub engine
//!
//! The hub is the single owner of "who is listening". Its registry is an
//! `RwLock<HashMap<..>>` that guards add, remove and snapshot only; the
//! per-subscriber pushes in [`BroadcastHub::publish`] happen after the read
//! guard is released.
//!
//! Ordering: each subscriber sees messages in the order `publish` was called.
//! The fan-out task is the only publisher, so that is the store's append order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::subscription::{CloseReason, Delivery, SubscriberQueue, Subscription};
use crate::config::HubSettings;
use crate::message::{Message, SessionId};

/// Counts from one [`BroadcastHub::publish`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub queued: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub disconnected: usize,
    /// Subscribers skipped because they produced the message and echo is off.
    pub skipped: usize,
}

#[derive(Debug)]
pub(crate) struct HubInner {
    subscribers: RwLock<HashMap<SessionId, Arc<SubscriberQueue>>>,
    settings: HubSettings,
}

impl HubInner {
    /// Remove `queue` if it is still the registered entry for its id.
    pub(crate) fn remove(&self, queue: &Arc<SubscriberQueue>) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match subscribers.get(&queue.id) {
            Some(current) if Arc::ptr_eq(current, queue) => {
                subscribers.remove(&queue.id);
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<SubscriberQueue>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// In-memory multicast point. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Register a new subscriber under a fresh id.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_as(format!("sub-{}", Uuid::new_v4()))
    }

    /// Register a subscriber under `id`, normally the owning session's id.
    ///
    /// An existing registration with the same id is closed and replaced.
    /// No backlog is delivered.
    pub fn subscribe_as(&self, id: impl Into<SessionId>) -> Subscription {
        let id = id.into();
        let queue = Arc::new(SubscriberQueue::new(
            id.clone(),
            self.inner.settings.subscriber_buffer_capacity.max(1),
        ));

        let previous = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&queue));
        if let Some(previous) = previous {
            warn!(subscriber = %id, "replacing existing subscription");
            previous.close(CloseReason::Unsubscribed);
        }

        debug!(subscriber = %id, "subscriber registered");
        Subscription::new(queue, Arc::downgrade(&self.inner))
    }

    /// Remove a subscriber by id. Idempotent; returns whether it was present.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(queue) => {
                queue.close(CloseReason::Unsubscribed);
                debug!(subscriber = %id, "subscriber unregistered");
                true
            }
            None => false,
        }
    }

    /// Offer `msg` to every registered subscriber without waiting on any of
    /// them. Full queues are handled by the configured overflow policy.
    pub fn publish(&self, msg: Message) -> PublishReport {
        let msg = Arc::new(msg);
        let policy = self.inner.settings.overflow_policy;
        let echo = self.inner.settings.echo_to_sender;

        let mut report = PublishReport::default();
        let mut overflowed = Vec::new();

        for queue in self.inner.snapshot() {
            if !echo && msg.origin.as_deref() == Some(queue.id.as_str()) {
                report.skipped += 1;
                continue;
            }

            match queue.push(Arc::clone(&msg), policy) {
                Delivery::Queued => report.queued += 1,
                Delivery::Dropped => {
                    report.dropped += 1;
                    debug!(subscriber = %queue.id, id = %msg.id, "queue full, message dropped");
                }
                Delivery::Evicted => {
                    report.evicted += 1;
                    debug!(subscriber = %queue.id, id = %msg.id, "queue full, oldest message evicted");
                }
                Delivery::Disconnected => {
                    report.disconnected += 1;
                    overflowed.push(queue);
                }
                Delivery::Closed => {}
            }
        }

        for queue in overflowed {
            if self.inner.remove(&queue) {
                warn!(subscriber = %queue.id, "disconnecting slow subscriber");
            }
        }

        debug!(id = %msg.id, queued = report.queued, "message published");
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close every subscription. Used on shutdown.
    pub fn close(&self) {
        let drained: Vec<_> = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, queue)| queue)
            .collect();

        for queue in &drained {
            queue.close(CloseReason::HubShutdown);
        }
        info!(subscribers = drained.len(), "broadcast hub closed");
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}
