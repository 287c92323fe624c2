//! Per-subscriber bounded queues.
//!
//! Every subscriber owns its own queue and its own lock, so a publish only
//! ever contends with the one consumer draining that queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

use super::engine::HubInner;
use crate::config::OverflowPolicy;
use crate::message::{Message, SessionId};

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    /// Closed by the `disconnect-subscriber` overflow policy.
    Overflow,
    HubShutdown,
}

/// Outcome of offering one message to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the new message was dropped for this subscriber.
    Dropped,
    /// Queue full; the oldest queued message was evicted to make room.
    Evicted,
    /// Queue full; the subscriber was closed.
    Disconnected,
    /// The subscriber was already closed.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    buf: VecDeque<Arc<Message>>,
    closed: Option<CloseReason>,
    missed: u64,
}

#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    pub(crate) id: SessionId,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    pub(crate) fn new(id: SessionId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                closed: None,
                missed: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never waits on the consumer.
    pub(crate) fn push(&self, msg: Arc<Message>, policy: OverflowPolicy) -> Delivery {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Delivery::Closed;
        }

        let delivery = if state.buf.len() < self.capacity {
            state.buf.push_back(msg);
            Delivery::Queued
        } else {
            match policy {
                OverflowPolicy::DropNewest => {
                    state.missed += 1;
                    return Delivery::Dropped;
                }
                OverflowPolicy::DropOldest => {
                    state.buf.pop_front();
                    state.buf.push_back(msg);
                    state.missed += 1;
                    Delivery::Evicted
                }
                OverflowPolicy::DisconnectSubscriber => {
                    state.closed = Some(CloseReason::Overflow);
                    state.buf.clear();
                    Delivery::Disconnected
                }
            }
        };
        drop(state);

        self.notify.notify_one();
        delivery
    }

    /// Close and discard anything still queued. Returns `false` if it was
    /// already closed.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(reason);
        state.buf.clear();
        drop(state);

        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Result<Option<Arc<Message>>, CloseReason> {
        let mut state = self.lock();
        if let Some(msg) = state.buf.pop_front() {
            return Ok(Some(msg));
        }
        match state.closed {
            Some(reason) => Err(reason),
            None => Ok(None),
        }
    }
}

/// A live registration with the [`BroadcastHub`](super::BroadcastHub).
///
/// Dropping it unregisters from the hub.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub(crate) fn new(queue: Arc<SubscriberQueue>, hub: Weak<HubInner>) -> Self {
        Self { queue, hub }
    }

    pub fn id(&self) -> &str {
        &self.queue.id
    }

    /// Wait for the next message. `None` once the subscription is closed.
    pub async fn recv(&self) -> Option<Arc<Message>> {
        loop {
            // Notify keeps a permit if a push lands between pop and await.
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => notified.await,
                Err(_) => return None,
            }
        }
    }

    pub fn try_recv(&self) -> Option<Arc<Message>> {
        self.queue.pop().ok().flatten()
    }

    /// Messages lost to overflow since the last call.
    pub fn take_missed(&self) -> u64 {
        std::mem::take(&mut self.queue.lock().missed)
    }

    pub fn is_active(&self) -> bool {
        self.queue.lock().closed.is_none()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.lock().closed
    }

    /// Number of messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.queue.lock().buf.len()
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.queue);
        }
        self.queue.close(CloseReason::Unsubscribed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
