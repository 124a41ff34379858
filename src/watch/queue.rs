//! Publish/subscribe queue for store change events
//!
//! Every subscription owns a private buffer. `publish` appends the matching
//! part of a batch to each buffer under one registry lock and never waits on a
//! consumer, so a stalled subscriber only grows its own buffer. Buffers are
//! unbounded unless the subscriber asks for a drop-oldest limit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use super::event::WatchEvent;
use super::matcher::Matcher;

struct Subscriber {
    matcher: Matcher,
    buffer: Mutex<VecDeque<WatchEvent>>,
    notify: Notify,
    /// Drop-oldest bound; None keeps every event
    limit: Option<usize>,
    dropped: AtomicU64,
    cancelled: AtomicBool,
}

impl Subscriber {
    fn push_batch(&self, events: Vec<WatchEvent>) {
        {
            let mut buffer = self.buffer.lock();
            buffer.extend(events);
            if let Some(limit) = self.limit {
                let overflow = buffer.len().saturating_sub(limit);
                if overflow > 0 {
                    buffer.drain(..overflow);
                    let total = self.dropped.fetch_add(overflow as u64, Ordering::Relaxed) + overflow as u64;
                    warn!(dropped = overflow, total_dropped = total, limit, "watch subscriber lagging, dropped oldest events");
                }
            }
        }
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Arc<Subscriber>>,
    closed: bool,
}

/// Fan-out queue of watch events. Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct WatchQueue {
    registry: Arc<Mutex<Registry>>,
}

impl WatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with an unbounded buffer
    pub fn subscribe(&self, matcher: Matcher) -> (Subscription, CancelHandle) {
        self.register(matcher, None)
    }

    /// Subscribe with a drop-oldest buffer of at most `limit` events
    pub fn subscribe_with_limit(&self, matcher: Matcher, limit: usize) -> (Subscription, CancelHandle) {
        self.register(matcher, Some(limit.max(1)))
    }

    fn register(&self, matcher: Matcher, limit: Option<usize>) -> (Subscription, CancelHandle) {
        let sub = Arc::new(Subscriber {
            matcher,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            limit,
            dropped: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        });

        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        if registry.closed {
            sub.cancelled.store(true, Ordering::Release);
        } else {
            registry.subscribers.insert(id, sub.clone());
        }
        drop(registry);

        let cancel = CancelHandle {
            id,
            registry: Arc::downgrade(&self.registry),
            sub: sub.clone(),
        };
        (Subscription { sub, cancel: cancel.clone() }, cancel)
    }

    /// Publish the events produced by one committed entry.
    ///
    /// A subscriber sees all of its matching events from this batch before any
    /// event of a later batch.
    pub fn publish(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let registry = self.registry.lock();
        if registry.closed {
            return;
        }
        for sub in registry.subscribers.values() {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| sub.matcher.matches(e))
                .cloned()
                .collect();
            if !matching.is_empty() {
                sub.push_batch(matching);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// Stop accepting events. Subscribers drain what is buffered, then see `None`.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        for (_, sub) in registry.subscribers.drain() {
            sub.cancelled.store(true, Ordering::Release);
            sub.notify.notify_one();
        }
    }
}

/// Cancels a subscription. Idempotent and safe to call while events are
/// being published.
#[derive(Clone)]
pub struct CancelHandle {
    id: u64,
    registry: Weak<Mutex<Registry>>,
    sub: Arc<Subscriber>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if self.sub.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().subscribers.remove(&self.id);
        }
        self.sub.buffer.lock().clear();
        self.sub.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sub.cancelled.load(Ordering::Acquire)
    }
}

/// Receiving side of a subscription. Dropping it cancels the subscription.
pub struct Subscription {
    sub: Arc<Subscriber>,
    cancel: CancelHandle,
}

impl Subscription {
    /// Wait for the next event. Returns None once cancelled, or once the queue
    /// is closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.sub.cancelled.load(Ordering::Acquire) {
                return None;
            }
            self.sub.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.sub.buffer.lock().pop_front()
    }

    /// Events discarded by the drop-oldest limit
    pub fn dropped(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.sub.buffer.lock().len()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
