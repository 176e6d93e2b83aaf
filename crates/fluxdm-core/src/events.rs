//! Event bus between the engine and its front-ends
//!
//! Publishing never blocks. Each subscriber owns a bounded queue; when it is
//! full the oldest progress update is shed to make room. Lifecycle events
//! are always delivered.

use fluxdm_types::EngineEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    capacity: usize,
}

struct SubscriberQueue {
    events: Mutex<VecDeque<EngineEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a new subscriber; it sees events published from now on
    pub fn subscribe(&self) -> EventSubscriber {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.inner.subscribers.lock().push(Arc::downgrade(&queue));
        EventSubscriber { queue }
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);

        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            queue.push(event.clone(), self.inner.capacity);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for queue in self.subscribers.get_mut().iter().filter_map(Weak::upgrade) {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
    }
}

impl SubscriberQueue {
    fn push(&self, event: EngineEvent, capacity: usize) {
        {
            let mut events = self.events.lock();
            if events.len() >= capacity {
                if let Some(pos) = events.iter().position(EngineEvent::is_droppable) {
                    events.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else if event.is_droppable() {
                    // Queue is all lifecycle events; the update is the one to go
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving end of the event bus
pub struct EventSubscriber {
    queue: Arc<SubscriberQueue>,
}

impl EventSubscriber {
    /// Wait for the next event; `None` once the engine is gone and the
    /// queue is drained
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Progress updates shed for this subscriber so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}
