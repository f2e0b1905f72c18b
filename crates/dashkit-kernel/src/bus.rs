//! Notification bus
//!
//! Topic based publish/subscribe. Widgets subscribe in their constructor and
//! keep the returned [`Subscription`]; dropping it removes the handler, which
//! is what makes it safe to unload a widget's module afterwards. The drop
//! waits for calls of the handler still running on other threads and releases
//! the closure itself, so nothing pointing into the module's code outlives
//! the subscription.
//!
//! Handlers must not block on the thread that drops their subscription.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Well-known topics.
pub mod topics {
    /// Text submitted by the user for all widgets to consume.
    pub const DATA_SUBMITTED: &str = "data.submitted";
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

thread_local! {
    /// Slots whose handler is running on this thread, innermost last.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_delivering(id: u64) -> bool {
    DELIVERING.with(|stack| stack.borrow().contains(&id))
}

/// Marks a slot as running on the current thread.
struct Delivery(u64);

impl Delivery {
    fn enter(id: u64) -> Self {
        DELIVERING.with(|stack| stack.borrow_mut().push(id));
        Delivery(id)
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        DELIVERING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.0) {
                stack.remove(pos);
            }
        });
    }
}

/// One registered handler.
///
/// Calls hold the read side of `handler`; unsubscribing takes the write side,
/// which waits for running calls and empties the slot.
struct Slot {
    id: u64,
    handler: RwLock<Option<Handler>>,
    /// Unsubscribed from inside its own call; released once that call returns.
    retired: AtomicBool,
}

impl Slot {
    fn release(&self) {
        let handler = self.handler.write().take();
        drop(handler);
    }
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Vec<Arc<Slot>>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to a shared notification bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// The handler stays registered for as long as the returned guard lives.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            handler: RwLock::new(Some(Arc::new(handler))),
            retired: AtomicBool::new(false),
        });
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&slot));
        debug!(topic, id, "bus subscription added");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            slot,
        }
    }

    /// Deliver `payload` to every handler subscribed to `topic`.
    ///
    /// Handlers run on the calling thread. A panicking handler is logged and
    /// skipped. Returns the number of handlers that completed.
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        let slots: Vec<Arc<Slot>> = match self.inner.topics.read().get(topic) {
            Some(slots) => slots.iter().map(Arc::clone).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for slot in slots {
            let outcome = {
                // Recursive so a handler publishing again cannot deadlock
                // behind a waiting unsubscribe.
                let guard = slot.handler.read_recursive();
                let Some(handler) = guard.as_ref() else {
                    continue;
                };
                let _delivery = Delivery::enter(slot.id);
                catch_unwind(AssertUnwindSafe(|| handler(payload)))
            };
            match outcome {
                Ok(()) => delivered += 1,
                Err(_) => warn!(topic, "bus handler panicked"),
            }
            if slot.retired.load(Ordering::Acquire) && !is_delivering(slot.id) {
                slot.release();
            }
        }
        delivered
    }

    /// Number of live handlers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one live handler.
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .topics
            .read()
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .finish()
    }
}

/// Guard for a bus subscription; unsubscribes on drop.
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: String,
    slot: Arc<Slot>,
}

impl Subscription {
    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unsubscribe now.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.slot.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let id = self.slot.id;
        if let Some(bus) = self.bus.upgrade() {
            let mut topics = bus.topics.write();
            if let Some(slots) = topics.get_mut(&self.topic) {
                slots.retain(|slot| slot.id != id);
                if slots.is_empty() {
                    topics.remove(&self.topic);
                }
            }
        }

        if is_delivering(id) {
            // Dropped from inside its own handler; the publishing call
            // releases the slot once the handler returns.
            self.slot.retired.store(true, Ordering::Release);
        } else {
            self.slot.release();
        }
        debug!(topic = %self.topic, id, "bus subscription removed");
    }
}
