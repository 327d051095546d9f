//! Ordered, synchronous multi-subscriber notification for dronelink.
//!
//! An [`EventBus`] is one named event kind (say, "packet received"). Any
//! number of handlers subscribe to it; [`EventBus::publish`] calls each of
//! them in the order they subscribed, on the caller's task, before
//! returning.
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use dronelink_events::EventBus;
//!
//! let disconnected: EventBus<str> = EventBus::new("disconnected");
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = Arc::clone(&log);
//! let id = disconnected.subscribe(move |uri: &str| sink.lock().unwrap().push(uri.to_string()));
//!
//! disconnected.publish("udp://192.168.43.42:2390");
//! assert!(disconnected.unsubscribe(id));
//! disconnected.publish("ignored");
//!
//! assert_eq!(*log.lock().unwrap(), vec!["udp://192.168.43.42:2390"]);
//! ```
//!
//! # Failure isolation
//!
//! There is none at this layer: a panicking subscriber unwinds through
//! `publish`. Publishers on time-sensitive paths keep their subscribers
//! short and non-blocking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Subscriber<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A named event with an ordered list of subscribers.
///
/// `A` is the argument every subscriber receives by reference. It may be
/// unsized, so `EventBus<str>` hands out `&str`.
pub struct EventBus<A: ?Sized> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<A>)>>,
}

impl<A: ?Sized + 'static> EventBus<A> {
    /// Creates an event with no subscribers. `name` shows up in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends `handler` to the subscriber list.
    pub fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        tracing::trace!(event = self.name, %id, "subscribed");
        id
    }

    /// Removes a subscriber. Returns `false` if `id` was not subscribed
    /// (already removed, or from another bus).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::trace!(event = self.name, %id, "unsubscribed");
        }
        removed
    }

    /// Calls every current subscriber with `args`, in subscription order.
    ///
    /// The subscriber list is snapshotted first and the lock released, so a
    /// subscriber may subscribe or unsubscribe (itself included) while
    /// being called. Such changes take effect from the next publish.
    pub fn publish(&self, args: &A) {
        let snapshot: Vec<Subscriber<A>> = self
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(args);
        }
    }

    /// Number of current subscribers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every subscriber.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Subscriber<A>)>> {
        // A panicking subscriber never runs under this lock, so a poisoned
        // list is still consistent.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: ?Sized> fmt::Debug for EventBus<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("subscribers", &count)
            .finish()
    }
}
