use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use huddle_types::{ChangeEvent, FeedFilter};

use crate::backend::{Subscription, SubscriptionHandle};

/// Routes change events to open subscriptions.
///
/// Each subscription owns an unbounded queue; the dispatcher keeps the
/// sending half. Dropping the sender (unregister, close_all) is how a
/// subscriber learns its feed is gone.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// handle -> (filter, sender)
    subscribers: RwLock<HashMap<SubscriptionHandle, (FeedFilter, mpsc::UnboundedSender<ChangeEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber under a fresh handle.
    pub fn register(&self, filter: FeedFilter) -> Subscription {
        self.register_with(SubscriptionHandle::new(), filter)
    }

    /// Register a subscriber under a caller-chosen handle, replacing any
    /// subscriber that already used it.
    pub fn register_with(&self, handle: SubscriptionHandle, filter: FeedFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().insert(handle, (filter, tx));
        debug!("Registered subscriber {} for {:?}", handle, filter);
        Subscription {
            handle,
            filter,
            events: rx,
        }
    }

    /// Remove a subscriber. Returns false for unknown handles.
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.write().remove(&handle).is_some();
        if removed {
            debug!("Unregistered subscriber {}", handle);
        }
        removed
    }

    /// Deliver an event to every subscriber whose filter matches it.
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.read();
            for (handle, (filter, tx)) in subscribers.iter() {
                if !filter.matches(event) {
                    continue;
                }
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*handle);
                }
            }
        }
        self.prune(closed);
        trace!("Published {:?} event to {} subscribers", event.kind(), delivered);
        delivered
    }

    /// Send an event to one subscriber, bypassing its filter.
    pub fn send_to(&self, handle: SubscriptionHandle, event: ChangeEvent) -> bool {
        let sent = match self.read().get(&handle) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => return false,
        };
        if !sent {
            self.prune(vec![handle]);
        }
        sent
    }

    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.read().contains_key(&handle)
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Drop every subscriber. Their queues report closed once drained.
    pub fn close_all(&self) {
        let count = {
            let mut subscribers = self.write();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        if count > 0 {
            debug!("Closed {} subscribers", count);
        }
    }

    fn prune(&self, handles: Vec<SubscriptionHandle>) {
        if handles.is_empty() {
            return;
        }
        let mut subscribers = self.write();
        for handle in handles {
            // Receiver gone without an unsubscribe.
            subscribers.remove(&handle);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionHandle, (FeedFilter, mpsc::UnboundedSender<ChangeEvent>)>> {
        self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionHandle, (FeedFilter, mpsc::UnboundedSender<ChangeEvent>)>> {
        self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }
}
