//! Subscription bookkeeping
//!
//! The registry owns two collections:
//!
//! - a FIFO queue of subscribe requests made while no session was available
//! - a map from topic to the live [`SubscriptionHandle`] on the current
//!   session, at most one per topic
//!
//! It performs no I/O. The [`ConnectionManager`](crate::ConnectionManager)
//! decides when handles are released and what happens to a displaced one.

use crate::transport::{MessageHandler, SubscriptionHandle};
use std::collections::{BTreeMap, VecDeque};

/// A subscribe request waiting for a connection
#[derive(Clone)]
pub struct PendingSubscription {
    /// Destination to subscribe, e.g. `/topic/tables`
    pub topic: String,
    pub handler: MessageHandler,
}

/// A live subscription, kept together with its handler so it can be
/// re-queued if the session is lost
pub struct ActiveSubscription {
    pub handle: Box<dyn SubscriptionHandle>,
    pub handler: MessageHandler,
}

/// Queued requests plus live subscriptions, keyed by topic
///
/// # Examples
///
/// ```
/// use tablecast_client::{message_handler, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::new();
/// registry.enqueue("/topic/tables", message_handler(|_| async {}));
/// registry.enqueue("/topic/orders", message_handler(|_| async {}));
/// assert_eq!(registry.pending_topics(), vec!["/topic/tables", "/topic/orders"]);
///
/// let drained = registry.drain_pending();
/// assert_eq!(drained[0].topic, "/topic/tables");
/// assert_eq!(registry.pending_len(), 0);
/// assert!(!registry.is_active("/topic/tables"));
/// ```
#[derive(Default)]
pub struct SubscriptionRegistry {
    pending: VecDeque<PendingSubscription>,
    active: BTreeMap<String, ActiveSubscription>,
}

impl SubscriptionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request for the next successful connect
    pub fn enqueue(&mut self, topic: impl Into<String>, handler: MessageHandler) {
        self.pending.push_back(PendingSubscription {
            topic: topic.into(),
            handler,
        });
    }

    /// Take every queued request, oldest first
    ///
    /// The queue is empty afterwards. Requests that could not be made live
    /// go back with [`requeue_front`](Self::requeue_front).
    pub fn drain_pending(&mut self) -> Vec<PendingSubscription> {
        self.pending.drain(..).collect()
    }

    /// Put requests back at the front of the queue, keeping their order
    pub fn requeue_front(&mut self, requests: Vec<PendingSubscription>) {
        for request in requests.into_iter().rev() {
            self.pending.push_front(request);
        }
    }

    /// Drop queued requests for `topic`, returning how many were removed
    pub fn cancel_pending(&mut self, topic: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|request| request.topic != topic);
        before - self.pending.len()
    }

    /// Record a live subscription, returning the one it replaced
    pub fn insert_active(
        &mut self,
        topic: impl Into<String>,
        subscription: ActiveSubscription,
    ) -> Option<ActiveSubscription> {
        self.active.insert(topic.into(), subscription)
    }

    /// Forget the live subscription for `topic` and hand it back
    ///
    /// The handle is not released here; the caller unsubscribes it. Queued
    /// requests for the topic are untouched.
    pub fn remove(&mut self, topic: &str) -> Option<ActiveSubscription> {
        self.active.remove(topic)
    }

    /// Remove every live subscription, in topic order
    pub fn clear_active(&mut self) -> Vec<(String, ActiveSubscription)> {
        std::mem::take(&mut self.active).into_iter().collect()
    }

    /// Move every live subscription back to the front of the queue
    ///
    /// Used when the session dies: the handles are dead, the handlers are
    /// not. Returns how many were moved.
    pub fn restore_active(&mut self) -> usize {
        let restored: Vec<PendingSubscription> = self
            .clear_active()
            .into_iter()
            .map(|(topic, active)| PendingSubscription {
                topic,
                handler: active.handler,
            })
            .collect();
        let count = restored.len();
        self.requeue_front(restored);
        count
    }

    /// Whether `topic` has a live subscription
    pub fn is_active(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    /// Active topics, sorted
    pub fn topics(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Queued topics, oldest first
    pub fn pending_topics(&self) -> Vec<String> {
        self.pending.iter().map(|request| request.topic.clone()).collect()
    }

    /// Number of queued requests, duplicates included
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of live subscriptions
    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}
