//! Declarative topic subscriptions tied to a consumer's lifetime
//!
//! A [`SubscriptionSet`] is given a list of [`TopicHandler`]s. It mounts its
//! own [`Reconnector`], subscribes every listed topic whenever the connection
//! comes up, and unsubscribes everything it subscribed when the connection
//! goes down or the set is unmounted. No subscription it made outlives it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablecast_client::{
//!     ConnectionManager, ExponentialBackoff, SubscriptionSet, TopicHandler, ORDERS_TOPIC,
//!     TABLES_TOPIC,
//! };
//!
//! # async fn example(manager: ConnectionManager) {
//! let set = SubscriptionSet::mount(
//!     &manager,
//!     Arc::new(ExponentialBackoff::default()),
//!     vec![
//!         TopicHandler::new(TABLES_TOPIC, |msg| async move { println!("{}", msg.body) }),
//!         TopicHandler::new(ORDERS_TOPIC, |msg| async move { println!("{}", msg.body) }),
//!     ],
//! );
//! // ...
//! set.unmount();
//! # }
//! ```

use crate::backoff::ReconnectPolicy;
use crate::manager::ConnectionManager;
use crate::reconnector::Reconnector;
use crate::transport::{message_handler, MessageHandler};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tablecast_core::MessageEnvelope;
use tokio::task::JoinHandle;

/// A topic and the handler for its messages
#[derive(Clone)]
pub struct TopicHandler {
    /// Destination to subscribe
    pub topic: String,
    /// Called once per message on `topic`
    pub handler: MessageHandler,
}

impl TopicHandler {
    /// Pair `topic` with an async message handler
    ///
    /// # Examples
    ///
    /// ```
    /// use tablecast_client::{TopicHandler, TABLES_TOPIC};
    ///
    /// let entry = TopicHandler::new(TABLES_TOPIC, |msg| async move {
    ///     println!("table update: {}", msg.body);
    /// });
    /// assert_eq!(entry.topic, TABLES_TOPIC);
    /// ```
    pub fn new<F, Fut>(topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            topic: topic.into(),
            handler: message_handler(handler),
        }
    }
}

impl std::fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandler").field("topic", &self.topic).finish()
    }
}

struct Tracking {
    /// What the consumer asked for
    requested: Vec<TopicHandler>,
    /// Topics this set subscribed, in subscription order
    tracked: Vec<String>,
}

struct SetState {
    manager: ConnectionManager,
    tracking: Mutex<Tracking>,
}

impl SetState {
    /// Subscribe every requested topic not tracked yet
    fn subscribe_untracked(&self) {
        let mut tracking = self.tracking.lock();
        let Tracking { requested, tracked } = &mut *tracking;
        for entry in requested.iter() {
            if tracked.contains(&entry.topic) {
                continue;
            }
            self.manager.subscribe_with(&entry.topic, entry.handler.clone());
            tracked.push(entry.topic.clone());
        }
    }

    /// Unsubscribe every tracked topic and forget them
    fn teardown(&self) {
        let tracked = std::mem::take(&mut self.tracking.lock().tracked);
        for topic in &tracked {
            self.manager.unsubscribe(topic);
        }
        if !tracked.is_empty() {
            tracing::debug!(topics = tracked.len(), "Subscription set torn down");
        }
    }
}

/// Keeps a list of topics subscribed while connected
pub struct SubscriptionSet {
    reconnector: Reconnector,
    state: Arc<SetState>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionSet {
    /// Mount a reconnector on `manager` and start following its state
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mount(
        manager: &ConnectionManager,
        policy: Arc<dyn ReconnectPolicy>,
        topics: Vec<TopicHandler>,
    ) -> Self {
        let reconnector = Reconnector::mount(manager, policy);
        let state = Arc::new(SetState {
            manager: manager.clone(),
            tracking: Mutex::new(Tracking {
                requested: topics,
                tracked: Vec::new(),
            }),
        });

        let mut connected = reconnector.watch();
        let watched = state.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let is_connected = *connected.borrow_and_update();
                if is_connected {
                    watched.subscribe_untracked();
                } else {
                    watched.teardown();
                }
                if connected.changed().await.is_err() {
                    break;
                }
            }
        });

        Self {
            reconnector,
            state,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Whether this set currently sees the connection as up
    ///
    /// Follows the set's own [`Reconnector`]; tracked topics are subscribed
    /// shortly after this turns `true`.
    pub fn is_connected(&self) -> bool {
        self.reconnector.is_connected()
    }

    /// The reconnector this set mounted, for its state and retry count
    pub fn reconnector(&self) -> &Reconnector {
        &self.reconnector
    }

    /// Topics this set has subscribed, in subscription order
    pub fn tracked_topics(&self) -> Vec<String> {
        self.state.tracking.lock().tracked.clone()
    }

    /// Add a topic to the list, subscribing now if connected
    ///
    /// Returns `false` if the topic is already listed.
    pub fn add_subscription(&self, entry: TopicHandler) -> bool {
        {
            let mut tracking = self.state.tracking.lock();
            if tracking.requested.iter().any(|e| e.topic == entry.topic) {
                return false;
            }
            tracking.requested.push(entry);
        }
        if self.reconnector.is_connected() {
            self.state.subscribe_untracked();
        }
        true
    }

    /// Remove a topic from the list and unsubscribe it
    pub fn remove_subscription(&self, topic: &str) {
        let was_tracked = {
            let mut tracking = self.state.tracking.lock();
            tracking.requested.retain(|e| e.topic != topic);
            let before = tracking.tracked.len();
            tracking.tracked.retain(|t| t != topic);
            before != tracking.tracked.len()
        };
        if was_tracked {
            self.state.manager.unsubscribe(topic);
        }
    }

    /// Unsubscribe everything tracked; the list itself is kept
    pub fn clear_all(&self) {
        self.state.teardown();
    }

    /// Swap the whole list, as when a consumer's dependencies change
    pub fn replace_topics(&self, topics: Vec<TopicHandler>) {
        self.state.teardown();
        self.state.tracking.lock().requested = topics;
        if self.reconnector.is_connected() {
            self.state.subscribe_untracked();
        }
    }

    /// Stop watching, unsubscribe everything, then unmount the reconnector
    ///
    /// Idempotent. Dropping the set does the same.
    pub fn unmount(&self) {
        let Some(watcher) = self.watcher.lock().take() else {
            return;
        };
        watcher.abort();
        self.state.teardown();
        self.reconnector.unmount();
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.unmount();
    }
}
