//! Subscription tracking for topic fan-out
//!
//! STOMP subscriptions are identified by the pair (connection, subscription
//! id) since every client numbers its own subscriptions. The manager keeps
//! two maps in sync:
//! - `topic -> set of subscribers`: who receives a published message
//! - `connection -> (subscription id -> topic)`: what to drop on UNSUBSCRIBE
//!   or when the connection closes
//!
//! # Examples
//!
//! ```rust
//! use tablecast_broker::SubscriptionManager;
//!
//! # async fn example() {
//! let manager = SubscriptionManager::new();
//! manager.subscribe(1, "sub-0", "/topic/tables").await;
//! manager.subscribe(2, "sub-0", "/topic/tables").await;
//! assert_eq!(manager.subscriber_count("/topic/tables").await, 2);
//!
//! manager.remove_connection(1).await;
//! assert_eq!(manager.subscriber_count("/topic/tables").await, 1);
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One client subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub connection_id: u64,
    /// The `id` header the client chose in `SUBSCRIBE`
    pub subscription_id: String,
}

/// Tracks which connections listen on which topics
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    topic_subscribers: Arc<Mutex<HashMap<String, HashSet<Subscriber>>>>,
    connection_subscriptions: Arc<Mutex<HashMap<u64, HashMap<String, String>>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription_id` on `connection_id` for `topic`
    ///
    /// Reusing a subscription id moves it to the new topic. Returns `false`
    /// if the exact same subscription already existed.
    pub async fn subscribe(
        &self,
        connection_id: u64,
        subscription_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> bool {
        let subscription_id = subscription_id.into();
        let topic = topic.into();

        let previous = self
            .connection_subscriptions
            .lock()
            .await
            .entry(connection_id)
            .or_default()
            .insert(subscription_id.clone(), topic.clone());

        let subscriber = Subscriber {
            connection_id,
            subscription_id,
        };
        let mut topic_subs = self.topic_subscribers.lock().await;
        if let Some(old_topic) = previous.as_ref().filter(|old| **old != topic) {
            remove_from(&mut topic_subs, old_topic, &subscriber);
        }
        topic_subs.entry(topic).or_default().insert(subscriber)
    }

    /// Drop one subscription; returns the topic it was on
    pub async fn unsubscribe(&self, connection_id: u64, subscription_id: &str) -> Option<String> {
        let topic = {
            let mut conn_subs = self.connection_subscriptions.lock().await;
            let subs = conn_subs.get_mut(&connection_id)?;
            let topic = subs.remove(subscription_id);
            if subs.is_empty() {
                conn_subs.remove(&connection_id);
            }
            topic?
        };

        let subscriber = Subscriber {
            connection_id,
            subscription_id: subscription_id.to_string(),
        };
        remove_from(&mut *self.topic_subscribers.lock().await, &topic, &subscriber);
        Some(topic)
    }

    /// Everyone subscribed to `topic`
    pub async fn get_subscribers(&self, topic: &str) -> Vec<Subscriber> {
        self.topic_subscribers
            .lock()
            .await
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topic_subscribers
            .lock()
            .await
            .get(topic)
            .map_or(0, HashSet::len)
    }

    /// Topics with at least one subscriber, sorted
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topic_subscribers.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Forget every subscription of a closed connection
    ///
    /// Returns how many subscriptions were removed.
    pub async fn remove_connection(&self, connection_id: u64) -> usize {
        let Some(subs) = self.connection_subscriptions.lock().await.remove(&connection_id) else {
            return 0;
        };

        let mut topic_subs = self.topic_subscribers.lock().await;
        for (subscription_id, topic) in &subs {
            let subscriber = Subscriber {
                connection_id,
                subscription_id: subscription_id.clone(),
            };
            remove_from(&mut topic_subs, topic, &subscriber);
        }
        subs.len()
    }
}

fn remove_from(
    topic_subs: &mut HashMap<String, HashSet<Subscriber>>,
    topic: &str,
    subscriber: &Subscriber,
) {
    if let Some(subs) = topic_subs.get_mut(topic) {
        subs.remove(subscriber);
        if subs.is_empty() {
            topic_subs.remove(topic);
        }
    }
}
