//! Minimal STOMP-over-WebSocket broker
//!
//! A small stand-in for the café backend's message broker, used by the
//! client's integration tests and for local development. It speaks just
//! enough STOMP 1.2 for `tablecast-client`:
//!
//! - `CONNECT`/`STOMP` answered with `CONNECTED` (or `ERROR` while
//!   [`reject_connections`](BrokerBuilder::reject_connections) is armed)
//! - `SUBSCRIBE`/`UNSUBSCRIBE` tracked per connection and subscription id
//! - `SEND` to `/topic/...` fanned out as `MESSAGE` frames
//! - `SEND` to `/app/table.subscribe` relayed to `/topic/tables`
//! - `receipt` headers answered with `RECEIPT`
//!
//! There are no ACK modes, transactions or persistence.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tablecast_broker::Broker;
//! use tablecast_core::TableStatusEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::builder().bind_str("127.0.0.1:8080")?.build().await?;
//!     let handle = broker.handle();
//!
//!     tokio::spawn(async move {
//!         let _ = broker.run().await;
//!     });
//!
//!     let delivered = handle
//!         .broadcast_table_update(&TableStatusEvent::update("t-1", "OCCUPIED"))
//!         .await?;
//!     println!("delivered to {delivered} subscribers");
//!     Ok(())
//! }
//! ```

mod builder;
mod connection;
mod metrics;
mod subscription;

pub use builder::BrokerBuilder;
pub use connection::Connection;
pub use metrics::BrokerMetrics;
pub use subscription::{Subscriber, SubscriptionManager};

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tablecast_core::frame::{Frame, HeartBeat};
use tablecast_core::{
    Error, OrderEvent, Result, TableStatusEvent, ORDERS_TOPIC, TABLES_TOPIC,
    TABLE_RELAY_DESTINATION,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Open connections by id
pub type ConnectionRegistry = Arc<Mutex<HashMap<u64, Connection>>>;

/// State shared by the accept loop, connection tasks and handles
pub(crate) struct BrokerState {
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) connections: ConnectionRegistry,
    /// Advertised in every `CONNECTED` frame
    pub(crate) heart_beat: HeartBeat,
    pub(crate) rejections_left: AtomicUsize,
    pub(crate) next_message_id: AtomicU64,
    pub(crate) metrics: Option<Arc<BrokerMetrics>>,
}

impl BrokerState {
    /// Consume one armed rejection, if any
    pub(crate) fn take_rejection(&self) -> bool {
        self.rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Dispatch a client `SEND`
    pub(crate) async fn route(&self, destination: &str, body: &str) {
        if destination == TABLE_RELAY_DESTINATION {
            self.publish_text(TABLES_TOPIC, body).await;
        } else if destination.starts_with("/topic/") {
            self.publish_text(destination, body).await;
        } else {
            tracing::debug!(destination, "No route for destination; dropping");
        }
    }

    /// Queue a `MESSAGE` to every subscriber of `topic`
    ///
    /// Returns how many subscribers it was queued for.
    #[tracing::instrument(skip(self, body))]
    pub(crate) async fn publish_text(&self, topic: &str, body: &str) -> usize {
        let subscribers = self.subscriptions.get_subscribers(topic).await;
        let registry = self.connections.lock().await;

        let mut delivered = 0;
        for subscriber in subscribers {
            let Some(conn) = registry.get(&subscriber.connection_id) else {
                continue;
            };
            let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst).to_string();
            let frame = Frame::message(topic, &subscriber.subscription_id, &message_id, body);
            if conn.send_frame(&frame).is_ok() {
                delivered += 1;
            }
        }
        drop(registry);

        if let Some(metrics) = &self.metrics {
            metrics.record_publish(topic, delivered);
        }
        tracing::debug!(delivered, "Message published");
        delivered
    }

    pub(crate) async fn record_subscribers(&self, topic: &str) {
        if let Some(metrics) = &self.metrics {
            let count = self.subscriptions.subscriber_count(topic).await;
            metrics.update_subscribers(topic, count as i64);
        }
    }

    pub(crate) fn record_error(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(kind);
        }
    }
}

/// STOMP broker over WebSocket
///
/// Build with [`Broker::builder`], take a [`BrokerHandle`] for publishing,
/// then call [`run`](Broker::run) to start accepting connections.
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Address actually bound, useful after binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Io(e.to_string()))
    }

    /// Handle for publishing and introspection, usable after `run` is spawned
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            state: self.state.clone(),
        }
    }

    /// Accept connections until the listener fails
    #[tracing::instrument(skip(self), name = "broker.run")]
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting broker");
        let conn_counter = AtomicU64::new(0);

        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let conn_id = conn_counter.fetch_add(1, Ordering::SeqCst);
            let state = self.state.clone();

            tracing::info!(conn_id, addr = %addr, "New connection accepted");
            tokio::spawn(async move {
                if let Err(e) = connection::handle_connection(stream, conn_id, state.clone()).await {
                    tracing::warn!(conn_id, error = %e, "Connection error");
                    state.record_error(e.kind());
                }
            });
        }
    }
}

/// Publishes to and inspects a running [`Broker`]
#[derive(Clone)]
pub struct BrokerHandle {
    state: Arc<BrokerState>,
}

impl BrokerHandle {
    /// Serialize `payload` as JSON and publish it to `topic`
    ///
    /// Returns the number of subscribers it was delivered to.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<usize> {
        let body = serde_json::to_string(payload)?;
        Ok(self.state.publish_text(topic, &body).await)
    }

    /// Publish a table status change to `/topic/tables`
    pub async fn broadcast_table_update(&self, event: &TableStatusEvent) -> Result<usize> {
        self.publish(TABLES_TOPIC, event).await
    }

    /// Publish an order change to `/topic/orders`
    pub async fn broadcast_order_update(&self, event: &OrderEvent) -> Result<usize> {
        self.publish(ORDERS_TOPIC, event).await
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.state.subscriptions.subscriber_count(topic).await
    }

    /// Topics with at least one subscriber, sorted
    pub async fn topics(&self) -> Vec<String> {
        self.state.subscriptions.topics().await
    }

    /// Close every open connection, as a broker restart would
    ///
    /// Returns how many connections were told to close.
    pub async fn disconnect_all(&self) -> usize {
        let registry = self.state.connections.lock().await;
        registry.values().filter(|conn| conn.close().is_ok()).count()
    }
}
