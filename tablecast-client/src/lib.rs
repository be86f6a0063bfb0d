//! Shared STOMP-over-WebSocket connection for many consumers
//!
//! This crate lets any number of independent consumers share one persistent
//! connection to the café backend and receive table and order updates.
//!
//! # Core Features
//!
//! - **Reference counting**: the connection closes when the last consumer leaves
//! - **Single in-flight handshake**: concurrent connects join one attempt
//! - **Subscription queueing**: subscribe before connecting; requests are made
//!   live in order as soon as the handshake succeeds
//! - **Bounded reconnect**: [`Reconnector`] retries with exponential backoff
//! - **Declarative topics**: [`SubscriptionSet`] keeps a topic list subscribed
//!   while connected and cleans up after itself
//! - **Observability**: `tracing` everywhere, optional OpenTelemetry metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tablecast_client::{ClientBuilder, TopicHandler, TableStatusEvent, TABLES_TOPIC};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ClientBuilder::new().url("ws://localhost:8080/ws").build()?;
//!
//!     // A consumer that lives as long as `tables`
//!     let tables = manager.subscription_set(vec![TopicHandler::new(
//!         TABLES_TOPIC,
//!         |msg| async move {
//!             if let Ok(event) = msg.json::<TableStatusEvent>() {
//!                 println!("table {} is now {}", event.table_id, event.status);
//!             }
//!         },
//!     )]);
//!
//!     tokio::signal::ctrl_c().await?;
//!     tables.unmount();
//!     Ok(())
//! }
//! ```
//!
//! # Custom Transports
//!
//! Everything above the wire goes through the [`Transport`] and [`Session`]
//! traits. Pass your own implementation with [`ClientBuilder::transport`] or
//! [`ConnectionManager::new`], for example to test consumers without a broker.

mod backoff;
mod builder;
mod config;
mod connection_state;
mod listeners;
mod manager;
mod metrics;
mod reconnector;
mod registry;
mod stomp;
mod subscription_set;
mod transport;

pub use backoff::{ExponentialBackoff, FixedDelay, NoReconnect, ReconnectPolicy};
pub use builder::ClientBuilder;
pub use config::{ClientConfig, DEFAULT_URL, URL_ENV};
pub use connection_state::{ConnectionState, ReconnectorState};
pub use listeners::{ListenerHandle, ListenerSet};
pub use manager::{ConnectionManager, SubscriptionInfo};
pub use metrics::ClientMetrics;
pub use reconnector::Reconnector;
pub use registry::{ActiveSubscription, PendingSubscription, SubscriptionRegistry};
pub use stomp::{StompSession, StompTransport};
pub use subscription_set::{SubscriptionSet, TopicHandler};
pub use transport::{message_handler, MessageHandler, Session, SubscriptionHandle, Transport};

pub use tablecast_core::{
    Error, MessageEnvelope, OrderAction, OrderEvent, Result, TableStatusEvent, ORDERS_TOPIC,
    TABLES_TOPIC, TABLE_RELAY_DESTINATION,
};
