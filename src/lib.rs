//! Tablecast - shared STOMP-over-WebSocket connection for café updates
//!
//! This is the convenience crate that re-exports the tablecast sub-crates.
//! Depend on it if you want the client and the development broker behind a
//! single dependency.
//!
//! # Architecture
//!
//! - **tablecast-core**: STOMP frame codec, message envelope, event payloads,
//!   errors, observability
//! - **tablecast-client**: reference-counted connection manager, subscription
//!   registry, reconnector and subscription sets
//! - **tablecast-broker**: minimal STOMP broker for local development and tests
//!
//! # Quick Start - Broker
//!
//! ```rust,no_run
//! use tablecast::Broker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::builder().bind_str("127.0.0.1:8080")?.build().await?;
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Quick Start - Client
//!
//! ```rust,no_run
//! use tablecast::{ClientBuilder, TableStatusEvent, TABLES_TOPIC};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ClientBuilder::new().url("ws://127.0.0.1:8080/ws").build()?;
//!     let reconnector = manager.reconnector();
//!
//!     reconnector.subscribe(TABLES_TOPIC, |msg| async move {
//!         if let Ok(event) = msg.json::<TableStatusEvent>() {
//!             println!("table {} -> {}", event.table_id, event.status);
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     reconnector.unmount();
//!     Ok(())
//! }
//! ```

pub use tablecast_broker as broker;
pub use tablecast_client as client;
pub use tablecast_core as core;

pub use tablecast_broker::{Broker, BrokerHandle};
pub use tablecast_client::{
    ClientBuilder, ConnectionManager, Reconnector, SubscriptionSet, TopicHandler,
};
pub use tablecast_core::{
    Error, MessageEnvelope, OrderEvent, Result, TableStatusEvent, ORDERS_TOPIC, TABLES_TOPIC,
};
