//! Shared building blocks for tablecast
//!
//! This crate holds everything both ends of the connection agree on:
//!
//! - **Frames**: the STOMP 1.2 frame model and its text codec ([`frame`])
//! - **Messages**: the envelope handed to subscription handlers ([`message`])
//! - **Events**: table and order payloads and their topics ([`events`])
//! - **Errors**: the error type shared by client and broker ([`error`])
//! - **Telemetry**: tracing and OpenTelemetry bootstrap ([`observability`])
//!
//! The codec does not care how frames travel. `tablecast-client` and
//! `tablecast-broker` carry them as WebSocket text messages.
//!
//! # Example
//!
//! ```rust
//! use tablecast_core::{frame, Frame, MessageEnvelope, TableStatusEvent, TABLES_TOPIC};
//!
//! let body = serde_json::to_string(&TableStatusEvent::update("t-4", "OCCUPIED")).unwrap();
//! let wire = frame::encode(&Frame::message(TABLES_TOPIC, "sub-0", "1", &body));
//!
//! let frame::Decoded::Frame(decoded) = frame::decode(&wire).unwrap() else {
//!     panic!("expected a frame");
//! };
//! let envelope = MessageEnvelope::from_frame(decoded).unwrap();
//! let event: TableStatusEvent = envelope.json().unwrap();
//! assert_eq!(event.status, "OCCUPIED");
//! ```

pub mod error;
pub mod events;
pub mod frame;
pub mod message;
pub mod observability;

pub use error::{Error, Result};
pub use events::{
    OrderAction, OrderEvent, TableStatusEvent, ORDERS_TOPIC, TABLES_TOPIC,
    TABLE_RELAY_DESTINATION,
};
pub use frame::{Command, Frame, HeartBeat};
pub use message::MessageEnvelope;
pub use observability::{init_telemetry, shutdown_telemetry, TelemetryConfig};
