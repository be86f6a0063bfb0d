//! Client metrics
//!
//! OpenTelemetry instruments recorded by the connection manager when metrics
//! are enabled through [`ClientBuilder::with_metrics`](crate::ClientBuilder::with_metrics).
//! Values go to whatever meter provider is installed globally, normally the
//! one set up by `tablecast_core::init_telemetry`.
//!
//! # Metrics Collected
//!
//! - **connection.state**: 0 disconnected, 1 connecting, 2 connected (gauge)
//! - **connect.attempts**: handshakes started (counter)
//! - **handshake.failures**: handshakes that failed (counter)
//! - **references**: current reference count (gauge)
//! - **messages.received**: messages delivered to handlers, by destination
//! - **sends.dropped**: sends discarded while disconnected
//! - **subscriptions.drained**: queued subscriptions made live on connect
//! - **errors.total**: errors by kind

use crate::connection_state::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

pub struct ClientMetrics {
    pub connection_state: Gauge<i64>,
    pub connect_attempts: Counter<u64>,
    pub handshake_failures: Counter<u64>,
    pub references: Gauge<i64>,
    pub messages_received: Counter<u64>,
    pub sends_dropped: Counter<u64>,
    pub subscriptions_drained: Counter<u64>,
    pub errors_total: Counter<u64>,
}

impl ClientMetrics {
    /// Instruments on the global meter named `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("tablecast.client.connection.state")
                .with_description("Connection state (0=disconnected, 1=connecting, 2=connected)")
                .build(),
            connect_attempts: meter
                .u64_counter("tablecast.client.connect.attempts")
                .with_description("Handshakes started")
                .build(),
            handshake_failures: meter
                .u64_counter("tablecast.client.handshake.failures")
                .with_description("Handshakes that failed")
                .build(),
            references: meter
                .i64_gauge("tablecast.client.references")
                .with_description("Consumers holding the shared connection open")
                .build(),
            messages_received: meter
                .u64_counter("tablecast.client.messages.received")
                .with_description("Messages delivered to subscription handlers")
                .build(),
            sends_dropped: meter
                .u64_counter("tablecast.client.sends.dropped")
                .with_description("Sends discarded because no session was connected")
                .build(),
            subscriptions_drained: meter
                .u64_counter("tablecast.client.subscriptions.drained")
                .with_description("Queued subscriptions activated on connect")
                .build(),
            errors_total: meter
                .u64_counter("tablecast.client.errors.total")
                .with_description("Errors encountered, by kind")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: ConnectionState) {
        self.connection_state.record(state.as_gauge(), &[]);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.add(1, &[]);
    }

    pub fn record_handshake_failure(&self, kind: &'static str) {
        self.handshake_failures.add(1, &[KeyValue::new("error_type", kind)]);
    }

    pub fn update_references(&self, count: usize) {
        self.references.record(count as i64, &[]);
    }

    pub fn record_message(&self, destination: &str) {
        let attributes = &[KeyValue::new("destination", destination.to_string())];
        self.messages_received.add(1, attributes);
    }

    pub fn record_send_dropped(&self, destination: &str) {
        let attributes = &[KeyValue::new("destination", destination.to_string())];
        self.sends_dropped.add(1, attributes);
    }

    pub fn record_drained(&self, count: usize) {
        self.subscriptions_drained.add(count as u64, &[]);
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors_total.add(1, &[KeyValue::new("error_type", kind)]);
    }
}
