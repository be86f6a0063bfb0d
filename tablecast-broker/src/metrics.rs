//! Broker metrics
//!
//! OpenTelemetry instruments under `tablecast.broker.*`, recorded when the
//! broker is built with [`BrokerBuilder::with_metrics`](crate::BrokerBuilder::with_metrics).
//!
//! # Metrics Collected
//!
//! - **connections.active**: open STOMP connections (gauge)
//! - **connections.total**: connections accepted since startup (counter)
//! - **handshakes.rejected**: handshakes answered with `ERROR` (counter)
//! - **subscribers**: subscribers per topic (gauge)
//! - **messages.published**: messages published, by topic (counter)
//! - **deliveries**: `MESSAGE` frames queued to subscribers (counter)
//! - **errors.total**: errors by kind (counter)

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

pub struct BrokerMetrics {
    pub connections_active: Gauge<i64>,
    pub connections_total: Counter<u64>,
    pub handshakes_rejected: Counter<u64>,
    pub subscribers: Gauge<i64>,
    pub messages_published: Counter<u64>,
    pub deliveries: Counter<u64>,
    pub errors_total: Counter<u64>,
}

impl BrokerMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connections_active: meter
                .i64_gauge("tablecast.broker.connections.active")
                .with_description("Number of open STOMP connections")
                .build(),
            connections_total: meter
                .u64_counter("tablecast.broker.connections.total")
                .with_description("Total number of connections accepted")
                .build(),
            handshakes_rejected: meter
                .u64_counter("tablecast.broker.handshakes.rejected")
                .with_description("Handshakes answered with an ERROR frame")
                .build(),
            subscribers: meter
                .i64_gauge("tablecast.broker.subscribers")
                .with_description("Subscribers per topic")
                .build(),
            messages_published: meter
                .u64_counter("tablecast.broker.messages.published")
                .with_description("Messages published to topics")
                .build(),
            deliveries: meter
                .u64_counter("tablecast.broker.deliveries")
                .with_description("MESSAGE frames queued to subscribers")
                .build(),
            errors_total: meter
                .u64_counter("tablecast.broker.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_connection(&self, active: i64) {
        self.connections_active.record(active, &[]);
        self.connections_total.add(1, &[]);
    }

    pub fn record_disconnection(&self, active: i64) {
        self.connections_active.record(active, &[]);
    }

    pub fn record_rejected_handshake(&self) {
        self.handshakes_rejected.add(1, &[]);
    }

    pub fn update_subscribers(&self, topic: &str, count: i64) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.subscribers.record(count, attributes);
    }

    /// One publish reaching `delivered` subscribers
    pub fn record_publish(&self, topic: &str, delivered: usize) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.messages_published.add(1, attributes);
        self.deliveries.add(delivered as u64, attributes);
    }

    pub fn record_error(&self, kind: &str) {
        let attributes = &[KeyValue::new("error_type", kind.to_string())];
        self.errors_total.add(1, attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = BrokerMetrics::new("test-broker");

        metrics.record_connection(1);
        metrics.record_rejected_handshake();
        metrics.update_subscribers("/topic/tables", 2);
        metrics.record_publish("/topic/tables", 2);
        metrics.record_error("protocol");
        metrics.record_disconnection(0);
    }
}
