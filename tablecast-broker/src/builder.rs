//! Broker builder
//!
//! ```rust,no_run
//! use tablecast_broker::Broker;
//! use std::time::Duration;
//!
//! # async fn example() -> tablecast_core::Result<()> {
//! let broker = Broker::builder()
//!     .bind_str("127.0.0.1:8080")?
//!     .heartbeat(Duration::from_secs(10), Duration::ZERO)
//!     .with_metrics()
//!     .build()
//!     .await?;
//! broker.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::BrokerMetrics;
use crate::subscription::SubscriptionManager;
use crate::{Broker, BrokerState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;
use tablecast_core::frame::HeartBeat;
use tablecast_core::{Error, Result, TelemetryConfig};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Builder for a [`Broker`]
pub struct BrokerBuilder {
    addr: Option<SocketAddr>,
    heart_beat: HeartBeat,
    reject_connections: usize,
    telemetry: Option<TelemetryConfig>,
    enable_metrics: bool,
    service_name: Option<String>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            addr: None,
            heart_beat: HeartBeat::default(),
            reject_connections: 0,
            telemetry: None,
            enable_metrics: false,
            service_name: None,
        }
    }

    /// Set the bind address; port 0 picks a free port
    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Set the bind address from a string (e.g., "127.0.0.1:8080")
    pub fn bind_str(mut self, addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;
        self.addr = Some(addr);
        Ok(self)
    }

    /// Heart-beat intervals advertised in `CONNECTED` (default none)
    pub fn heartbeat(mut self, outgoing: Duration, incoming: Duration) -> Self {
        self.heart_beat = HeartBeat::new(outgoing.as_millis() as u64, incoming.as_millis() as u64);
        self
    }

    /// Answer the first `n` handshakes with `ERROR`
    pub fn reject_connections(mut self, n: usize) -> Self {
        self.reject_connections = n;
        self
    }

    /// Initialize tracing and OpenTelemetry export when building
    pub fn with_telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = Some(config);
        self
    }

    /// Record [`BrokerMetrics`] on the global meter provider
    pub fn with_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Bind the listener; connections are accepted once [`Broker::run`] is called
    pub async fn build(self) -> Result<Broker> {
        let addr = self
            .addr
            .ok_or_else(|| Error::Config("No bind address specified".to_string()))?;

        let service_name = self
            .service_name
            .or_else(|| self.telemetry.as_ref().map(|t| t.service_name.clone()))
            .unwrap_or_else(|| "tablecast-broker".to_string());

        if let Some(mut config) = self.telemetry {
            config.service_name = service_name.clone();
            tablecast_core::init_telemetry(config)
                .map_err(|e| Error::Internal(format!("Failed to initialize telemetry: {}", e)))?;
        }
        let metrics = self
            .enable_metrics
            .then(|| Arc::new(BrokerMetrics::new(service_name)));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        tracing::info!(addr = %addr, "Broker listening");

        Ok(Broker {
            listener,
            state: Arc::new(BrokerState {
                subscriptions: SubscriptionManager::new(),
                connections: Arc::new(Mutex::new(HashMap::new())),
                heart_beat: self.heart_beat,
                rejections_left: AtomicUsize::new(self.reject_connections),
                next_message_id: AtomicU64::new(0),
                metrics,
            }),
        })
    }
}
