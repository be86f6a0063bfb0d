//! Fluent construction of a [`ConnectionManager`]
//!
//! The builder collects the endpoint, the handshake options, the backoff
//! policy shared by every reconnector, and optional telemetry and metrics.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tablecast_client::{ClientBuilder, ExponentialBackoff};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> tablecast_core::Result<()> {
//! // Build now, connect later
//! let manager = ClientBuilder::new()
//!     .url("ws://localhost:8080/ws")
//!     .heartbeat(Duration::from_secs(4), Duration::from_secs(4))
//!     .reconnect_policy(Arc::new(ExponentialBackoff::default().with_jitter()))
//!     .build()?;
//!
//! // Or build and take the first reference in one go
//! let connected = ClientBuilder::new().with_metrics().connect().await?;
//! # let _ = (manager, connected);
//! # Ok(())
//! # }
//! ```

use crate::backoff::{ExponentialBackoff, NoReconnect, ReconnectPolicy};
use crate::config::ClientConfig;
use crate::manager::ConnectionManager;
use crate::metrics::ClientMetrics;
use crate::stomp::StompTransport;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tablecast_core::{Error, Result, TelemetryConfig};

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    policy: Arc<dyn ReconnectPolicy>,
    telemetry: Option<TelemetryConfig>,
    enable_metrics: bool,
    service_name: Option<String>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Start from [`ClientConfig::default`]
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            policy: Arc::new(ExponentialBackoff::default()),
            telemetry: None,
            enable_metrics: false,
            service_name: None,
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Virtual host for the `CONNECT` frame
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// Extra `CONNECT` header
    pub fn connect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.connect_headers.push((name.into(), value.into()));
        self
    }

    pub fn heartbeat(mut self, outgoing: Duration, incoming: Duration) -> Self {
        self.config.heartbeat_outgoing = outgoing;
        self.config.heartbeat_incoming = incoming;
        self
    }

    /// Replace the whole connection config
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of STOMP over WebSocket
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Reconnectors give up after the first failure
    pub fn without_reconnect(mut self) -> Self {
        self.policy = Arc::new(NoReconnect);
        self
    }

    /// Initialize tracing and OpenTelemetry export when building
    pub fn with_telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = Some(config);
        self
    }

    /// Record [`ClientMetrics`] on the global meter provider
    pub fn with_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    /// Service name for telemetry and the metrics meter
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Create the manager without connecting
    pub fn build(self) -> Result<ConnectionManager> {
        let service_name = self
            .service_name
            .clone()
            .or_else(|| self.telemetry.as_ref().map(|t| t.service_name.clone()))
            .unwrap_or_else(|| "tablecast-client".to_string());

        if let Some(mut telemetry) = self.telemetry {
            telemetry.service_name = service_name.clone();
            tablecast_core::init_telemetry(telemetry)
                .map_err(|e| Error::Internal(format!("Failed to initialize telemetry: {e}")))?;
        }

        let metrics = self
            .enable_metrics
            .then(|| Arc::new(ClientMetrics::new(service_name)));

        let (transport, endpoint): (Arc<dyn Transport>, String) = match self.transport {
            Some(transport) => (transport, self.config.url.clone()),
            None => {
                let stomp = StompTransport::new(self.config)?;
                let endpoint = stomp.endpoint().to_string();
                (Arc::new(stomp), endpoint)
            }
        };

        Ok(ConnectionManager::with_parts(
            transport,
            endpoint,
            self.policy,
            metrics,
        ))
    }

    /// Create the manager and take its first reference
    pub async fn connect(self) -> Result<ConnectionManager> {
        let manager = self.build()?;
        manager.connect().await?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_state::ConnectionState;

    #[test]
    fn test_builder_settings() {
        let builder = ClientBuilder::new()
            .url("ws://cafe.example/ws")
            .host("cafe")
            .connect_header("login", "guest")
            .heartbeat(Duration::from_secs(10), Duration::ZERO)
            .without_reconnect()
            .service_name("kiosk");

        assert_eq!(builder.config.url, "ws://cafe.example/ws");
        assert_eq!(builder.config.host.as_deref(), Some("cafe"));
        assert_eq!(builder.config.connect_headers.len(), 1);
        assert_eq!(builder.config.heartbeat_incoming, Duration::ZERO);
        assert_eq!(builder.policy.delay_for(0), None);
        assert_eq!(builder.service_name.as_deref(), Some("kiosk"));
    }

    #[test]
    fn test_build_does_not_connect() {
        let manager = ClientBuilder::new()
            .url("ws://127.0.0.1:9/ws")
            .with_metrics()
            .build()
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reference_count(), 0);
        assert_eq!(manager.reconnect_policy().max_attempts(), Some(5));
    }

    #[test]
    fn test_build_rejects_invalid_url() {
        let result = ClientBuilder::new().url("gopher://cafe").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
