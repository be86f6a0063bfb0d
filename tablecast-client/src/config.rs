//! Connection settings
//!
//! [`ClientConfig`] describes where the broker lives and how the STOMP
//! handshake is performed. The defaults match the café backend: the broker
//! endpoint at `ws://localhost:8080/ws` and 4 second heart-beats in both
//! directions.
//!
//! The URL can be overridden with the `TABLECAST_WS_URL` environment
//! variable. `http`/`https` URLs are accepted and mapped to `ws`/`wss`.

use std::time::Duration;
use tablecast_core::{Error, HeartBeat, Result};
use url::Url;

/// Endpoint used when nothing else is configured
pub const DEFAULT_URL: &str = "ws://localhost:8080/ws";

/// Environment variable overriding [`DEFAULT_URL`]
pub const URL_ENV: &str = "TABLECAST_WS_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: String,
    /// Virtual host sent in `CONNECT`; defaults to the URL host
    pub host: Option<String>,
    /// Extra `CONNECT` headers, such as credentials
    pub connect_headers: Vec<(String, String)>,
    /// Interval at which we promise to send heart-beats (zero disables)
    pub heartbeat_outgoing: Duration,
    /// Interval at which we want to receive heart-beats (zero disables)
    pub heartbeat_incoming: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let url = std::env::var(URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string());
        Self::new(url)
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host: None,
            connect_headers: Vec::new(),
            heartbeat_outgoing: Duration::from_millis(4000),
            heartbeat_incoming: Duration::from_millis(4000),
        }
    }

    /// Parse and normalize the URL to a WebSocket URL
    pub fn endpoint(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).map_err(|e| Error::Config(format!("invalid URL {}: {e}", self.url)))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::Config(format!(
                    "unsupported URL scheme '{other}', expected ws or wss"
                )))
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(Error::Config(format!("cannot use scheme {scheme} for {}", self.url)));
        }
        if url.host_str().is_none() {
            return Err(Error::Config(format!("URL has no host: {}", self.url)));
        }
        Ok(url)
    }

    /// Value of the `host` header
    pub fn virtual_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Our side of the heart-beat negotiation
    pub fn heart_beat(&self) -> HeartBeat {
        HeartBeat::new(
            self.heartbeat_outgoing.as_millis() as u64,
            self.heartbeat_incoming.as_millis() as u64,
        )
    }
}
