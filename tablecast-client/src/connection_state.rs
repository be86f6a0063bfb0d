//! Observable connection states
//!
//! # Connection Manager
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                          │                            │
//!      └───── handshake failed ───┘                            │
//!      └───── disconnect() (last reference) / session lost ────┘
//! ```
//!
//! # Reconnector
//!
//! ```text
//! Idle ──mount──▶ Connecting ──▶ Connected
//!                     │ ▲
//!                     ▼ │ retry after backoff
//!                   Failed
//! ```

use std::fmt;

/// State of the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A handshake is in flight
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Numeric value recorded on the state gauge
    pub(crate) fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Per-consumer view kept by a [`Reconnector`](crate::Reconnector)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectorState {
    /// Not mounted yet, unmounted, or manually disconnected
    Idle,
    Connecting,
    Connected,
    /// The last attempt failed; a retry may be scheduled
    Failed,
}
