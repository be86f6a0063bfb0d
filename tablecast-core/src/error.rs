//! Error types for tablecast
//!
//! A single [`Error`] enum covers every failure the client, transport and
//! broker can report. It is `Clone` because one failed handshake is handed
//! to every caller that joined the same in-flight connect attempt.
//!
//! # Error Categories
//!
//! - **Transport errors**: WebSocket, Io, Transport, ConnectionClosed
//! - **Protocol errors**: Handshake, Protocol
//! - **Usage errors**: NotConnected, Superseded, Config
//! - **Processing errors**: Serialization, Internal
//!
//! # Examples
//!
//! ```rust
//! use tablecast_core::Error;
//!
//! let error = Error::Handshake("broker refused CONNECT".into());
//! assert!(error.is_handshake());
//! assert_eq!(error.to_string(), "Handshake failed: broker refused CONNECT");
//! ```

use thiserror::Error;

/// Result type for tablecast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// WebSocket transport layer error
    ///
    /// Opening the socket failed, or a frame could not be written or read
    /// at the WebSocket level (below STOMP).
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The STOMP handshake did not complete
    ///
    /// The broker answered `CONNECT` with an `ERROR` frame, closed the socket
    /// before `CONNECTED`, or sent something other than `CONNECTED`.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Malformed STOMP frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation requires a confirmed connection
    #[error("Not connected")]
    NotConnected,

    /// The session ended
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connect attempt finished while no consumer held a reference, either
    /// because `disconnect()` released the last one or because none was ever
    /// taken; its session was closed instead of being adopted.
    #[error("Connect attempt superseded: no reference held")]
    Superseded,

    /// Error raised by a custom transport implementation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Low-level I/O error
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid client or broker configuration, such as an unparsable URL
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from a failed handshake or socket open
    ///
    /// These are the failures the reconnection loop retries.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_) | Error::WebSocket(_) | Error::Io(_) | Error::Transport(_)
        )
    }

    /// Short, stable label used for metrics attributes
    pub fn kind(&self) -> &'static str {
        match self {
            Error::WebSocket(_) => "websocket",
            Error::Handshake(_) => "handshake",
            Error::Protocol(_) => "protocol",
            Error::Serialization(_) => "serialization",
            Error::NotConnected => "not_connected",
            Error::ConnectionClosed => "connection_closed",
            Error::Superseded => "superseded",
            Error::Transport(_) => "transport",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
