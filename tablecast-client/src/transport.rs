//! Transport seam between the connection manager and the wire
//!
//! [`ConnectionManager`](crate::ConnectionManager) never touches a socket
//! directly. It asks a [`Transport`] for a [`Session`], a live, handshaken
//! connection, and talks to that. The production implementation is
//! [`StompTransport`](crate::StompTransport); tests plug in a recording mock.
//!
//! `Session` methods other than [`Session::closed`] are synchronous and must
//! not block: implementations queue outgoing frames and return.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tablecast_core::{MessageEnvelope, Result};

/// Async callback invoked for every message on a subscribed destination
pub type MessageHandler = Arc<dyn Fn(MessageEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
///
/// ```rust
/// use tablecast_client::message_handler;
///
/// let handler = message_handler(|msg| async move {
///     println!("{} -> {}", msg.destination, msg.body);
/// });
/// # let _ = handler;
/// ```
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(handler(msg)))
}

/// Opens sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the socket and complete the protocol handshake
    async fn open(&self) -> Result<Arc<dyn Session>>;
}

/// One open, handshaken connection
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the session is still usable
    fn is_connected(&self) -> bool;

    /// Start delivering messages for `destination` to `handler`
    fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn SubscriptionHandle>>;

    /// Send a text body to `destination`
    fn send(&self, destination: &str, body: String) -> Result<()>;

    /// Start a graceful close
    fn close(&self) -> Result<()>;

    /// Resolves once the session has ended, whoever ended it
    async fn closed(&self);
}

/// A live subscription on a session
pub trait SubscriptionHandle: Send + Sync {
    fn id(&self) -> &str;

    fn destination(&self) -> &str;

    /// Stop delivery; the handle is spent afterwards
    fn unsubscribe(&self) -> Result<()>;
}
