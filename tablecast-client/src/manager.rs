//! The shared, reference-counted connection
//!
//! One [`ConnectionManager`] owns the single connection that every consumer
//! in the process shares. Consumers call [`connect`](ConnectionManager::connect)
//! and [`disconnect`](ConnectionManager::disconnect) symmetrically; the
//! connection is torn down only when the last reference is released.
//!
//! # Lifecycle
//!
//! - `connect()` takes a reference and starts a handshake if none is running.
//!   Callers that arrive while a handshake is in flight join it, so only one
//!   session is ever opened per attempt.
//! - On success the connect listeners run, then queued subscriptions are made
//!   live in request order, then every waiting `connect()` resolves. The
//!   state stays `Connecting` until the queue is drained.
//! - A handshake that completes while no reference is held is closed again;
//!   its callers get [`Error::Superseded`]. The queue is kept.
//! - On failure every waiting caller gets the same error. Nothing is retried
//!   here; retrying belongs to [`Reconnector`](crate::Reconnector).
//! - When the session ends on its own, live subscriptions go back into the
//!   queue and the disconnect listeners run. The reference count is kept.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tablecast_client::{ClientBuilder, TABLES_TOPIC};
//!
//! # async fn example() -> tablecast_core::Result<()> {
//! let manager = ClientBuilder::new().url("ws://localhost:8080/ws").build()?;
//!
//! // Queued until the connection is up
//! manager.subscribe(TABLES_TOPIC, |msg| async move {
//!     println!("table update: {}", msg.body);
//! });
//!
//! manager.connect().await?;
//! manager.send("/app/table.subscribe", &serde_json::json!({"tableId": "t-1"}));
//! manager.disconnect();
//! # Ok(())
//! # }
//! ```

use crate::backoff::{ExponentialBackoff, ReconnectPolicy};
use crate::connection_state::ConnectionState;
use crate::listeners::{ListenerHandle, ListenerSet};
use crate::metrics::ClientMetrics;
use crate::reconnector::Reconnector;
use crate::registry::{ActiveSubscription, SubscriptionRegistry};
use crate::subscription_set::{SubscriptionSet, TopicHandler};
use crate::transport::{message_handler, MessageHandler, Session, Transport};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tablecast_core::{Error, MessageEnvelope, Result};

type Attempt = Shared<BoxFuture<'static, Result<()>>>;

enum Phase {
    Disconnected,
    /// Joined by every caller until the handshake settles
    Connecting(Attempt),
    Connected(Arc<dyn Session>),
}

impl Phase {
    fn as_state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
        }
    }
}

struct State {
    phase: Phase,
    /// Bumped whenever an attempt starts or a connection ends; an attempt or
    /// session watcher carrying an older value is stale
    generation: u64,
    references: usize,
    registry: SubscriptionRegistry,
}

struct Inner {
    transport: Arc<dyn Transport>,
    endpoint: String,
    policy: Arc<dyn ReconnectPolicy>,
    state: Mutex<State>,
    on_connect: ListenerSet<()>,
    on_disconnect: ListenerSet<()>,
    on_error: ListenerSet<Error>,
    metrics: Option<Arc<ClientMetrics>>,
}

/// Identifies a subscription that went live immediately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Transport subscription id
    pub id: String,
    pub topic: String,
}

/// Cheap-to-clone handle to the shared connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager over a custom transport with the default backoff and no metrics
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_parts(
            transport,
            "custom".to_string(),
            Arc::new(ExponentialBackoff::default()),
            None,
        )
    }

    pub(crate) fn with_parts(
        transport: Arc<dyn Transport>,
        endpoint: String,
        policy: Arc<dyn ReconnectPolicy>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                endpoint,
                policy,
                state: Mutex::new(State {
                    phase: Phase::Disconnected,
                    generation: 0,
                    references: 0,
                    registry: SubscriptionRegistry::new(),
                }),
                on_connect: ListenerSet::new("connect"),
                on_disconnect: ListenerSet::new("disconnect"),
                on_error: ListenerSet::new("error"),
                metrics,
            }),
        }
    }

    /// Backoff policy handed to reconnectors mounted through this manager
    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        self.inner.policy.clone()
    }

    /// Mount a [`Reconnector`] using this manager's backoff policy
    pub fn reconnector(&self) -> Reconnector {
        Reconnector::mount(self, self.reconnect_policy())
    }

    /// Mount a [`SubscriptionSet`] using this manager's backoff policy
    pub fn subscription_set(&self, topics: Vec<TopicHandler>) -> SubscriptionSet {
        SubscriptionSet::mount(self, self.reconnect_policy(), topics)
    }

    /// Take a reference and wait until connected
    ///
    /// The reference is taken when this is called, not when the returned
    /// future is first polled. It is kept even if the handshake fails; pair
    /// every call with one [`disconnect`](Self::disconnect).
    pub fn connect(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let attempt = {
            let mut state = self.inner.state.lock();
            state.references += 1;
            tracing::debug!(references = state.references, "Reference acquired");
            self.inner.record_references(state.references);
            Inner::begin_attempt(&self.inner, &mut state)
        };
        settle(attempt)
    }

    /// Start or join a connect attempt without taking a reference
    pub fn ensure_connected(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let attempt = {
            let mut state = self.inner.state.lock();
            Inner::begin_attempt(&self.inner, &mut state)
        };
        settle(attempt)
    }

    /// Release a reference, tearing the connection down on the last one
    ///
    /// Teardown unsubscribes every live subscription, closes the session,
    /// and then runs the disconnect listeners. Queued subscriptions are kept
    /// for the next connect. A handshake still in flight is abandoned: its
    /// callers get [`Error::Superseded`].
    #[tracing::instrument(skip(self), fields(endpoint = %self.inner.endpoint))]
    pub fn disconnect(&self) {
        let (previous, active) = {
            let mut state = self.inner.state.lock();
            state.references = state.references.saturating_sub(1);
            self.inner.record_references(state.references);
            if state.references > 0 {
                tracing::debug!(references = state.references, "Connection still in use");
                return;
            }
            let previous = std::mem::replace(&mut state.phase, Phase::Disconnected);
            if !matches!(previous, Phase::Disconnected) {
                state.generation += 1;
            }
            (previous, state.registry.clear_active())
        };

        for (topic, subscription) in active {
            if let Err(e) = subscription.handle.unsubscribe() {
                tracing::warn!(topic = %topic, error = %e, "Unsubscribe during teardown failed");
            }
        }

        match previous {
            Phase::Disconnected => return,
            Phase::Connecting(_) => {
                tracing::info!("Last reference released while connecting; abandoning attempt");
            }
            Phase::Connected(session) => {
                if session.is_connected() {
                    if let Err(e) = session.close() {
                        tracing::error!(error = %e, "Failed to close connection");
                        self.inner.record_error(&e);
                        self.inner.on_error.invoke_all(&e);
                    }
                }
                tracing::info!("Disconnected");
            }
        }

        self.inner.record_state(ConnectionState::Disconnected);
        self.inner.on_disconnect.invoke_all(&());
    }

    /// Subscribe `handler` to `topic`
    ///
    /// Returns `Some` when the subscription went live immediately. Returns
    /// `None` when it was queued because the connection is not up; a connect
    /// attempt is then started or joined without taking a reference, and the
    /// queue is drained on the next successful connect. If nobody holds a
    /// reference when that handshake completes, the session is closed again
    /// and the request stays queued.
    ///
    /// Subscribing a topic that is already live releases the previous
    /// subscription before recording the new one.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Option<SubscriptionInfo>
    where
        F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(topic, message_handler(handler))
    }

    /// [`subscribe`](Self::subscribe) with a prebuilt [`MessageHandler`]
    #[tracing::instrument(skip(self, handler))]
    pub fn subscribe_with(&self, topic: &str, handler: MessageHandler) -> Option<SubscriptionInfo> {
        let mut state = self.inner.state.lock();

        if let Phase::Connected(session) = &state.phase {
            let session = session.clone();
            if session.is_connected() {
                match session.subscribe(topic, self.inner.instrument(handler.clone())) {
                    Ok(handle) => {
                        let info = SubscriptionInfo {
                            id: handle.id().to_string(),
                            topic: topic.to_string(),
                        };
                        let displaced = state
                            .registry
                            .insert_active(topic, ActiveSubscription { handle, handler });
                        drop(state);
                        if let Some(previous) = displaced {
                            release_displaced(topic, previous);
                        }
                        tracing::debug!(id = %info.id, "Subscribed");
                        return Some(info);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Subscribe failed; queueing for next connect");
                    }
                }
            }
        }

        state.registry.enqueue(topic, handler);
        tracing::debug!(
            pending = state.registry.pending_len(),
            "Not connected; subscription queued"
        );
        // The outcome is ignored: the queue drains on whichever connect succeeds.
        let _ = Inner::begin_attempt(&self.inner, &mut state);
        None
    }

    /// Release the live subscription for `topic`, if any
    ///
    /// Queued requests for the topic are dropped too.
    pub fn unsubscribe(&self, topic: &str) {
        let (removed, cancelled) = {
            let mut state = self.inner.state.lock();
            (state.registry.remove(topic), state.registry.cancel_pending(topic))
        };

        if let Some(subscription) = removed {
            match subscription.handle.unsubscribe() {
                Ok(()) => tracing::debug!(topic, "Unsubscribed"),
                Err(e) => tracing::warn!(topic, error = %e, "Unsubscribe failed"),
            }
        }
        if cancelled > 0 {
            tracing::debug!(topic, cancelled, "Dropped queued subscriptions");
        }
    }

    /// Serialize `body` as JSON and send it to `topic`
    ///
    /// Never queues. Without a live session the message is dropped and an
    /// error is logged.
    pub fn send<T: Serialize + ?Sized>(&self, topic: &str, body: &T) {
        let payload = match serde_json::to_string(body) {
            Ok(payload) => payload,
            Err(e) => {
                let error = Error::from(e);
                tracing::error!(topic, error = %error, "Failed to serialize message");
                self.inner.record_error(&error);
                return;
            }
        };

        let session = {
            let state = self.inner.state.lock();
            match &state.phase {
                Phase::Connected(session) if session.is_connected() => Some(session.clone()),
                _ => None,
            }
        };

        match session {
            Some(session) => {
                if let Err(e) = session.send(topic, payload) {
                    tracing::error!(topic, error = %e, "Failed to send message");
                    self.inner.record_error(&e);
                }
            }
            None => {
                tracing::error!(topic, "Cannot send message: not connected");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_send_dropped(topic);
                }
            }
        }
    }

    /// Whether a confirmed, live session exists
    pub fn is_connected(&self) -> bool {
        match &self.inner.state.lock().phase {
            Phase::Connected(session) => session.is_connected(),
            _ => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase.as_state()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.state.lock().references
    }

    /// Topics with a live subscription, sorted
    pub fn active_topics(&self) -> Vec<String> {
        self.inner.state.lock().registry.topics()
    }

    /// Topics waiting for a connection, in request order
    pub fn pending_topics(&self) -> Vec<String> {
        self.inner.state.lock().registry.pending_topics()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().registry.pending_len()
    }

    /// Run `listener` every time the connection comes up
    pub fn on_connect<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_connect.add(move |_: &()| listener())
    }

    /// Run `listener` every time the connection goes down
    pub fn on_disconnect<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_disconnect.add(move |_: &()| listener())
    }

    /// Run `listener` for non-fatal errors, such as a failed close
    pub fn on_error<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.on_error.add(listener)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &state.phase.as_state())
            .field("references", &state.references)
            .field("active", &state.registry.active_len())
            .field("pending", &state.registry.pending_len())
            .finish()
    }
}

fn settle(attempt: Option<Attempt>) -> impl Future<Output = Result<()>> + Send + 'static {
    async move {
        match attempt {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }
}

/// Outcome of a finished handshake
enum Adopt {
    Yes,
    /// `disconnect()` released the last reference mid-attempt
    Superseded,
    /// Started by a subscribe while nobody held a reference
    Idle,
}

/// Close a session nobody will use
fn discard(session: Arc<dyn Session>) -> Error {
    if let Err(e) = session.close() {
        tracing::debug!(error = %e, "Closing unadopted session failed");
    }
    Error::Superseded
}

fn release_displaced(topic: &str, previous: ActiveSubscription) {
    tracing::debug!(topic, id = previous.handle.id(), "Releasing replaced subscription");
    if let Err(e) = previous.handle.unsubscribe() {
        tracing::warn!(topic, error = %e, "Failed to release replaced subscription");
    }
}

impl Inner {
    /// Join the running attempt, or start one if disconnected
    ///
    /// `None` means already connected.
    fn begin_attempt(inner: &Arc<Inner>, state: &mut State) -> Option<Attempt> {
        match &state.phase {
            Phase::Connected(_) => None,
            Phase::Connecting(attempt) => Some(attempt.clone()),
            Phase::Disconnected => {
                state.generation += 1;
                let generation = state.generation;

                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    let error = Error::Internal("connect requires a Tokio runtime".to_string());
                    return Some(futures::future::ready(Err(error)).boxed().shared());
                };

                let task = runtime.spawn(Inner::handshake(inner.clone(), generation));
                let attempt = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(Error::Internal(format!("connect task failed: {e}")))
                    })
                }
                .boxed()
                .shared();

                state.phase = Phase::Connecting(attempt.clone());
                inner.record_state(ConnectionState::Connecting);
                Some(attempt)
            }
        }
    }

    #[tracing::instrument(skip(inner), fields(endpoint = %inner.endpoint))]
    async fn handshake(inner: Arc<Inner>, generation: u64) -> Result<()> {
        tracing::info!("Connecting");
        if let Some(metrics) = &inner.metrics {
            metrics.record_connect_attempt();
        }

        let session = match inner.transport.open().await {
            Ok(session) => session,
            Err(e) => {
                let current = {
                    let mut state = inner.state.lock();
                    let current = state.generation == generation;
                    if current {
                        state.phase = Phase::Disconnected;
                    }
                    current
                };
                tracing::warn!(error = %e, "Handshake failed");
                if let Some(metrics) = &inner.metrics {
                    metrics.record_handshake_failure(e.kind());
                }
                if current {
                    inner.record_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let adopt = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                Adopt::Superseded
            } else if state.references == 0 {
                state.generation += 1;
                state.phase = Phase::Disconnected;
                Adopt::Idle
            } else {
                Adopt::Yes
            }
        };
        match adopt {
            Adopt::Yes => {}
            Adopt::Superseded => {
                tracing::debug!("Attempt superseded by disconnect; closing its session");
                return Err(discard(session));
            }
            Adopt::Idle => {
                tracing::info!("No reference held; closing idle session");
                inner.record_state(ConnectionState::Disconnected);
                return Err(discard(session));
            }
        }

        // Still Connecting here: joiners keep waiting and new subscribes queue.
        inner.on_connect.invoke_all(&());
        if !inner.activate(generation, &session) {
            tracing::debug!("Attempt superseded during connect listeners; closing its session");
            return Err(discard(session));
        }

        tracing::info!("Connected");
        inner.record_state(ConnectionState::Connected);
        inner.watch_session(generation, session);
        Ok(())
    }

    /// Make every queued subscription live on `session`, then publish it
    ///
    /// Both happen under one lock so nothing subscribed later can go live
    /// ahead of the queue. Returns `false` if the attempt went stale.
    fn activate(&self, generation: u64, session: &Arc<dyn Session>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Connecting(_)) {
            return false;
        }

        let mut drained = 0;
        let mut failed = Vec::new();
        let mut displaced = Vec::new();
        for request in state.registry.drain_pending() {
            match session.subscribe(&request.topic, self.instrument(request.handler.clone())) {
                Ok(handle) => {
                    drained += 1;
                    let active = ActiveSubscription {
                        handle,
                        handler: request.handler,
                    };
                    if let Some(previous) = state.registry.insert_active(request.topic.clone(), active) {
                        displaced.push((request.topic, previous));
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = %request.topic, error = %e, "Queued subscribe failed");
                    failed.push(request);
                }
            }
        }
        state.registry.requeue_front(failed);
        state.phase = Phase::Connected(session.clone());
        drop(state);

        for (topic, previous) in displaced {
            release_displaced(&topic, previous);
        }
        if drained > 0 {
            tracing::debug!(drained, "Queued subscriptions activated");
            if let Some(metrics) = &self.metrics {
                metrics.record_drained(drained);
            }
        }
        true
    }

    fn watch_session(self: &Arc<Self>, generation: u64, session: Arc<dyn Session>) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.session_lost(generation);
            }
        });
    }

    /// The session ended without `disconnect()`
    fn session_lost(&self, generation: u64) {
        let restored = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connected(_)) {
                return;
            }
            state.generation += 1;
            state.phase = Phase::Disconnected;
            state.registry.restore_active()
        };

        tracing::warn!(restored, "Connection lost");
        self.record_error(&Error::ConnectionClosed);
        self.record_state(ConnectionState::Disconnected);
        self.on_disconnect.invoke_all(&());
    }

    fn instrument(&self, handler: MessageHandler) -> MessageHandler {
        match &self.metrics {
            None => handler,
            Some(metrics) => {
                let metrics = metrics.clone();
                Arc::new(move |msg: MessageEnvelope| {
                    metrics.record_message(&msg.destination);
                    handler(msg)
                })
            }
        }
    }

    fn record_state(&self, state: ConnectionState) {
        tracing::debug!(state = %state, "Connection state changed");
        if let Some(metrics) = &self.metrics {
            metrics.update_connection_state(state);
        }
    }

    fn record_references(&self, references: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.update_references(references);
        }
    }

    fn record_error(&self, error: &Error) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(error.kind());
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Phase::Connected(session) = &self.state.get_mut().phase {
            if session.is_connected() {
                let _ = session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn open(&self) -> Result<Arc<dyn Session>> {
            Err(Error::Handshake("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_reference() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        let result = manager.connect().await;

        assert_eq!(result, Err(Error::Handshake("refused".into())));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reference_count(), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_floors_at_zero() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_listener_not_run_when_already_disconnected() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        let fired = Arc::new(Mutex::new(0));
        let f = fired.clone();
        let _handle = manager.on_disconnect(move || *f.lock() += 1);

        manager.disconnect();
        assert_eq!(*fired.lock(), 0);
    }

    #[test]
    fn test_connect_outside_runtime_errors() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        let result = futures::executor::block_on(manager.connect());
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        manager.send("/app/table.subscribe", &serde_json::json!({"tableId": "t-1"}));
        assert_eq!(manager.pending_count(), 0);
    }
}
