//! Per-consumer connection lifecycle with bounded retries
//!
//! A [`Reconnector`] is what a long-lived consumer (a page, a widget, a
//! worker) holds while it needs the shared connection. Mounting takes one
//! reference on the [`ConnectionManager`]; unmounting, or dropping the
//! `Reconnector`, releases it.
//!
//! When an attempt fails the reconnector waits according to its
//! [`ReconnectPolicy`] and tries again, by default after 1s, 2s, 4s, 8s and
//! 16s, then gives up until [`connect`](Reconnector::connect) is called
//! by hand. Retries join or start a handshake on the manager without taking
//! further references.
//!
//! The local connected flag also follows connect and disconnect events
//! caused by other consumers, and can be observed with
//! [`watch`](Reconnector::watch).

use crate::backoff::ReconnectPolicy;
use crate::connection_state::ReconnectorState;
use crate::listeners::ListenerHandle;
use crate::manager::{ConnectionManager, SubscriptionInfo};
use crate::transport::MessageHandler;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tablecast_core::{Error, MessageEnvelope, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Local {
    state: ReconnectorState,
    attempt_count: u32,
    error: Option<Error>,
    /// An attempt started by this reconnector is in flight
    connecting: bool,
    /// This reconnector currently counts toward the manager's references
    holds_reference: bool,
    mounted: bool,
    retry: Option<JoinHandle<()>>,
}

struct Shared {
    manager: ConnectionManager,
    policy: Arc<dyn ReconnectPolicy>,
    local: Mutex<Local>,
    connected: watch::Sender<bool>,
}

/// Keeps the shared connection up for one consumer
pub struct Reconnector {
    shared: Arc<Shared>,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl Reconnector {
    /// Take a reference on `manager` and start connecting
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mount(manager: &ConnectionManager, policy: Arc<dyn ReconnectPolicy>) -> Self {
        let (connected, _) = watch::channel(manager.is_connected());
        let shared = Arc::new(Shared {
            manager: manager.clone(),
            policy,
            local: Mutex::new(Local {
                state: ReconnectorState::Idle,
                attempt_count: 0,
                error: None,
                connecting: false,
                holds_reference: false,
                mounted: true,
                retry: None,
            }),
            connected,
        });

        let weak = Arc::downgrade(&shared);
        let on_connect = manager.on_connect(move || {
            if let Some(shared) = weak.upgrade() {
                shared.connected_elsewhere();
            }
        });
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let on_disconnect = manager.on_disconnect(move || {
            if let Some(shared) = weak.upgrade() {
                shared.disconnected_elsewhere();
            }
        });

        tracing::debug!("Reconnector mounted");
        tokio::spawn(Shared::attempt(shared.clone()));

        Self {
            shared,
            listeners: Mutex::new(vec![on_connect, on_disconnect]),
        }
    }

    /// Local view of the connection
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Receiver that sees every change of the local connected flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn state(&self) -> ReconnectorState {
        self.shared.local.lock().state
    }

    /// Error from the most recent failed attempt, cleared on success
    pub fn error(&self) -> Option<Error> {
        self.shared.local.lock().error.clone()
    }

    /// Retries fired since the last successful connect
    pub fn attempt_count(&self) -> u32 {
        self.shared.local.lock().attempt_count
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    /// Connect now, restarting the retry budget
    ///
    /// A no-op while an attempt is in flight or already connected. Also
    /// re-takes the reference released by [`disconnect`](Self::disconnect).
    pub fn connect(&self) -> impl Future<Output = ()> + Send + 'static {
        {
            let mut local = self.shared.local.lock();
            let connected = local.holds_reference && *self.shared.connected.borrow();
            if local.connecting || connected {
                tracing::debug!(connecting = local.connecting, "Connect ignored");
                return futures::future::ready(()).boxed();
            }
            if let Some(retry) = local.retry.take() {
                retry.abort();
            }
            local.attempt_count = 0;
        }
        Shared::attempt(self.shared.clone())
    }

    /// Release this consumer's reference and stop retrying
    pub fn disconnect(&self) {
        let release = {
            let mut local = self.shared.local.lock();
            if let Some(retry) = local.retry.take() {
                retry.abort();
            }
            local.state = ReconnectorState::Idle;
            std::mem::replace(&mut local.holds_reference, false)
        };
        if release {
            self.shared.manager.disconnect();
        }
        self.shared.set_connected(false);
    }

    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Option<SubscriptionInfo>
    where
        F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.manager.subscribe(topic, handler)
    }

    pub fn subscribe_with(&self, topic: &str, handler: MessageHandler) -> Option<SubscriptionInfo> {
        self.shared.manager.subscribe_with(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.shared.manager.unsubscribe(topic);
    }

    pub fn send<T: Serialize + ?Sized>(&self, topic: &str, body: &T) {
        self.shared.manager.send(topic, body);
    }

    /// Cancel retries, stop listening, then release the reference
    ///
    /// Idempotent. Dropping the reconnector does the same.
    pub fn unmount(&self) {
        {
            let mut local = self.shared.local.lock();
            if !local.mounted {
                return;
            }
            local.mounted = false;
            if let Some(retry) = local.retry.take() {
                retry.abort();
            }
        }
        for handle in self.listeners.lock().drain(..) {
            handle.remove();
        }
        self.disconnect();
        tracing::debug!("Reconnector unmounted");
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl Shared {
    /// One connect attempt, scheduling a retry if it fails
    ///
    /// Boxed so the retry task, which calls back into it, has a nameable type.
    fn attempt(shared: Arc<Shared>) -> BoxFuture<'static, ()> {
        let pending = {
            let mut local = shared.local.lock();
            if !local.mounted || local.connecting {
                None
            } else if !local.holds_reference {
                // Resolves at once if another consumer already connected.
                local.holds_reference = true;
                local.connecting = true;
                local.state = ReconnectorState::Connecting;
                Some(shared.manager.connect().boxed())
            } else if *shared.connected.borrow() {
                None
            } else {
                local.connecting = true;
                local.state = ReconnectorState::Connecting;
                Some(shared.manager.ensure_connected().boxed())
            }
        };

        async move {
            if let Some(pending) = pending {
                let result = pending.await;
                Shared::finish(&shared, result);
            }
        }
        .boxed()
    }

    fn finish(shared: &Arc<Shared>, result: Result<()>) {
        let mut local = shared.local.lock();
        local.connecting = false;
        match result {
            Ok(()) => {
                local.attempt_count = 0;
                local.error = None;
                local.state = ReconnectorState::Connected;
                drop(local);
                shared.set_connected(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = local.attempt_count, "Connect attempt failed");
                local.error = Some(e);
                local.state = ReconnectorState::Failed;
                Shared::schedule_retry(shared, &mut local);
                drop(local);
                shared.set_connected(false);
            }
        }
    }

    fn schedule_retry(shared: &Arc<Shared>, local: &mut Local) {
        if !local.mounted || !local.holds_reference || local.retry.is_some() {
            return;
        }
        if matches!(local.error, Some(Error::Superseded)) {
            return;
        }

        let Some(delay) = shared.policy.delay_for(local.attempt_count) else {
            tracing::warn!(
                attempts = local.attempt_count,
                "Giving up on reconnecting; call connect() to resume"
            );
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No Tokio runtime; cannot schedule reconnect");
            return;
        };

        tracing::info!(
            attempt = local.attempt_count + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        let weak = Arc::downgrade(shared);
        local.retry = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut local = shared.local.lock();
                local.retry = None;
                local.attempt_count += 1;
            }
            Shared::attempt(shared).await;
        }));
    }

    /// Another consumer (or our own attempt) brought the connection up
    fn connected_elsewhere(&self) {
        {
            let mut local = self.local.lock();
            if !local.mounted {
                return;
            }
            if let Some(retry) = local.retry.take() {
                retry.abort();
            }
            local.state = ReconnectorState::Connected;
            local.attempt_count = 0;
            local.error = None;
        }
        self.set_connected(true);
    }

    /// The connection went down; retry if we still want it
    fn disconnected_elsewhere(self: &Arc<Self>) {
        let mut local = self.local.lock();
        if !local.mounted {
            return;
        }
        if local.state == ReconnectorState::Connected {
            local.state = ReconnectorState::Failed;
            local.error = Some(Error::ConnectionClosed);
        }
        if !local.connecting {
            Shared::schedule_retry(self, &mut local);
        }
        drop(local);
        self.set_connected(false);
    }

    fn set_connected(&self, value: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::NoReconnect;
    use crate::transport::{Session, Transport};
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn open(&self) -> Result<Arc<dyn Session>> {
            Err(Error::Handshake("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_mount_takes_one_reference_and_unmount_releases_it() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        let reconnector = Reconnector::mount(&manager, Arc::new(NoReconnect));
        assert_eq!(manager.reference_count(), 1);

        reconnector.unmount();
        assert_eq!(manager.reference_count(), 0);
        reconnector.unmount();
        assert_eq!(manager.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unmounts() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        {
            let _a = Reconnector::mount(&manager, Arc::new(NoReconnect));
            let _b = Reconnector::mount(&manager, Arc::new(NoReconnect));
            assert_eq!(manager.reference_count(), 2);
        }
        assert_eq!(manager.reference_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_retry_records_error() {
        let manager = ConnectionManager::new(Arc::new(Refusing));
        let reconnector = Reconnector::mount(&manager, Arc::new(NoReconnect));
        let watch = reconnector.watch();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(reconnector.state(), ReconnectorState::Failed);
        assert_eq!(reconnector.error(), Some(Error::Handshake("refused".into())));
        assert!(!reconnector.is_connected());
        assert!(!watch.has_changed().unwrap_or(true));
        assert_eq!(reconnector.attempt_count(), 0);
        assert_eq!(manager.reference_count(), 1);
    }
}
