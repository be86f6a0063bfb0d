//! Recording mock transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tablecast_client::{
    ConnectionManager, Error, MessageEnvelope, MessageHandler, Result, Session,
    SubscriptionHandle, Transport,
};
use tokio::sync::watch;
use tokio::time::Instant;

/// Something the code under test asked the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Subscribe(String),
    Unsubscribe(String),
    Send(String, String),
    Close,
}

/// Outcome of one `open()` call
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Fail(Error),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    fail_always: AtomicBool,
    fail_close: Arc<AtomicBool>,
    open_delay: Mutex<Duration>,
    opens: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    recorder: Arc<Recorder>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fail_always: AtomicBool::new(false),
            fail_close: Arc::new(AtomicBool::new(false)),
            open_delay: Mutex::new(Duration::ZERO),
            opens: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            recorder: Arc::new(Recorder::default()),
        })
    }

    pub fn manager(self: &Arc<Self>) -> ConnectionManager {
        ConnectionManager::new(self.clone())
    }

    /// The next `n` handshakes fail; later ones succeed
    pub fn fail_next(&self, n: usize) {
        let mut script = self.script.lock();
        for i in 0..n {
            script.push_back(Outcome::Fail(Error::Handshake(format!("refused #{}", i + 1))));
        }
    }

    /// Every handshake fails until turned off
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// `close()` on sessions reports an error
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Each handshake takes this long before settling
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.recorder.events.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Unsubscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Close).count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Most recently opened session
    pub fn session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<Arc<dyn Session>> {
        self.opens.lock().push(Instant::now());
        self.recorder.push(Event::Open);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(Error::Handshake("refused".into()));
        }
        let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Succeed);
        match outcome {
            Outcome::Fail(e) => Err(e),
            Outcome::Succeed => {
                let session = MockSession::new(self.recorder.clone(), self.fail_close.clone());
                self.sessions.lock().push(session.clone());
                Ok(session)
            }
        }
    }
}

pub struct MockSession {
    me: Weak<MockSession>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    handlers: Mutex<HashMap<String, (String, MessageHandler)>>,
    next_id: AtomicU64,
    fail_close: Arc<AtomicBool>,
    recorder: Arc<Recorder>,
}

impl MockSession {
    fn new(recorder: Arc<Recorder>, fail_close: Arc<AtomicBool>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connected: AtomicBool::new(true),
            closed,
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            fail_close,
            recorder,
        })
    }

    /// Deliver `body` to every live handler on `topic`; returns how many ran
    pub async fn deliver(&self, topic: &str, body: &str) -> usize {
        let targets: Vec<(String, MessageHandler)> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, (dest, _))| dest == topic)
            .map(|(id, (_, handler))| (id.clone(), handler.clone()))
            .collect();
        for (id, handler) in &targets {
            let mut envelope = MessageEnvelope::new(topic, body);
            envelope.subscription = id.clone();
            handler(envelope).await;
        }
        targets.len()
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }

    pub fn live_subscriptions(&self) -> usize {
        self.handlers.lock().len()
    }
}

#[async_trait]
impl Session for MockSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .insert(id.clone(), (destination.to_string(), handler));
        self.recorder.push(Event::Subscribe(destination.to_string()));
        Ok(Box::new(MockSubscription {
            id,
            destination: destination.to_string(),
            session: self.me.clone(),
            recorder: self.recorder.clone(),
        }))
    }

    fn send(&self, destination: &str, body: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.recorder.push(Event::Send(destination.to_string(), body));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.recorder.push(Event::Close);
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.lock().clear();
        self.closed.send_replace(true);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Io("socket already reset".into()));
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

struct MockSubscription {
    id: String,
    destination: String,
    session: Weak<MockSession>,
    recorder: Arc<Recorder>,
}

impl SubscriptionHandle for MockSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn unsubscribe(&self) -> Result<()> {
        if let Some(session) = self.session.upgrade() {
            session.handlers.lock().remove(&self.id);
        }
        self.recorder.push(Event::Unsubscribe(self.destination.clone()));
        Ok(())
    }
}

/// Let spawned tasks run without moving the paused clock far
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
