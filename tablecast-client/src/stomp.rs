//! STOMP over WebSocket
//!
//! [`StompTransport`] opens a WebSocket with `tokio-tungstenite`, sends
//! `CONNECT` and waits for `CONNECTED`. The resulting [`StompSession`] runs
//! two tasks:
//!
//! - a writer fed by an unbounded channel, so `subscribe`/`send` never wait,
//!   which also emits heart-beats at the negotiated interval
//! - a reader that routes `MESSAGE` frames to handlers by their
//!   `subscription` header
//!
//! The session ends when either task stops: socket closed, `ERROR` frame
//! received, or nothing heard from the broker for twice the negotiated
//! incoming heart-beat interval.

use crate::config::ClientConfig;
use crate::transport::{MessageHandler, Session, SubscriptionHandle, Transport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tablecast_core::frame::{self, Command, Decoded, Frame, HeartBeat};
use tablecast_core::{Error, MessageEnvelope, Result};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Opens STOMP sessions to one broker endpoint
#[derive(Debug, Clone)]
pub struct StompTransport {
    config: ClientConfig,
    endpoint: Url,
}

impl StompTransport {
    /// Validate `config` and prepare a transport; nothing is opened yet
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        Ok(Self { config, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn connect_frame(&self) -> Frame {
        let mut frame = Frame::connect(&self.config.virtual_host(), self.config.heart_beat());
        for (name, value) in &self.config.connect_headers {
            frame = frame.header(name.clone(), value.clone());
        }
        frame
    }
}

#[async_trait]
impl Transport for StompTransport {
    #[tracing::instrument(skip(self), fields(url = %self.endpoint))]
    async fn open(&self) -> Result<Arc<dyn Session>> {
        let (ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        sink.send(Message::Text(frame::encode(&self.connect_frame())))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let connected = await_connected(&mut source).await?;
        let remote = match connected.get("heart-beat") {
            Some(value) => HeartBeat::parse(value)?,
            None => HeartBeat::default(),
        };
        let negotiated = HeartBeat::negotiate(self.config.heart_beat(), remote);
        tracing::debug!(
            version = connected.get("version").unwrap_or("1.0"),
            send_every = ?negotiated.send_every,
            expect_every = ?negotiated.expect_every,
            "STOMP session established"
        );

        let session: Arc<dyn Session> = StompSession::start(
            sink,
            source,
            negotiated.send_every,
            negotiated.expect_every.map(|every| every * 2),
        );
        Ok(session)
    }
}

async fn await_connected(source: &mut WsSource) -> Result<Frame> {
    while let Some(message) = source.next().await {
        let message = message.map_err(|e| Error::WebSocket(e.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match frame::decode(&text)? {
            Decoded::HeartBeat => continue,
            Decoded::Frame(frame) => frame,
        };
        return match frame.command {
            Command::Connected => Ok(frame),
            Command::Error => Err(Error::Handshake(
                frame.get("message").unwrap_or("broker sent ERROR").to_string(),
            )),
            other => Err(Error::Handshake(format!("expected CONNECTED, got {other}"))),
        };
    }
    Err(Error::Handshake("connection closed before CONNECTED".to_string()))
}

struct SessionShared {
    outgoing: mpsc::UnboundedSender<Message>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl SessionShared {
    fn write(&self, frame: &Frame) -> Result<()> {
        self.outgoing
            .send(Message::Text(frame::encode(frame)))
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn dispatch(&self, frame: Frame) {
        let envelope = match MessageEnvelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed MESSAGE frame");
                return;
            }
        };
        let handler = self.handlers.lock().get(&envelope.subscription).cloned();
        match handler {
            Some(handler) => handler(envelope).await,
            None => tracing::debug!(
                subscription = %envelope.subscription,
                "Message for unknown subscription"
            ),
        }
    }
}

/// A live STOMP session
pub struct StompSession {
    shared: Arc<SessionShared>,
    closed: watch::Receiver<bool>,
}

impl StompSession {
    fn start(
        sink: WsSink,
        source: WsSource,
        heartbeat_every: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            outgoing: tx,
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        });

        let mut send_task = tokio::spawn(write_loop(sink, rx, heartbeat_every));
        let mut recv_task = tokio::spawn(read_loop(source, shared.clone(), read_timeout));

        let supervised = shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut send_task => recv_task.abort(),
                _ = &mut recv_task => send_task.abort(),
            }
            supervised.connected.store(false, Ordering::SeqCst);
            supervised.handlers.lock().clear();
            let _ = closed_tx.send(true);
            tracing::debug!("STOMP session ended");
        });

        Arc::new(Self {
            shared,
            closed: closed_rx,
        })
    }
}

#[async_trait]
impl Session for StompSession {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = format!("sub-{}", self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.shared.handlers.lock().insert(id.clone(), handler);
        if let Err(e) = self.shared.write(&Frame::subscribe(&id, destination)) {
            self.shared.handlers.lock().remove(&id);
            return Err(e);
        }
        Ok(Box::new(StompSubscription {
            id,
            destination: destination.to_string(),
            session: Arc::downgrade(&self.shared),
        }))
    }

    fn send(&self, destination: &str, body: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.shared.write(&Frame::send(destination, body))
    }

    fn close(&self) -> Result<()> {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.shared.write(&Frame::disconnect(None))?;
        self.shared
            .outgoing
            .send(Message::Close(None))
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

struct StompSubscription {
    id: String,
    destination: String,
    session: Weak<SessionShared>,
}

impl SubscriptionHandle for StompSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn unsubscribe(&self) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.handlers.lock().remove(&self.id);
        if session.connected.load(Ordering::SeqCst) {
            session.write(&Frame::unsubscribe(&self.id))?;
        }
        Ok(())
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    heartbeat_every: Option<Duration>,
) {
    let mut heartbeat = heartbeat_every.map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let message = tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = next_tick(&mut heartbeat) => Message::Text("\n".to_string()),
        };
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn read_loop(mut source: WsSource, shared: Arc<SessionShared>, timeout: Option<Duration>) {
    loop {
        let next = match timeout {
            Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(timeout_ms = limit.as_millis() as u64, "Broker went silent");
                    break;
                }
            },
            None => source.next().await,
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "WebSocket read failed");
                break;
            }
        };

        let frame = match frame::decode(&text) {
            Ok(Decoded::Frame(frame)) => frame,
            Ok(Decoded::HeartBeat) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed frame");
                continue;
            }
        };

        match frame.command {
            Command::Message => shared.dispatch(frame).await,
            Command::Receipt => {
                tracing::debug!(receipt = frame.get("receipt-id").unwrap_or_default(), "Receipt")
            }
            Command::Error => {
                tracing::error!(
                    message = frame.get("message").unwrap_or_default(),
                    body = %frame.body,
                    "Broker sent ERROR; ending session"
                );
                break;
            }
            other => tracing::debug!(command = %other, "Ignoring unexpected frame"),
        }
    }
}
