//! Per-connection STOMP session handling
//!
//! # Connection Lifecycle
//!
//! 1. **Upgrade**: accept the WebSocket upgrade on any path
//! 2. **Handshake**: the first frame must be `CONNECT` or `STOMP`; it is
//!    answered with `CONNECTED`, or with `ERROR` while rejections are armed
//! 3. **Register**: add to the connection registry
//! 4. **Process**: `SUBSCRIBE`, `UNSUBSCRIBE`, `SEND`, `DISCONNECT`
//! 5. **Cleanup**: remove from the registry and drop its subscriptions
//!
//! As in the client, a send task drains an unbounded channel into the socket
//! and emits heart-beats; the receive task handles incoming frames. The
//! connection ends as soon as either task stops.
//!
//! A malformed or unexpected frame is answered with `ERROR` and the
//! connection is closed, as STOMP 1.2 requires.

use crate::BrokerState;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tablecast_core::frame::{self, Command, Decoded, Frame, HeartBeat};
use tablecast_core::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Handle for sending to one connected client
///
/// Cheap to clone; every clone feeds the same send task.
#[derive(Clone)]
pub struct Connection {
    pub id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    /// Queue a frame for the client
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.tx
            .send(Message::Text(frame::encode(frame)))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queue a WebSocket close; the send task stops after writing it
    pub fn close(&self) -> Result<()> {
        self.tx
            .send(Message::Close(None))
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Serve one accepted TCP connection until it closes
#[tracing::instrument(skip(stream, state), fields(conn_id = conn_id))]
pub(crate) async fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    state: Arc<BrokerState>,
) -> Result<()> {
    tracing::debug!("Upgrading connection to WebSocket");
    let ws = accept_async(stream)
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))?;
    let (mut sink, mut source) = ws.split();

    let Some(connect) = next_frame(&mut source).await? else {
        tracing::debug!("Client left before CONNECT");
        return Ok(());
    };
    if !matches!(connect.command, Command::Connect | Command::Stomp) {
        let error = Error::Protocol(format!("expected CONNECT, got {}", connect.command));
        refuse(&mut sink, &error.to_string()).await;
        return Err(error);
    }
    if state.take_rejection() {
        tracing::info!("Rejecting handshake");
        if let Some(metrics) = &state.metrics {
            metrics.record_rejected_handshake();
        }
        refuse(&mut sink, "connection rejected").await;
        return Ok(());
    }

    let remote = match connect.get("heart-beat") {
        Some(value) => HeartBeat::parse(value)?,
        None => HeartBeat::default(),
    };
    let negotiated = HeartBeat::negotiate(state.heart_beat, remote);

    // CONNECTED goes out through the send task, after registration
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection::new(conn_id, tx);
    conn.send_frame(&Frame::connected(state.heart_beat))?;
    let active = {
        let mut registry = state.connections.lock().await;
        registry.insert(conn_id, conn.clone());
        registry.len()
    };
    if let Some(metrics) = &state.metrics {
        metrics.record_connection(active as i64);
    }
    tracing::info!(send_every = ?negotiated.send_every, "Client connected");

    let mut send_task = tokio::spawn(send_loop(sink, rx, negotiated.send_every));
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut closing = false;
        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    tracing::debug!("Connection closed by client");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket error");
                    recv_state.record_error("websocket");
                    break;
                }
            };
            if closing {
                continue;
            }

            let result = match frame::decode(&text) {
                Ok(Decoded::HeartBeat) => continue,
                Ok(Decoded::Frame(frame)) => handle_frame(&recv_state, &conn, frame).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => closing = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Closing connection after bad frame");
                    recv_state.record_error(e.kind());
                    let _ = conn.send_frame(&Frame::error(&e.to_string()));
                    let _ = conn.close();
                    closing = true;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let active = {
        let mut registry = state.connections.lock().await;
        registry.remove(&conn_id);
        registry.len()
    };
    let removed = state.subscriptions.remove_connection(conn_id).await;
    if let Some(metrics) = &state.metrics {
        metrics.record_disconnection(active as i64);
    }
    tracing::info!(subscriptions = removed, "Connection cleaned up");
    Ok(())
}

enum Flow {
    Continue,
    /// A close was queued; ignore anything else the client sends
    Close,
}

async fn handle_frame(state: &BrokerState, conn: &Connection, frame: Frame) -> Result<Flow> {
    let flow = match frame.command {
        Command::Subscribe => {
            let id = frame.require("id")?;
            let destination = frame.require("destination")?;
            state.subscriptions.subscribe(conn.id, id, destination).await;
            state.record_subscribers(destination).await;
            tracing::debug!(id, destination, "Subscribed");
            Flow::Continue
        }
        Command::Unsubscribe => {
            let id = frame.require("id")?;
            match state.subscriptions.unsubscribe(conn.id, id).await {
                Some(topic) => {
                    state.record_subscribers(&topic).await;
                    tracing::debug!(id, topic = %topic, "Unsubscribed");
                }
                None => tracing::debug!(id, "Unsubscribe for unknown id"),
            }
            Flow::Continue
        }
        Command::Send => {
            let destination = frame.require("destination")?;
            state.route(destination, &frame.body).await;
            Flow::Continue
        }
        Command::Ack | Command::Nack => Flow::Continue,
        Command::Disconnect => Flow::Close,
        Command::Connect | Command::Stomp => {
            return Err(Error::Protocol("already connected".to_string()))
        }
        other => return Err(Error::Protocol(format!("{other} is not a client frame"))),
    };

    if let Some(receipt) = frame.get("receipt") {
        conn.send_frame(&Frame::receipt(receipt))?;
    }
    if matches!(flow, Flow::Close) {
        tracing::debug!("Client sent DISCONNECT");
        conn.close()?;
    }
    Ok(flow)
}

/// First frame from the client, skipping heart-beats
async fn next_frame(source: &mut WsSource) -> Result<Option<Frame>> {
    while let Some(message) = source.next().await {
        let text = match message.map_err(|e| Error::WebSocket(e.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        if let Decoded::Frame(frame) = frame::decode(&text)? {
            return Ok(Some(frame));
        }
    }
    Ok(None)
}

/// Answer a handshake with `ERROR` and close
async fn refuse(sink: &mut WsSink, message: &str) {
    let _ = sink
        .send(Message::Text(frame::encode(&Frame::error(message))))
        .await;
    let _ = sink.close().await;
}

async fn send_loop(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Message>,
    heartbeat_every: Option<Duration>,
) {
    let mut heartbeat = heartbeat_every.map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = async {
                match heartbeat.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => Message::Text("\n".to_string()),
        };
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "Error sending message");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
