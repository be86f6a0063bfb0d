//! STOMP 1.2 frame model and codec
//!
//! Frames travel as WebSocket text messages, one frame per message. This
//! module turns [`Frame`] values into wire text and back.
//!
//! # Wire Format
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! `^@` is the NUL octet. A message made only of end-of-line characters is a
//! heart-beat and decodes to [`Decoded::HeartBeat`].
//!
//! # Header Escaping
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `\c`) on every frame
//! except `CONNECT` and `CONNECTED`, which STOMP 1.2 leaves raw for
//! compatibility with 1.0 peers.
//!
//! # Examples
//!
//! ```rust
//! use tablecast_core::frame::{self, Command, Decoded, Frame};
//!
//! let frame = Frame::send("/topic/orders", r#"{"action":"created"}"#);
//! let text = frame::encode(&frame);
//!
//! match frame::decode(&text).unwrap() {
//!     Decoded::Frame(decoded) => {
//!         assert_eq!(decoded.command, Command::Send);
//!         assert_eq!(decoded.get("destination"), Some("/topic/orders"));
//!     }
//!     Decoded::HeartBeat => unreachable!(),
//! }
//! ```

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Protocol version advertised in `accept-version` and `version`
pub const STOMP_VERSION: &str = "1.2";

/// STOMP frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Parse a wire command name
    pub fn parse(name: &str) -> Option<Self> {
        let command = match name {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    /// `CONNECT`, `STOMP` and `CONNECTED` carry unescaped headers
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order; repeated names are kept, the first one wins
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header value (first occurrence)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Look up a header that must be present
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            Error::Protocol(format!("{} frame missing '{}' header", self.command, name))
        })
    }

    /// Client `CONNECT` frame
    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", heart_beat.to_header())
    }

    /// Server `CONNECTED` frame
    pub fn connected(heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connected)
            .header("version", STOMP_VERSION)
            .header("heart-beat", heart_beat.to_header())
    }

    /// Client `SUBSCRIBE` frame
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// Client `UNSUBSCRIBE` frame
    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    /// Client `SEND` frame carrying a JSON body
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    /// Client `DISCONNECT` frame
    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Frame::new(Command::Disconnect);
        match receipt {
            Some(id) => frame.header("receipt", id),
            None => frame,
        }
    }

    /// Server `MESSAGE` frame
    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", subscription)
            .header("message-id", message_id)
            .header("content-type", "application/json")
            .with_body(body)
    }

    /// Server `RECEIPT` frame
    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header("receipt-id", receipt_id)
    }

    /// Server `ERROR` frame
    pub fn error(message: &str) -> Self {
        Frame::new(Command::Error).header("message", message)
    }
}

/// Result of decoding one WebSocket text message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// End-of-line only keep-alive
    HeartBeat,
}

/// The `heart-beat` header value: `outgoing,incoming` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Smallest interval at which the sender can emit heart-beats (0 = never)
    pub outgoing_ms: u64,
    /// Desired interval between received heart-beats (0 = none wanted)
    pub incoming_ms: u64,
}

/// Effective heart-beat intervals after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// How often we must send a heart-beat
    pub send_every: Option<Duration>,
    /// How often the peer promised to send one
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parse a `heart-beat` header value such as `"4000,4000"`
    pub fn parse(value: &str) -> Result<Self> {
        let (outgoing, incoming) = value
            .split_once(',')
            .ok_or_else(|| Error::Protocol(format!("invalid heart-beat header: {value}")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("invalid heart-beat header: {value}")))
        };
        Ok(Self::new(parse(outgoing)?, parse(incoming)?))
    }

    pub fn to_header(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Combine our settings with what the peer advertised
    ///
    /// Each direction uses the larger of the two intervals and is disabled
    /// when either side says 0.
    pub fn negotiate(local: HeartBeat, remote: HeartBeat) -> Negotiated {
        let pick = |a: u64, b: u64| {
            if a == 0 || b == 0 {
                None
            } else {
                Some(Duration::from_millis(a.max(b)))
            }
        };
        Negotiated {
            send_every: pick(local.outgoing_ms, remote.incoming_ms),
            expect_every: pick(local.incoming_ms, remote.outgoing_ms),
        }
    }
}

/// Encode a frame to wire text
pub fn encode(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        if escape {
            out.push_str(&escape_header(name));
            out.push(':');
            out.push_str(&escape_header(value));
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    if !frame.body.is_empty() && frame.get("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode one WebSocket text message
pub fn decode(data: &str) -> Result<Decoded> {
    let data = data.trim_start_matches(['\n', '\r']);
    if data.is_empty() {
        return Ok(Decoded::HeartBeat);
    }

    let (command_line, mut rest) =
        next_line(data).ok_or_else(|| Error::Protocol("frame has no command line".into()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| Error::Protocol(format!("unknown command: {command_line}")))?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, after) = next_line(rest)
            .ok_or_else(|| Error::Protocol("unterminated header block".into()))?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("header without ':' separator: {line}")))?;
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .parse::<usize>()
                .map_err(|_| Error::Protocol(format!("invalid content-length: {value}")))
        })
        .transpose()?;

    let body = match content_length {
        Some(len) => {
            let body = rest
                .get(..len)
                .ok_or_else(|| Error::Protocol("body shorter than content-length".into()))?;
            if !rest[len..].starts_with('\0') {
                return Err(Error::Protocol("frame not NUL-terminated".into()));
            }
            body
        }
        None => {
            let end = rest
                .find('\0')
                .ok_or_else(|| Error::Protocol("frame not NUL-terminated".into()))?;
            &rest[..end]
        }
    };

    Ok(Decoded::Frame(Frame {
        command,
        headers,
        body: body.to_string(),
    }))
}

/// Split off one line, accepting both LF and CRLF
fn next_line(data: &str) -> Option<(&str, &str)> {
    let idx = data.find('\n')?;
    let line = &data[..idx];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &data[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(Error::Protocol(format!("undefined escape sequence: \\{other}")))
            }
            None => return Err(Error::Protocol("dangling escape at end of header".into())),
        }
    }
    Ok(out)
}
