//! Message envelope handed to subscription handlers
//!
//! Handlers receive the raw `MESSAGE` frame wrapped in a [`MessageEnvelope`].
//! The body is a JSON document whose shape depends on the destination. Use
//! [`MessageEnvelope::json`] to decode it into one of the payloads in
//! [`crate::events`].

use crate::error::{Error, Result};
use crate::frame::{Command, Frame};
use serde::de::DeserializeOwned;

/// A message delivered on a subscribed destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub destination: String,
    /// Id of the subscription this delivery belongs to
    pub subscription: String,
    pub message_id: String,
    /// All frame headers, in wire order
    pub headers: Vec<(String, String)>,
    /// JSON text
    pub body: String,
}

impl MessageEnvelope {
    /// Build an envelope directly, mostly useful in tests
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subscription: String::new(),
            message_id: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Convert a `MESSAGE` frame
    pub fn from_frame(frame: Frame) -> Result<Self> {
        if frame.command != Command::Message {
            return Err(Error::Protocol(format!(
                "expected MESSAGE frame, got {}",
                frame.command
            )));
        }
        let destination = frame.require("destination")?.to_string();
        let subscription = frame.require("subscription")?.to_string();
        let message_id = frame.get("message-id").unwrap_or_default().to_string();
        Ok(Self {
            destination,
            subscription,
            message_id,
            headers: frame.headers,
            body: frame.body,
        })
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Decode the JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_from_message_frame() {
        let frame = Frame::message("/topic/orders", "sub-3", "42", r#"{"action":"deleted"}"#);
        let envelope = MessageEnvelope::from_frame(frame).unwrap();
        assert_eq!(envelope.destination, "/topic/orders");
        assert_eq!(envelope.subscription, "sub-3");
        assert_eq!(envelope.message_id, "42");
        assert_eq!(envelope.header("content-type"), Some("application/json"));

        let value: Value = envelope.json().unwrap();
        assert_eq!(value["action"], "deleted");
    }

    #[test]
    fn test_rejects_other_commands() {
        let frame = Frame::receipt("r-1");
        assert!(matches!(
            MessageEnvelope::from_frame(frame),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_missing_subscription_header() {
        let frame = Frame::new(Command::Message).header("destination", "/topic/a");
        assert!(MessageEnvelope::from_frame(frame).is_err());
    }

    #[test]
    fn test_invalid_json_body() {
        let envelope = MessageEnvelope::new("/topic/tables", "not json");
        assert!(matches!(
            envelope.json::<Value>(),
            Err(Error::Serialization(_))
        ));
    }
}
