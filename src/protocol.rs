//! Pub/sub bus wire format.
//!
//! Two layers travel over the socket:
//!
//! - **Envelope** (bus control plane): `{"action": ..., "topic": ..., "message": ...}`.
//!   The client sends `subscribe` and `publish`; the bus answers with
//!   `subscribed` and may send other informational actions.
//! - **Application message**: the payload members exchange. Outbound it is
//!   serialized to a string and carried in the `message` field of a
//!   `publish` envelope; inbound the bus delivers it as a bare JSON object
//!   with no `action` field.
//!
//! ```text
//! → {"action":"subscribe","topic":"room1"}
//! ← {"action":"subscribed","topic":"room1","message":"success"}
//! → {"action":"publish","topic":"room1","message":"{\"type\":\"SET_VALUE\",\"key\":\"x\",\"value\":\"1\"}"}
//! ← {"type":"SET_VALUE","key":"x","value":"1"}
//! ```

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope `message` value the bus uses to acknowledge a subscription.
pub const SUBSCRIBE_SUCCESS: &str = "success";

/// Error decoding an inbound frame.
#[derive(Debug)]
pub struct DecodeError(String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Malformed message: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// An event broadcast on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Event type chosen by the sender.
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub event_type: String,
    /// Free-form event payload.
    #[serde(default, deserialize_with = "lenient_string")]
    pub data: String,
}

impl ChannelEvent {
    /// Build an event from its parts.
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }
}

/// Client → bus commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum BusCommand {
    /// Join a topic.
    Subscribe {
        /// Topic (channel name).
        topic: String,
    },
    /// Send an application message to every subscriber of a topic.
    Publish {
        /// Topic (channel name).
        topic: String,
        /// Serialized application message.
        message: String,
    },
}

impl BusCommand {
    /// Subscribe request for `topic`.
    pub fn subscribe(topic: &str) -> Self {
        Self::Subscribe {
            topic: topic.to_string(),
        }
    }

    /// Publish `message` on `topic`.
    ///
    /// # Errors
    ///
    /// Fails only if the application message cannot be serialized.
    pub fn publish(topic: &str, message: &AppMessage) -> serde_json::Result<Self> {
        Ok(Self::Publish {
            topic: topic.to_string(),
            message: message.encode()?,
        })
    }

    /// Serialize to the wire text.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A bus control-plane envelope (any inbound frame with an `action`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlMessage {
    /// Bus action, e.g. `subscribed`.
    pub action: String,
    /// Topic the action refers to, if any.
    #[serde(default)]
    pub topic: Option<String>,
    /// Action detail (`"success"` for a subscription acknowledgment).
    #[serde(default)]
    pub message: Option<Value>,
}

impl ControlMessage {
    /// The `message` field as display text.
    pub fn message_text(&self) -> String {
        match &self.message {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Whether this acknowledges a subscription to `topic`.
    ///
    /// Returns `Some(true)` for a successful ack, `Some(false)` for a
    /// `subscribed` action on `topic` that reports anything other than
    /// success, and `None` when the message is unrelated to `topic`.
    pub fn subscription_result(&self, topic: &str) -> Option<bool> {
        if self.action != "subscribed" || self.topic.as_deref() != Some(topic) {
            return None;
        }
        Some(self.message_text() == SUBSCRIBE_SUCCESS)
    }
}

/// Application message exchanged between channel members.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// Shared key/value update.
    SetValue {
        /// Key being set.
        key: String,
        /// New value.
        value: String,
    },
    /// Broadcast event.
    Event(ChannelEvent),
    /// A message type this client does not understand, kept as-is.
    Unknown {
        /// The `type` discriminator (empty when missing).
        kind: String,
        /// Raw message body.
        payload: Value,
    },
}

/// Wire shape of the known application messages.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum KnownAppMessage {
    #[serde(rename = "SET_VALUE")]
    SetValue {
        #[serde(deserialize_with = "lenient_string")]
        key: String,
        #[serde(default, deserialize_with = "lenient_string")]
        value: String,
    },
    #[serde(rename = "EVENT")]
    Event { data: ChannelEvent },
}

impl AppMessage {
    /// Discriminator for a `SET_VALUE` message.
    pub const SET_VALUE: &'static str = "SET_VALUE";
    /// Discriminator for an `EVENT` message.
    pub const EVENT: &'static str = "EVENT";

    /// Decode an application message from a parsed JSON object.
    ///
    /// # Errors
    ///
    /// Fails when a known `type` carries fields of the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            Self::SET_VALUE | Self::EVENT => {
                Ok(match serde_json::from_value::<KnownAppMessage>(value)? {
                    KnownAppMessage::SetValue { key, value } => Self::SetValue { key, value },
                    KnownAppMessage::Event { data } => Self::Event(data),
                })
            }
            _ => Ok(Self::Unknown {
                kind,
                payload: value,
            }),
        }
    }

    /// Serialize to the text carried in a `publish` envelope.
    pub fn encode(&self) -> serde_json::Result<String> {
        let value = match self {
            Self::SetValue { key, value } => serde_json::json!({
                "type": Self::SET_VALUE,
                "key": key,
                "value": value,
            }),
            Self::Event(event) => serde_json::json!({
                "type": Self::EVENT,
                "data": event,
            }),
            Self::Unknown { payload, .. } => payload.clone(),
        };
        serde_json::to_string(&value)
    }
}

/// An inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Bus control-plane traffic.
    Control(ControlMessage),
    /// Application traffic from a channel member.
    Application(AppMessage),
}

impl InboundFrame {
    /// Parse one inbound text frame.
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON, a non-object frame, or a known message with a
    /// malformed body.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(DecodeError(format!("expected a JSON object, got {value}")));
        }
        if value.get("action").is_some_and(|a| !a.is_null()) {
            return Ok(Self::Control(serde_json::from_value(value)?));
        }
        Ok(Self::Application(AppMessage::from_value(value)?))
    }
}

/// Accept any JSON scalar where a string is expected.
///
/// Other publishers may send numbers or booleans for values; they are kept as
/// their JSON text rather than rejecting the whole message.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
