//! Wire envelope exchanged with control clients.
//!
//! A [`Message`] is built through one of the three factories and never mutated
//! afterwards. The `data` payload stays type-erased until the handler for its
//! action decodes it.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::error;

use crate::error::ProtocolError;

pub const ACTION_START: &str = "start";
pub const ACTION_STOP: &str = "stop";

pub const EVENT_COMPLETED: &str = "completed";
pub const EVENT_UNKNOWN_RESPONSE_ACTION: &str = "UnknownResponseAction";
pub const EVENT_UNKNOWN_EVENT: &str = "UnknownEvent";
pub const EVENT_UNKNOWN_MESSAGE_TYPE: &str = "UnknownMessageType";
pub const EVENT_INVALID_MESSAGE: &str = "InvalidMessage";
pub const EVENT_SERIALIZE_ERROR: &str = "SerializeMessageError";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    #[default]
    Unknown,
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "request" => MessageKind::Request,
            "response" => MessageKind::Response,
            "event" => MessageKind::Event,
            _ => MessageKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Empty object payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NoData {}

/// Payload of `start`, `stop` and `completed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskerRef {
    #[serde(default)]
    pub tasker_id: String,
}

impl TaskerRef {
    pub fn new(tasker_id: impl Into<String>) -> Self {
        Self {
            tasker_id: tasker_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Box<RawValue>>,
    #[serde(default = "Utc::now")]
    time: DateTime<Utc>,
}

impl Message {
    pub fn request(action: impl Into<String>, data: &impl Serialize) -> Self {
        Self::build(MessageKind::Request, data, |msg| msg.action = action.into())
    }

    pub fn response(
        action: impl Into<String>,
        status: Status,
        message: impl Into<String>,
        data: &impl Serialize,
    ) -> Self {
        Self::build(MessageKind::Response, data, |msg| {
            msg.action = action.into();
            msg.status = Some(status);
            msg.message = message.into();
        })
    }

    pub fn event(event: impl Into<String>, message: impl Into<String>, data: &impl Serialize) -> Self {
        Self::build(MessageKind::Event, data, |msg| {
            msg.event = event.into();
            msg.message = message.into();
        })
    }

    pub fn success(action: impl Into<String>) -> Self {
        Self::response(action, Status::Success, "Success", &NoData {})
    }

    pub fn failure(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::response(action, Status::Error, message, &NoData {})
    }

    fn build(kind: MessageKind, data: &impl Serialize, fill: impl FnOnce(&mut Message)) -> Self {
        let data = match serde_json::value::to_raw_value(data) {
            Ok(raw) => Some(raw),
            Err(err) => {
                error!(error = %err, kind = ?kind, "failed to serialize message data");
                None
            }
        };
        let mut msg = Message {
            kind,
            action: String::new(),
            event: String::new(),
            status: None,
            message: String::new(),
            data,
            time: Utc::now(),
        };
        fill(&mut msg);
        msg
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes for the wire. Encoding failures degrade to a
    /// `SerializeMessageError` event instead of surfacing to the caller.
    pub fn to_bytes(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to serialize message");
                let fallback = Message::event(EVENT_SERIALIZE_ERROR, err.to_string(), &NoData {});
                serde_json::to_vec(&fallback).unwrap_or_default()
            }
        }
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let raw = self.data.as_deref().map(RawValue::get).unwrap_or("{}");
        Ok(serde_json::from_str(raw)?)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn event_name(&self) -> &str {
        &self.event
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn raw_data(&self) -> Option<&str> {
        self.data.as_deref().map(RawValue::get)
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}
