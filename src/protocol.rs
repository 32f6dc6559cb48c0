//! Wire protocol types.
//!
//! Every frame is a JSON text message of the form
//! `{"event": <name>, "data": <value>}` in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::rate_limit::EventKind;

/// A frame received from a client, before any inspection of `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    pub fn kind(&self) -> EventKind {
        EventKind::from_event_name(&self.event)
    }
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered(RegisteredAck),
    MessageSent(MessageSentAck),
    /// A payload routed from another client, forwarded verbatim.
    Message(Value),
    Error { message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Registered(_) => "registered",
            ServerEvent::MessageSent(_) => "message_sent",
            ServerEvent::Message(_) => "message",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredAck {
    pub success: bool,
    pub message: String,
}

impl RegisteredAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSentAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageSentAck {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
