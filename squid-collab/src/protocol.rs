//! Event protocol spoken over the WebSocket.
//!
//! Every frame is a JSON text message:
//! ```text
//! { "type": "COLUMN_UPDATED", "message": "column moved", "payload": [...] }
//! ```
//!
//! `PING` / `PONG` are liveness, `UNDEFINED` answers anything the server does
//! not understand. All other types announce a committed mutation; their
//! payload is the canonical post-mutation state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Ping,
    Pong,
    Undefined,
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    ColumnCreated,
    ColumnUpdated,
    ColumnDeleted,
    RowCreated,
    RowUpdated,
    RowDeleted,
    LabelCreated,
    LabelUpdated,
    LabelDeleted,
    CommentSectionUpdated,
    CommentCreated,
    CommentDeleted,
    ChecklistCreated,
    ChecklistDeleted,
    PointCreated,
    PointUpdated,
    PointDeleted,
}

/// One event frame. Immutable once built; broadcast verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            message: message.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(EventType::Ping, "ping", serde_json::Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(EventType::Pong, "pong", serde_json::Value::Null)
    }

    pub fn undefined() -> Self {
        Self::new(EventType::Undefined, "undefined event", serde_json::Value::Null)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON frame. Unknown `type` strings are a decode error.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
