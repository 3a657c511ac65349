//! Wire format for board sockets.
//!
//! Inbound frames are `{"type": ..., "payload": {...}}` text frames. Outbound
//! events always carry `type`, `payload` and an RFC 3339 `timestamp`.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::connection_manager::BoardSnapshot;

/// Close code sent when the token collaborator rejects the client
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code sent when admission control rejects the client
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent when the server is going away
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frames accepted from clients
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Free-form position/selection payload
    CursorMove(Value),
    /// Liveness only
    Ping,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CursorMove(_) => "cursor_move",
            Self::Ping => "ping",
        }
    }
}

/// Why an inbound frame was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMessage {
    #[error("Invalid message format: {0}")]
    Malformed(String),

    #[error("Invalid message format: missing type")]
    MissingType,

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Invalid payload for {0}: expected an object")]
    InvalidPayload(String),

    #[error("Binary messages are not supported")]
    Binary,
}

impl InvalidMessage {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::MissingType | Self::InvalidPayload(_) => "INVALID_MESSAGE",
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::Binary => "UNSUPPORTED_FORMAT",
        }
    }
}

/// Parse and classify one text frame.
///
/// A missing `payload` is treated as an empty object. Unknown `type` values
/// are rejected rather than dropped, so clients learn about typos.
pub fn parse(raw: &str) -> Result<InboundMessage, InvalidMessage> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| InvalidMessage::Malformed(e.to_string()))?;

    let Value::Object(mut frame) = value else {
        return Err(InvalidMessage::Malformed("expected a JSON object".to_string()));
    };

    let kind = match frame.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(InvalidMessage::Malformed("type must be a string".to_string())),
        None => return Err(InvalidMessage::MissingType),
    };

    let payload = match frame.remove("payload") {
        None => Map::new(),
        Some(Value::Object(payload)) => payload,
        Some(_) => return Err(InvalidMessage::InvalidPayload(kind)),
    };

    match kind.as_str() {
        "cursor_move" => Ok(InboundMessage::CursorMove(Value::Object(payload))),
        "ping" => Ok(InboundMessage::Ping),
        _ => Err(InvalidMessage::UnsupportedType(kind)),
    }
}

/// Outbound event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskMoved,
    UserJoined,
    UserLeft,
    CursorMove,
    ConnectionEstablished,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::TaskMoved => "task_moved",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::CursorMove => "cursor_move",
            Self::ConnectionEstablished => "connection_established",
            Self::Error => "error",
        }
    }
}

/// Event sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_established(snapshot: &BoardSnapshot) -> Self {
        Self::new(
            EventType::ConnectionEstablished,
            json!({
                "active_users": snapshot.active_users,
                "cursors": snapshot.cursors,
            }),
        )
    }

    pub fn user_joined(user_id: &str, active_users: &[String]) -> Self {
        Self::new(
            EventType::UserJoined,
            json!({ "user_id": user_id, "active_users": active_users }),
        )
    }

    pub fn user_left(user_id: &str, active_users: &[String]) -> Self {
        Self::new(
            EventType::UserLeft,
            json!({ "user_id": user_id, "active_users": active_users }),
        )
    }

    pub fn cursor_move(user_id: &str, cursor: Value) -> Self {
        Self::new(
            EventType::CursorMove,
            json!({ "user_id": user_id, "cursor": cursor }),
        )
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            json!({ "code": code.into(), "message": message.into() }),
        )
    }

    pub fn invalid_message(err: &InvalidMessage) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// Message queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Event serialized by the writer
    Event(ServerEvent),
    /// Event serialized once for a whole fan-out
    Preserialized(Utf8Bytes),
    /// Transport-level ping
    Ping,
    /// Close the socket with a code and reason, then stop writing
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Text frame body for event variants, consuming the message.
    ///
    /// A preserialized body is handed over as is; clones of it share one buffer.
    pub fn into_text(self) -> Option<Result<Utf8Bytes, serde_json::Error>> {
        match self {
            Self::Event(event) => Some(serde_json::to_string(&event).map(Utf8Bytes::from)),
            Self::Preserialized(text) => Some(Ok(text)),
            Self::Ping | Self::Close { .. } => None,
        }
    }

    /// Text body for event variants
    pub fn to_json(&self) -> Option<Result<String, serde_json::Error>> {
        match self {
            Self::Event(event) => Some(serde_json::to_string(event)),
            Self::Preserialized(text) => Some(Ok(text.as_str().to_owned())),
            Self::Ping | Self::Close { .. } => None,
        }
    }
}
