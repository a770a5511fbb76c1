use crate::error::ProtocolError;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Protocol version announced in the welcome frame
pub const PROTOCOL_VERSION: &str = "1.0";

/// Inbound `type` tags the dispatcher understands
const CLIENT_TYPES: &[&str] = &["join", "leave", "broadcast-request", "echo-request"];

/// An encoded outbound frame. Shared between all recipients of a broadcast.
pub type OutboundFrame = Arc<str>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        room: RoomId,
    },
    Leave {
        room: RoomId,
    },
    BroadcastRequest {
        room: RoomId,
        #[serde(default)]
        data: Value,
        /// Skip delivery back to the sender (defaults to self-echo)
        #[serde(default, rename = "excludeSender")]
        exclude_sender: bool,
    },
    /// Liveness probe; bypasses rooms and replies to the sender only
    EchoRequest {
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Sent once when a connection opens
    ServerLesson {
        connection_id: ConnectionId,
        message: String,
        protocol: String,
    },
    Echo {
        data: Value,
        echo: String,
        timestamp: String,
    },
    Broadcast {
        room: RoomId,
        from: ConnectionId,
        data: Value,
        timestamp: String,
    },
    Joined {
        room: RoomId,
        members: usize,
    },
    Left {
        room: RoomId,
        members: usize,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Machine-readable reason carried by an `error` frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    UnknownType,
    FrameTooLarge,
    InvalidRoom,
    Forbidden,
    NotInRoom,
}

impl ErrorCode {
    /// Malformed input counts toward the per-connection error budget;
    /// policy refusals do not.
    pub fn is_protocol_violation(self) -> bool {
        matches!(
            self,
            ErrorCode::ParseError
                | ErrorCode::UnknownType
                | ErrorCode::FrameTooLarge
                | ErrorCode::InvalidRoom
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::InvalidRoom => "INVALID_ROOM",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
        }
    }
}

impl ServerMessage {
    pub fn welcome(connection_id: &ConnectionId) -> Self {
        ServerMessage::ServerLesson {
            connection_id: connection_id.clone(),
            message: format!(
                "Connected as {}. Join a room to start receiving broadcasts.",
                connection_id
            ),
            protocol: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn echo(data: Value) -> Self {
        let shown = match &data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        ServerMessage::Echo {
            echo: format!("You sent: \"{}\"", shown),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn broadcast(room: RoomId, from: ConnectionId, data: Value) -> Self {
        ServerMessage::Broadcast {
            room,
            from,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize once into a frame that can be cloned cheaply per recipient
    pub fn encode(&self) -> Result<OutboundFrame, serde_json::Error> {
        serde_json::to_string(self).map(OutboundFrame::from)
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(err: &ProtocolError) -> Self {
        ServerMessage::error(err.code(), err.to_string())
    }
}

/// Decode one inbound text frame.
///
/// Distinguishes frames that are not a JSON object with a string `type`
/// (`Parse`) from well-formed envelopes naming a kind we do not handle
/// (`UnknownType`).
pub fn decode_frame(text: &str, max_bytes: usize) -> Result<ClientMessage, ProtocolError> {
    if text.len() > max_bytes {
        return Err(ProtocolError::FrameTooLarge {
            len: text.len(),
            max: max_bytes,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Parse("missing string field `type`".to_string()))?;

    if !CLIENT_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Parse(e.to_string()))
}

/// Room names are non-empty, bounded, and free of control characters
pub fn validate_room(room: &str, max_len: usize) -> Result<(), ProtocolError> {
    if room.trim().is_empty() {
        return Err(ProtocolError::InvalidRoom("room name is empty".to_string()));
    }
    if room.chars().count() > max_len {
        return Err(ProtocolError::InvalidRoom(format!(
            "room name longer than {} characters",
            max_len
        )));
    }
    if room.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidRoom(
            "room name contains control characters".to_string(),
        ));
    }
    Ok(())
}
