//! Error taxonomy for the relay.
//!
//! Everything here except [`RegistryInvariantViolation`] is scoped to a single
//! connection and never propagates past it.

use crate::protocol::ErrorCode;
use crate::types::{ConnectionId, RoomId};
use std::net::SocketAddr;

/// Failure to place a frame on a connection's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    QueueFull,

    #[error("connection is closed")]
    Closed,

    #[error("message could not be encoded")]
    Encode,
}

/// A malformed or unacceptable inbound frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    Parse(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid room name: {0}")]
    InvalidRoom(String),
}

impl ProtocolError {
    /// Wire code reported to the offending client
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Parse(_) => ErrorCode::ParseError,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
            ProtocolError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            ProtocolError::InvalidRoom(_) => ErrorCode::InvalidRoom,
        }
    }
}

/// Read or write failure on the underlying transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line codec error: {0}")]
    Codec(#[from] tokio_util::codec::AnyDelimiterCodecError),

    #[error("Transport closed")]
    Closed,
}

/// Internal bug class: registry state that must be impossible to reach.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryInvariantViolation {
    #[error("room {0} has no members but is still registered")]
    EmptyRoom(RoomId),

    #[error("room {room} lists unknown connection {connection}")]
    UnknownMember {
        connection: ConnectionId,
        room: RoomId,
    },

    #[error("connection {connection} lists room {room} which does not contain it")]
    StaleBackReference {
        connection: ConnectionId,
        room: RoomId,
    },

    #[error("room {room} contains connection {connection} which does not list it")]
    MissingBackReference {
        connection: ConnectionId,
        room: RoomId,
    },
}

/// Failures while bringing the server up
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}
