use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type ConnectionId = String;
pub type RoomId = String;

/// Lifecycle of a single connection.
///
/// Transitions only move forward: `Connecting -> Open -> Closing -> Closed`.
/// `Connecting` may also jump straight to `Closing` when the handshake fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection still accepts outbound frames
    pub fn is_accepting(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// Why a connection left the `Open` state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended cleanly
    PeerClosed,
    /// Reading from the transport failed
    ReadError,
    /// Writing to the transport failed
    WriteError,
    /// A write did not complete within the configured timeout
    WriteTimeout,
    /// Outbound queue was saturated by a broadcast
    SlowConsumer,
    /// Too many malformed frames
    ProtocolViolation,
    /// No inbound traffic within the idle timeout
    IdleTimeout,
    /// Server is shutting down
    Shutdown,
    /// Closed by the application
    Requested,
}

impl CloseReason {
    /// Stable label for metrics
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Requested => "requested",
        }
    }

    /// Whether the transport itself is known to be unusable
    pub fn is_transport_failure(self) -> bool {
        matches!(
            self,
            CloseReason::ReadError | CloseReason::WriteError | CloseReason::WriteTimeout
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::WriteError => "write error",
            CloseReason::WriteTimeout => "write timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "server shutdown",
            CloseReason::Requested => "requested",
        };
        f.write_str(s)
    }
}

/// Point-in-time counters exposed to the observability sink
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub connections_open: usize,
    pub rooms_active: usize,
    pub broadcast_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_only_live_states_accept_frames() {
        assert!(ConnectionState::Connecting.is_accepting());
        assert!(ConnectionState::Open.is_accepting());
        assert!(!ConnectionState::Closing.is_accepting());
        assert!(!ConnectionState::Closed.is_accepting());
    }

    #[test]
    fn test_close_reason_labels_match_serde() {
        for reason in [
            CloseReason::PeerClosed,
            CloseReason::SlowConsumer,
            CloseReason::WriteTimeout,
            CloseReason::Shutdown,
        ] {
            assert_eq!(serde_json::to_value(reason).unwrap(), reason.as_str());
        }
        assert!(CloseReason::WriteError.is_transport_failure());
        assert!(!CloseReason::SlowConsumer.is_transport_failure());
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let stats = RelayStats {
            connections_open: 2,
            rooms_active: 1,
            broadcast_failures: 3,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["connectionsOpen"], 2);
        assert_eq!(json["roomsActive"], 1);
        assert_eq!(json["broadcastFailures"], 3);
    }
}
