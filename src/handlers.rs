//! Inbound message dispatch
//!
//! Decodes each frame into a [`ClientMessage`], routes it to the registry or
//! the broadcast engine, and answers the sender. Malformed input is answered
//! with an `error` frame and counted against the connection.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{ProtocolError, SendError};
use crate::protocol::{decode_frame, validate_room, ClientMessage, ErrorCode, ServerMessage};
use crate::state::AppState;
use crate::telemetry;
use crate::types::CloseReason;

/// Handle one decoded client message and return the reply for the sender, if any
pub async fn handle_message(
    msg: ClientMessage,
    conn: &Arc<Connection>,
    state: &AppState,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Join { room } => {
            if let Err(e) = validate_room(&room, state.config.max_room_name) {
                return Some(ServerMessage::from(&e));
            }
            if !state.authorizer.authorize(conn.id(), &room).await {
                tracing::warn!(connection_id = %conn.id(), room = %room, "Join denied");
                return Some(ServerMessage::error(
                    ErrorCode::Forbidden,
                    format!("Not allowed to join room {}", room),
                ));
            }
            // None only when the connection already left the registry
            let membership = state.registry.join(conn.id(), &room).await?;
            Some(ServerMessage::Joined {
                room,
                members: membership.members,
            })
        }

        ClientMessage::Leave { room } => {
            if let Err(e) = validate_room(&room, state.config.max_room_name) {
                return Some(ServerMessage::from(&e));
            }
            let membership = state.registry.leave(conn.id(), &room).await;
            Some(ServerMessage::Left {
                room,
                members: membership.members,
            })
        }

        ClientMessage::BroadcastRequest {
            room,
            data,
            exclude_sender,
        } => {
            if let Err(e) = validate_room(&room, state.config.max_room_name) {
                return Some(ServerMessage::from(&e));
            }
            if !state.registry.is_member(conn.id(), &room).await {
                return Some(ServerMessage::error(
                    ErrorCode::NotInRoom,
                    format!("Join room {} before broadcasting to it", room),
                ));
            }
            state
                .broadcaster
                .broadcast(&room, conn.id(), data, exclude_sender)
                .await;
            None
        }

        ClientMessage::EchoRequest { data } => Some(ServerMessage::echo(data)),
    }
}

/// Decode, handle, and reply to one inbound text frame
pub async fn dispatch_frame(text: &str, conn: &Arc<Connection>, state: &AppState) {
    let reply = match decode_frame(text, state.config.max_frame_bytes) {
        Ok(msg) => {
            tracing::debug!(connection_id = %conn.id(), ?msg, "Inbound message");
            handle_message(msg, conn, state).await
        }
        Err(e) => {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Rejected frame");
            Some(ServerMessage::from(&e))
        }
    };

    if let Some(reply) = reply {
        respond(reply, conn, state);
    }
}

/// Binary frames are accepted when they carry UTF-8 text
pub async fn dispatch_binary(data: &[u8], conn: &Arc<Connection>, state: &AppState) {
    match std::str::from_utf8(data) {
        Ok(text) => dispatch_frame(text, conn, state).await,
        Err(_) => {
            let err = ProtocolError::Parse("binary frame is not valid UTF-8".to_string());
            tracing::warn!(connection_id = %conn.id(), error = %err, "Rejected frame");
            respond(ServerMessage::from(&err), conn, state);
        }
    }
}

fn respond(reply: ServerMessage, conn: &Arc<Connection>, state: &AppState) {
    let violation = match &reply {
        ServerMessage::Error { code, .. } if code.is_protocol_violation() => {
            metrics::counter!(telemetry::PROTOCOL_ERRORS_TOTAL, "code" => code.as_str())
                .increment(1);
            true
        }
        _ => false,
    };

    match conn.send(&reply) {
        Ok(()) => {}
        Err(SendError::QueueFull) => {
            tracing::warn!(connection_id = %conn.id(), "Reply dropped, queue full");
            conn.close(CloseReason::SlowConsumer);
        }
        Err(SendError::Closed | SendError::Encode) => {}
    }

    // The error reply is queued first so the client learns why it was dropped
    if violation {
        let count = conn.record_protocol_error();
        let max = state.config.max_protocol_errors;
        if max > 0 && count >= max {
            tracing::warn!(
                connection_id = %conn.id(),
                errors = count,
                "Too many protocol errors, closing connection"
            );
            conn.close(CloseReason::ProtocolViolation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RoomAllowlist;
    use crate::config::RelayConfig;
    use crate::protocol::OutboundFrame;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    async fn connect(state: &AppState, id: &str) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = Connection::new(id.to_string(), 16, state.shutdown.child_token(), None);
        let conn = Arc::new(conn);
        conn.mark_open();
        state.registry.register(conn.clone()).await;
        (conn, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("expected a frame")).unwrap()
    }

    fn join(room: &str) -> ClientMessage {
        ClientMessage::Join {
            room: room.to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_and_leave_acknowledged() {
        let state = AppState::default();
        let (a, _rx) = connect(&state, "a").await;

        let reply = handle_message(join("general"), &a, &state).await;
        assert_eq!(
            reply,
            Some(ServerMessage::Joined {
                room: "general".to_string(),
                members: 1
            })
        );

        let reply = handle_message(
            ClientMessage::Leave {
                room: "general".to_string(),
            },
            &a,
            &state,
        )
        .await;
        assert_eq!(
            reply,
            Some(ServerMessage::Left {
                room: "general".to_string(),
                members: 0
            })
        );
        assert_eq!(state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_denied_by_authorizer() {
        let state = AppState::default().with_authorizer(Arc::new(RoomAllowlist::new(["general"])));
        let (a, _rx) = connect(&state, "a").await;

        let reply = handle_message(join("admin"), &a, &state).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Error {
                code: ErrorCode::Forbidden,
                ..
            })
        ));
        assert!(!state.registry.contains_room(&"admin".to_string()).await);

        assert!(matches!(
            handle_message(join("general"), &a, &state).await,
            Some(ServerMessage::Joined { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_room_rejected() {
        let state = AppState::default();
        let (a, _rx) = connect(&state, "a").await;
        let reply = handle_message(join(""), &a, &state).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Error {
                code: ErrorCode::InvalidRoom,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_requires_membership() {
        let state = AppState::default();
        let (a, _rx) = connect(&state, "a").await;
        let reply = handle_message(
            ClientMessage::BroadcastRequest {
                room: "general".to_string(),
                data: json!("hi"),
                exclude_sender: false,
            },
            &a,
            &state,
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Error {
                code: ErrorCode::NotInRoom,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_has_no_direct_reply() {
        let state = AppState::default();
        let (a, mut a_rx) = connect(&state, "a").await;
        let (b, mut b_rx) = connect(&state, "b").await;
        handle_message(join("general"), &a, &state).await;
        handle_message(join("general"), &b, &state).await;

        let reply = handle_message(
            ClientMessage::BroadcastRequest {
                room: "general".to_string(),
                data: json!("hi"),
                exclude_sender: false,
            },
            &a,
            &state,
        )
        .await;
        assert!(reply.is_none());
        assert_eq!(next_json(&mut a_rx)["data"], "hi");
        assert_eq!(next_json(&mut b_rx)["from"], "a");
    }

    #[tokio::test]
    async fn test_echo_replies_to_sender() {
        let state = AppState::default();
        let (a, _rx) = connect(&state, "a").await;
        let reply = handle_message(ClientMessage::EchoRequest { data: json!("ping") }, &a, &state)
            .await
            .unwrap();
        assert!(matches!(reply, ServerMessage::Echo { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_frame_replies_with_error() {
        let state = AppState::default();
        let (a, mut rx) = connect(&state, "a").await;

        dispatch_frame("{nope", &a, &state).await;
        let err = next_json(&mut rx);
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "PARSE_ERROR");

        dispatch_frame(r#"{"type":"teleport"}"#, &a, &state).await;
        assert_eq!(next_json(&mut rx)["code"], "UNKNOWN_TYPE");

        // Still usable
        dispatch_frame(r#"{"type":"echo-request","data":"ok"}"#, &a, &state).await;
        assert_eq!(next_json(&mut rx)["type"], "echo");
        assert!(a.state().is_accepting());
    }

    #[tokio::test]
    async fn test_dispatch_binary() {
        let state = AppState::default();
        let (a, mut rx) = connect(&state, "a").await;

        dispatch_binary(br#"{"type":"echo-request","data":1}"#, &a, &state).await;
        assert_eq!(next_json(&mut rx)["type"], "echo");

        dispatch_binary(&[0xff, 0xfe], &a, &state).await;
        assert_eq!(next_json(&mut rx)["code"], "PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_protocol_error_threshold_closes() {
        let state = AppState::new(RelayConfig {
            max_protocol_errors: 3,
            ..RelayConfig::default()
        });
        let (a, mut rx) = connect(&state, "a").await;

        for _ in 0..3 {
            dispatch_frame("garbage", &a, &state).await;
        }
        assert_eq!(a.close_reason(), Some(CloseReason::ProtocolViolation));

        // All three error replies were queued before the close
        for _ in 0..3 {
            assert_eq!(next_json(&mut rx)["code"], "PARSE_ERROR");
        }
    }

    #[tokio::test]
    async fn test_policy_errors_do_not_count() {
        let state = AppState::new(RelayConfig {
            max_protocol_errors: 1,
            ..RelayConfig::default()
        });
        let (a, _rx) = connect(&state, "a").await;
        dispatch_frame(
            r#"{"type":"broadcast-request","room":"general","data":"x"}"#,
            &a,
            &state,
        )
        .await;
        assert!(a.state().is_accepting());
    }
}
