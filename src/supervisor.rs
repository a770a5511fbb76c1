//! Connection lifecycle: adopt a transport, run its read and write loops,
//! and tear it down exactly once.

use axum::body::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use ulid::Ulid;

use crate::connection::Connection;
use crate::handlers::{dispatch_binary, dispatch_frame};
use crate::protocol::{OutboundFrame, ServerMessage};
use crate::state::AppState;
use crate::telemetry;
use crate::transport::{Frame, FrameSink, FrameStream, Transport};
use crate::types::*;

#[derive(Debug, Clone, Copy)]
struct WriterSettings {
    write_timeout: Duration,
    drain_timeout: Duration,
    ping_interval: Duration,
    idle_timeout: Duration,
    heartbeat: bool,
}

/// Drive one connection until it closes. Returns the close reason.
///
/// The welcome frame is queued before the connection becomes visible to the
/// registry, so it always precedes any broadcast.
pub async fn run_connection(transport: Transport, state: Arc<AppState>) -> CloseReason {
    let id: ConnectionId = Ulid::new().to_string();
    let span = tracing::info_span!("connection", connection_id = %id, transport = transport.kind);
    supervise(id, transport, state).instrument(span).await
}

async fn supervise(id: ConnectionId, transport: Transport, state: Arc<AppState>) -> CloseReason {
    let Transport {
        sink,
        mut stream,
        peer,
        kind,
        heartbeat,
    } = transport;

    let (conn, rx) = Connection::new(
        id,
        state.config.queue_capacity,
        state.shutdown.child_token(),
        peer,
    );
    let conn = Arc::new(conn);

    // Queue capacity is at least one, so this cannot be refused
    let _ = conn.send(&ServerMessage::welcome(conn.id()));
    conn.mark_open();
    state.registry.register(conn.clone()).await;
    counter!(telemetry::CONNECTIONS_TOTAL, "transport" => kind).increment(1);
    info!(peer = ?peer, "Connection opened");

    let settings = WriterSettings {
        write_timeout: state.config.write_timeout,
        drain_timeout: state.config.drain_timeout,
        ping_interval: state.config.ping_interval,
        idle_timeout: state.config.idle_timeout,
        heartbeat,
    };
    let mut writer =
        tokio::spawn(write_loop(conn.clone(), sink, rx, settings).in_current_span());

    let read_reason = read_loop(&conn, &mut stream, &state).await;
    drop(stream);

    conn.close(read_reason);
    let reason = conn.close_reason().unwrap_or(read_reason);

    let rooms = state.registry.leave_all(conn.id()).await;
    state.registry.unregister(conn.id()).await;

    let grace = settings.drain_timeout + settings.write_timeout;
    match timeout(grace, &mut writer).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => {
            warn!("Writer did not finish in time, aborting");
            writer.abort();
        }
    }

    conn.mark_closed();
    counter!(telemetry::DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    if reason.is_transport_failure() {
        warn!(%reason, rooms = rooms.len(), "Connection lost");
    } else {
        info!(
            %reason,
            rooms = rooms.len(),
            age_secs = conn.age().as_secs(),
            "Connection closed"
        );
    }
    reason
}

async fn read_loop(conn: &Arc<Connection>, stream: &mut FrameStream, state: &AppState) -> CloseReason {
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed() => {
                // Cancelled without a reason means the server token fired
                return conn.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Frame::Text(text))) => {
                conn.touch();
                counter!(telemetry::FRAMES_IN_TOTAL).increment(1);
                dispatch_frame(&text, conn, state).await;
            }
            Some(Ok(Frame::Binary(data))) => {
                conn.touch();
                counter!(telemetry::FRAMES_IN_TOTAL).increment(1);
                dispatch_binary(&data, conn, state).await;
            }
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => conn.touch(),
            Some(Ok(Frame::Close)) | None => return CloseReason::PeerClosed,
            Some(Err(e)) => {
                debug!(error = %e, "Read failed");
                return CloseReason::ReadError;
            }
        }
    }
}

/// Returns how many queued frames were flushed after the close, or None when
/// the flush was skipped because this writer already saw a write fail.
async fn write_loop(
    conn: Arc<Connection>,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<OutboundFrame>,
    settings: WriterSettings,
) -> Option<usize> {
    let mut ping = tokio::time::interval(settings.ping_interval.max(Duration::from_millis(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    ping.tick().await;

    // Set on our own failed write, whatever reason the connection closed with
    let mut write_failed = false;
    loop {
        tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(reason) = write_frame(&mut sink, Frame::Text(frame.to_string()), settings.write_timeout).await {
                    write_failed = true;
                    conn.close(reason);
                    break;
                }
            }
            _ = ping.tick(), if settings.heartbeat => {
                if conn.idle_for() > settings.idle_timeout {
                    warn!(idle_secs = conn.idle_for().as_secs(), "Peer idle, closing");
                    conn.close(CloseReason::IdleTimeout);
                    break;
                }
                if let Err(reason) = write_frame(&mut sink, Frame::Ping(Bytes::new()), settings.write_timeout).await {
                    write_failed = true;
                    conn.close(reason);
                    break;
                }
            }
        }
    }

    // No new frames from here on; flush what was queued before the close
    rx.close();
    let flushed = if write_failed {
        None
    } else {
        let drain = async {
            let mut flushed = 0usize;
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut sink, Frame::Text(frame.to_string()), settings.write_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
                flushed += 1;
            }
            flushed
        };
        match timeout(settings.drain_timeout, drain).await {
            Ok(0) => Some(0),
            Ok(flushed) => {
                debug!(flushed, "Flushed queued frames");
                Some(flushed)
            }
            Err(_) => {
                warn!("Drain timed out, dropping queued frames");
                Some(0)
            }
        }
    };

    let _ = timeout(settings.write_timeout, sink.close()).await;
    flushed
}

async fn write_frame(sink: &mut FrameSink, frame: Frame, limit: Duration) -> Result<(), CloseReason> {
    match timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Write failed");
            Err(CloseReason::WriteError)
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Write timed out");
            Err(CloseReason::WriteTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::error::TransportError;
    use crate::transport::MemoryPeer;
    use serde_json::{json, Value};

    fn spawn(
        state: &Arc<AppState>,
    ) -> (tokio::task::JoinHandle<CloseReason>, MemoryPeer) {
        let (transport, peer) = Transport::memory(16);
        let handle = tokio::spawn(run_connection(transport, state.clone()));
        (handle, peer)
    }

    async fn recv(peer: &mut MemoryPeer) -> Value {
        timeout(Duration::from_secs(2), peer.recv_json())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
    }

    async fn welcome(peer: &mut MemoryPeer) -> String {
        let msg = recv(peer).await;
        assert_eq!(msg["type"], "server-lesson");
        msg["connectionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_welcome_then_echo() {
        let state = Arc::new(AppState::default());
        let (handle, mut peer) = spawn(&state);

        let id = welcome(&mut peer).await;
        assert_eq!(id.len(), 26);

        peer.send_json(&json!({"type": "echo-request", "data": "ping"}))
            .await
            .unwrap();
        let echo = recv(&mut peer).await;
        assert_eq!(echo["type"], "echo");
        assert_eq!(echo["echo"], "You sent: \"ping\"");

        peer.send(Frame::Close).await.unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(state.registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_abrupt_hang_up_cleans_rooms() {
        let state = Arc::new(AppState::default());
        let (handle, mut peer) = spawn(&state);
        welcome(&mut peer).await;

        for room in ["r1", "r2"] {
            peer.send_json(&json!({"type": "join", "room": room}))
                .await
                .unwrap();
            assert_eq!(recv(&mut peer).await["type"], "joined");
        }
        assert_eq!(state.registry.room_count().await, 2);

        peer.hang_up();
        assert_eq!(handle.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(state.registry.room_count().await, 0);
        state.registry.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let state = Arc::new(AppState::default());
        let (handle, mut peer) = spawn(&state);
        welcome(&mut peer).await;

        peer.inject_error(TransportError::Closed).await.unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::ReadError);
    }

    #[tokio::test]
    async fn test_protocol_violation_flushes_errors_then_closes() {
        let state = Arc::new(AppState::new(RelayConfig {
            max_protocol_errors: 2,
            ..RelayConfig::default()
        }));
        let (handle, mut peer) = spawn(&state);
        welcome(&mut peer).await;

        peer.send_text("not json").await.unwrap();
        peer.send_text("still not json").await.unwrap();

        assert_eq!(recv(&mut peer).await["code"], "PARSE_ERROR");
        assert_eq!(recv(&mut peer).await["code"], "PARSE_ERROR");
        assert_eq!(handle.await.unwrap(), CloseReason::ProtocolViolation);
        // Sink closed after the flush
        assert!(peer.recv_json().await.is_none());
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_connection() {
        let state = Arc::new(AppState::default());
        let (handle, mut peer) = spawn(&state);
        welcome(&mut peer).await;

        state.begin_shutdown();
        assert_eq!(handle.await.unwrap(), CloseReason::Shutdown);
        assert!(state.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_idle_peer_is_closed() {
        let state = Arc::new(AppState::new(RelayConfig {
            ping_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        }));
        let (handle, mut peer) = spawn(&state);
        welcome(&mut peer).await;

        // Keep reading so pings never block the writer
        let reader = tokio::spawn(async move { while peer.recv().await.is_some() {} });
        let reason = timeout(Duration::from_secs(2), handle)
            .await
            .expect("idle connection was not closed")
            .unwrap();
        assert_eq!(reason, CloseReason::IdleTimeout);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_timeout() {
        let state = Arc::new(AppState::new(RelayConfig {
            write_timeout: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        }));
        let (transport, mut peer) = Transport::memory(1);
        let handle = tokio::spawn(run_connection(transport, state.clone()));

        // Fill the transport without ever reading it
        // Sends may fail once the connection gives up on us
        for _ in 0..8 {
            let _ = peer.send_json(&json!({"type": "echo-request"})).await;
        }
        let reason = timeout(Duration::from_secs(2), handle)
            .await
            .expect("stalled connection was not closed")
            .unwrap();
        assert_eq!(reason, CloseReason::WriteTimeout);
    }

    #[tokio::test]
    async fn test_writer_skips_drain_after_own_write_timeout() {
        let settings = WriterSettings {
            write_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            heartbeat: false,
        };
        let (conn, rx) = Connection::new("w".into(), 8, tokio_util::sync::CancellationToken::new(), None);
        let conn = Arc::new(conn);
        conn.mark_open();
        for n in 0..4 {
            conn.enqueue(format!("frame {n}").into()).unwrap();
        }

        // The peer never reads, so the third write stalls
        let (transport, _peer) = Transport::memory(1);
        let writer = tokio::spawn(write_loop(conn.clone(), transport.sink, rx, settings));

        // Someone else closes the connection while the write is stuck
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close(CloseReason::SlowConsumer);

        let flushed = timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer did not finish")
            .unwrap();
        assert_eq!(flushed, None);
        assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));
    }
}
