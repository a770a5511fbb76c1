//! A single client connection: bounded outbound queue plus lifecycle state.
//!
//! The transport halves themselves live in the supervisor's read and write
//! tasks; this type is the shared handle the rest of the relay talks to.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::SendError;
use crate::protocol::OutboundFrame;
use crate::types::*;

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    tx: mpsc::Sender<OutboundFrame>,
    capacity: usize,
    /// Back-reference only. Written exclusively by the room registry while it
    /// holds its own lock.
    rooms: Mutex<BTreeSet<RoomId>>,
    cancel: CancellationToken,
    protocol_errors: AtomicU32,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    ///
    /// Returns the receiving end of the outbound queue, which belongs to the
    /// connection's writer task. `cancel` fires when the connection closes;
    /// pass a child of the server token so shutdown reaches every connection.
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        cancel: CancellationToken,
        peer: Option<SocketAddr>,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let now = Instant::now();
        let conn = Self {
            id,
            peer,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: Mutex::new(None),
            tx,
            capacity,
            rooms: Mutex::new(BTreeSet::new()),
            cancel,
            protocol_errors: AtomicU32::new(0),
            last_seen: Mutex::new(now),
            connected_at: now,
        };
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Handshake finished. Returns false if the connection was closed first.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Append a frame to the outbound queue without waiting.
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if !self.state().is_accepting() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Encode and enqueue a message addressed to this connection only
    pub fn send<M: Serialize + ?Sized>(&self, msg: &M) -> Result<(), SendError> {
        let frame = serde_json::to_string(msg).map_err(|e| {
            tracing::error!(connection_id = %self.id, "Failed to encode message: {}", e);
            SendError::Encode
        })?;
        self.enqueue(OutboundFrame::from(frame))
    }

    /// Begin closing. The writer flushes what is queued and then terminates.
    ///
    /// Returns true for the call that performed the transition; later calls
    /// are no-ops and keep the first reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut slot = self.close_reason.lock();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).is_accepting() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *slot = Some(reason);
        drop(slot);

        tracing::debug!(connection_id = %self.id, %reason, "Connection closing");
        self.cancel.cancel();
        true
    }

    /// Terminal transition once both loops have finished
    pub fn mark_closed(&self) {
        if self.state().is_accepting() {
            self.close(CloseReason::Requested);
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the connection starts closing or the server shuts down
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Rooms this connection currently belongs to
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    pub(crate) fn add_room(&self, room: &RoomId) -> bool {
        self.rooms.lock().insert(room.clone())
    }

    pub(crate) fn remove_room(&self, room: &RoomId) -> bool {
        self.rooms.lock().remove(room)
    }

    pub(crate) fn has_room(&self, room: &RoomId) -> bool {
        self.rooms.lock().contains(room)
    }

    pub(crate) fn take_rooms(&self) -> BTreeSet<RoomId> {
        std::mem::take(&mut *self.rooms.lock())
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Count one more malformed frame; returns the running total
    pub fn record_protocol_error(&self) -> u32 {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Frames currently waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}
