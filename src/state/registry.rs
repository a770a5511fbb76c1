//! Room membership.
//!
//! One lock guards both the room table and the connection table, so a
//! membership snapshot can never observe a half-applied join or leave. The
//! connection back-references are only written while that lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::connection::Connection;
use crate::error::RegistryInvariantViolation;
use crate::telemetry;
use crate::types::*;

#[derive(Debug, Default)]
struct Room {
    members: HashSet<ConnectionId>,
}

#[derive(Debug, Default)]
struct Inner {
    rooms: HashMap<RoomId, Room>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

/// Result of a join or leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// Whether the call changed anything
    pub changed: bool,
    /// Members left in the room afterwards
    pub members: usize,
}

/// Member count of one room
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RoomSummary {
    pub room: RoomId,
    pub members: usize,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl Inner {
    fn verify(&self) -> Result<(), RegistryInvariantViolation> {
        for (room_id, room) in &self.rooms {
            if room.members.is_empty() {
                return Err(RegistryInvariantViolation::EmptyRoom(room_id.clone()));
            }
            for member in &room.members {
                let conn = self.connections.get(member).ok_or_else(|| {
                    RegistryInvariantViolation::UnknownMember {
                        connection: member.clone(),
                        room: room_id.clone(),
                    }
                })?;
                if !conn.has_room(room_id) {
                    return Err(RegistryInvariantViolation::MissingBackReference {
                        connection: member.clone(),
                        room: room_id.clone(),
                    });
                }
            }
        }
        for (conn_id, conn) in &self.connections {
            for room_id in conn.rooms() {
                let listed = self
                    .rooms
                    .get(&room_id)
                    .is_some_and(|room| room.members.contains(conn_id));
                if !listed {
                    return Err(RegistryInvariantViolation::StaleBackReference {
                        connection: conn_id.clone(),
                        room: room_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn remove_member(&mut self, conn: &Connection, room_id: &RoomId) -> Membership {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Membership {
                changed: false,
                members: 0,
            };
        };
        let changed = room.members.remove(conn.id());
        conn.remove_room(room_id);
        let members = room.members.len();
        if members == 0 {
            self.rooms.remove(room_id);
            tracing::debug!(room = %room_id, "Room emptied and removed");
        }
        Membership { changed, members }
    }

    fn publish_gauges(&self) {
        metrics::gauge!(telemetry::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        metrics::gauge!(telemetry::CONNECTIONS_OPEN).set(self.connections.len() as f64);
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a connection addressable by id
    pub async fn register(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn.id().clone(), conn);
        inner.publish_gauges();
    }

    /// Forget a connection, dropping any memberships it still holds
    pub async fn unregister(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.get(conn_id).cloned()?;
        for room_id in conn.take_rooms() {
            if let Some(room) = inner.rooms.get_mut(&room_id) {
                room.members.remove(conn_id);
                if room.members.is_empty() {
                    inner.rooms.remove(&room_id);
                }
            }
        }
        inner.connections.remove(conn_id);
        inner.publish_gauges();
        debug_assert!(inner.verify().is_ok(), "{:?}", inner.verify());
        Some(conn)
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// Returns None if the connection is not registered.
    pub async fn join(&self, conn_id: &ConnectionId, room_id: &RoomId) -> Option<Membership> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.get(conn_id).cloned()?;

        let room = inner.rooms.entry(room_id.clone()).or_default();
        let changed = room.members.insert(conn_id.clone());
        let members = room.members.len();
        conn.add_room(room_id);

        if changed {
            tracing::debug!(connection_id = %conn_id, room = %room_id, members, "Joined room");
            inner.publish_gauges();
        }
        debug_assert!(inner.verify().is_ok(), "{:?}", inner.verify());
        Some(Membership { changed, members })
    }

    /// Remove a connection from a room; the room disappears when it empties.
    pub async fn leave(&self, conn_id: &ConnectionId, room_id: &RoomId) -> Membership {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(conn_id).cloned() else {
            let members = inner.rooms.get(room_id).map_or(0, |r| r.members.len());
            return Membership {
                changed: false,
                members,
            };
        };

        let membership = inner.remove_member(&conn, room_id);
        if membership.changed {
            tracing::debug!(connection_id = %conn_id, room = %room_id, "Left room");
            inner.publish_gauges();
        }
        debug_assert!(inner.verify().is_ok(), "{:?}", inner.verify());
        membership
    }

    /// Remove a connection from every room it belongs to. Returns those rooms.
    pub async fn leave_all(&self, conn_id: &ConnectionId) -> Vec<RoomId> {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(conn_id).cloned() else {
            return Vec::new();
        };

        let rooms: Vec<RoomId> = conn.rooms();
        for room_id in &rooms {
            inner.remove_member(&conn, room_id);
        }
        if !rooms.is_empty() {
            inner.publish_gauges();
        }
        debug_assert!(inner.verify().is_ok(), "{:?}", inner.verify());
        rooms
    }

    /// Point-in-time copy of a room's member ids
    pub async fn members_of(&self, room_id: &RoomId) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// Point-in-time copy of a room's member connections, for delivery
    pub async fn targets(&self, room_id: &RoomId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub async fn is_member(&self, conn_id: &ConnectionId, room_id: &RoomId) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains(conn_id))
    }

    pub async fn contains_room(&self, room_id: &RoomId) -> bool {
        self.inner.read().await.rooms.contains_key(room_id)
    }

    pub async fn connection(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.connections.get(conn_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn room_names(&self) -> Vec<RoomId> {
        let mut names: Vec<RoomId> = self.inner.read().await.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Rooms and their sizes, sorted by name
    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<RoomSummary> = inner
            .rooms
            .iter()
            .map(|(room, r)| RoomSummary {
                room: room.clone(),
                members: r.members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }

    /// All registered connections, for shutdown and diagnostics
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    pub async fn check_invariants(&self) -> Result<(), RegistryInvariantViolation> {
        self.inner.read().await.verify()
    }
}
