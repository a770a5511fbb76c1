//! Pluggable room authorization

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::types::{ConnectionId, RoomId};

/// Decides whether a connection may join a room.
///
/// Consulted on every join before the registry is touched. Policy lives
/// outside the relay; implementations may call out to other services.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, connection_id: &ConnectionId, room: &RoomId) -> bool;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// Every connection may join every room
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _connection_id: &ConnectionId, _room: &RoomId) -> bool {
        true
    }

    fn name(&self) -> &str {
        "allow-all"
    }
}

/// Only a fixed set of room names may be joined
#[derive(Debug, Clone)]
pub struct RoomAllowlist {
    rooms: HashSet<RoomId>,
}

impl RoomAllowlist {
    pub fn new<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomId>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Authorizer for RoomAllowlist {
    async fn authorize(&self, connection_id: &ConnectionId, room: &RoomId) -> bool {
        let allowed = self.rooms.contains(room);
        if !allowed {
            tracing::info!(connection_id = %connection_id, room = %room, "Room not in allowlist");
        }
        allowed
    }

    fn name(&self) -> &str {
        "room-allowlist"
    }
}

/// Pick the authorizer described by the config
pub fn from_config(config: &RelayConfig) -> Arc<dyn Authorizer> {
    match &config.allowed_rooms {
        Some(rooms) => {
            tracing::info!(rooms = rooms.len(), "Room allowlist enabled");
            Arc::new(RoomAllowlist::new(rooms.iter().cloned()))
        }
        None => {
            tracing::warn!("Room allowlist DISABLED - any client can join any room");
            Arc::new(AllowAll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(
            AllowAll
                .authorize(&"c1".to_string(), &"anything".to_string())
                .await
        );
    }

    #[tokio::test]
    async fn test_allowlist() {
        let auth = RoomAllowlist::new(["general", "random"]);
        assert!(auth.authorize(&"c1".to_string(), &"general".to_string()).await);
        assert!(!auth.authorize(&"c1".to_string(), &"admin".to_string()).await);
    }

    #[test]
    fn test_from_config() {
        let config = RelayConfig::default();
        assert_eq!(from_config(&config).name(), "allow-all");

        let config = RelayConfig {
            allowed_rooms: Some(vec!["general".to_string()]),
            ..RelayConfig::default()
        };
        assert_eq!(from_config(&config).name(), "room-allowlist");
    }
}
