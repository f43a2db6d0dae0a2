//! Room keys and the room manager for Parley.
//!
//! A room is a broadcast group for one private pair or one chat group.
//! Rooms are created lazily on first join and removed when the last
//! subscriber leaves; the subscriber map is the only state they carry.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use super::events::ServerEvent;

/// Key identifying a logical conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    /// Private pair room, keyed by the sorted participant pair.
    Private(String),
    /// Group room, keyed by group id.
    Group(String),
}

impl RoomKey {
    /// Key for a private conversation between two users.
    ///
    /// The pair is sorted so both directions map to the same room.
    pub fn private(user_a: &str, user_b: &str) -> Self {
        let (lo, hi) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        RoomKey::Private(format!("{lo}_{hi}"))
    }

    /// Key for a group room.
    pub fn group(group_id: &str) -> Self {
        RoomKey::Group(group_id.to_string())
    }

    /// The group id, if this is a group room.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            RoomKey::Group(id) => Some(id),
            RoomKey::Private(_) => None,
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomKey::Private(key) => write!(f, "{key}"),
            RoomKey::Group(id) => write!(f, "group_{id}"),
        }
    }
}

/// A room subscriber: the user behind a session and its outbound channel.
#[derive(Debug, Clone)]
pub struct RoomMember {
    /// User id the session registered with.
    pub user_id: String,
    /// Outbound event channel for the session.
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Manager for room subscriptions.
///
/// The room map is the shared mutable routing state; every mutation takes
/// the write lock, and fan-out reads take a snapshot under the read lock so
/// delivery never observes a half-applied join or leave.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomKey, HashMap<String, RoomMember>>>,
}

impl RoomManager {
    /// Create a new room manager.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe a session to a room, creating the room if needed.
    pub async fn join(&self, key: RoomKey, session_id: &str, member: RoomMember) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(key)
            .or_default()
            .insert(session_id.to_string(), member);
    }

    /// Unsubscribe a session from a room.
    ///
    /// Returns true if the session was subscribed. Empty rooms are removed.
    pub async fn leave(&self, key: &RoomKey, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(key) else {
            return false;
        };
        let removed = members.remove(session_id).is_some();
        if members.is_empty() {
            rooms.remove(key);
        }
        removed
    }

    /// Snapshot of a room's members as (session id, member) pairs.
    pub async fn members_of(&self, key: &RoomKey) -> Vec<(String, RoomMember)> {
        let rooms = self.rooms.read().await;
        rooms
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .map(|(sid, member)| (sid.clone(), member.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of sessions subscribed to a room.
    pub async fn member_count(&self, key: &RoomKey) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(key).map_or(0, HashMap::len)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
