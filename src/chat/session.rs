//! Session registry for Parley.
//!
//! One session per live connection. The identity is learned from the first
//! join event, and the current room is an explicit single-slot field: a
//! connection receives live pushes for at most one conversation at a time,
//! which is a product constraint, not an accident of join ordering.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use super::events::ServerEvent;
use super::room::RoomKey;

/// State for one live connection.
#[derive(Debug)]
pub struct Session {
    /// Session identifier.
    pub session_id: String,
    /// User id learned from the first join event.
    pub user_id: Option<String>,
    /// Display name learned from the first join event.
    pub username: Option<String>,
    /// Outbound event channel.
    pub sender: mpsc::UnboundedSender<ServerEvent>,
    /// The single room this session currently receives live pushes for.
    pub room: Option<RoomKey>,
}

/// Registry of live sessions, shared across all connections.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Create a new session registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session.
    pub async fn register(
        &self,
        session_id: impl Into<String>,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let session_id = session_id.into();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.clone(),
            Session {
                session_id,
                user_id: None,
                username: None,
                sender,
                room: None,
            },
        );
    }

    /// Remove a session, returning its final state for room cleanup.
    ///
    /// No-op on unknown session ids.
    pub async fn unregister(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(session_id)
    }

    /// Record the identity a session joined with.
    pub async fn set_identity(&self, session_id: &str, user_id: &str, username: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.user_id = Some(user_id.to_string());
            if !username.is_empty() {
                session.username = Some(username.to_string());
            }
        }
    }

    /// The user id a session registered with, if known.
    pub async fn user_id_of(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).and_then(|s| s.user_id.clone())
    }

    /// The session's current room, if any.
    pub async fn current_room(&self, session_id: &str) -> Option<RoomKey> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).and_then(|s| s.room.clone())
    }

    /// Set the session's room slot, returning the previous occupant.
    pub async fn set_room(&self, session_id: &str, room: Option<RoomKey>) -> Option<RoomKey> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => std::mem::replace(&mut session.room, room),
            None => None,
        }
    }

    /// Send an event directly to one session.
    ///
    /// Returns false if the session is unknown or its channel is closed.
    pub async fn send_to(&self, session_id: &str, event: ServerEvent) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) => session.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Clone of the session's outbound sender.
    pub async fn sender_of(
        &self,
        session_id: &str,
    ) -> Option<mpsc::UnboundedSender<ServerEvent>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.sender.clone())
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
