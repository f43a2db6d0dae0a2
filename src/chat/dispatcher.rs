//! Message router / dispatcher for Parley.
//!
//! Inbound events are handled in order per connection over the shared
//! session and room state. The dispatcher validates payloads, persists
//! messages, and fans delivery out to the connections currently subscribed
//! to the target room, honoring the visibility scope of mention-narrowed
//! group messages. Persistence failures degrade to best-effort in-memory
//! delivery with an error marker; there is no retry or redelivery.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::{
    Database, GroupRepository, HistoryPage, MessageRepository, NewMessage, UserRepository,
};

use super::events::{ClientEvent, MentionUser, ServerEvent};
use super::mentions::resolve_mentions;
use super::room::{RoomKey, RoomManager, RoomMember};
use super::session::SessionRegistry;

const SAVE_FAILED: &str = "Failed to save message";

/// The message router: owns the session registry and room manager, and
/// orchestrates validation, persistence, and fan-out for every event.
pub struct Dispatcher {
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomManager>,
    db: Arc<Database>,
    history_limit: i64,
}

impl Dispatcher {
    /// Create a new dispatcher over the given database.
    pub fn new(db: Arc<Database>, history_limit: i64) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            rooms: Arc::new(RoomManager::new()),
            db,
            history_limit,
        }
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The room manager.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Register a new connection and return its session id.
    pub async fn connect(&self, sender: mpsc::UnboundedSender<ServerEvent>) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.register(&session_id, sender).await;
        debug!("Session connected: {}", session_id);
        session_id
    }

    /// Tear down a connection: unregister the session and leave its room.
    ///
    /// Silent; no notification is emitted to remaining subscribers.
    pub async fn disconnect(&self, session_id: &str) {
        if let Some(session) = self.sessions.unregister(session_id).await {
            if let Some(room) = session.room {
                self.rooms.leave(&room, session_id).await;
            }
        }
        debug!("Session disconnected: {}", session_id);
    }

    /// Route one inbound event.
    pub async fn handle_event(&self, session_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::JoinChat {
                username,
                sender_id,
                receiver_id,
            } => {
                self.join_private(session_id, &username, &sender_id, &receiver_id)
                    .await;
            }
            ClientEvent::JoinGroup {
                username,
                user_id,
                group_id,
            } => {
                self.join_group(session_id, &username, &user_id, &group_id)
                    .await;
            }
            ClientEvent::LeaveGroup { group_id } => {
                self.leave_group(session_id, &group_id).await;
            }
            ClientEvent::LeaveRoom => {
                self.leave_room(session_id).await;
            }
            ClientEvent::GetConversation {
                sender_id,
                receiver_id,
            } => {
                self.get_conversation(session_id, &sender_id, &receiver_id)
                    .await;
            }
            ClientEvent::GetGroupConversation { group_id } => {
                self.get_group_conversation(session_id, &group_id).await;
            }
            ClientEvent::SendMessage {
                sender_id,
                receiver_id,
                message,
            } => {
                self.send_private(&sender_id, &receiver_id, message).await;
            }
            ClientEvent::SendGroupMessage {
                sender_id,
                group_id,
                message,
                mention_users,
            } => {
                self.send_group(&sender_id, &group_id, message, &mention_users)
                    .await;
            }
        }
    }

    /// Join the private room for a user pair.
    async fn join_private(
        &self,
        session_id: &str,
        username: &str,
        sender_id: &str,
        receiver_id: &str,
    ) {
        if sender_id.is_empty() || receiver_id.is_empty() {
            self.reject(session_id, "missing_ids", "senderId and receiverId are required")
                .await;
            return;
        }

        self.sessions
            .set_identity(session_id, sender_id, username)
            .await;
        self.switch_room(session_id, RoomKey::private(sender_id, receiver_id), sender_id)
            .await;
    }

    /// Join a group room and notify the members already there.
    async fn join_group(&self, session_id: &str, username: &str, user_id: &str, group_id: &str) {
        if user_id.is_empty() || group_id.is_empty() {
            self.reject(session_id, "missing_ids", "userId and groupId are required")
                .await;
            return;
        }

        self.sessions
            .set_identity(session_id, user_id, username)
            .await;
        let key = RoomKey::group(group_id);
        self.switch_room(session_id, key.clone(), user_id).await;

        // Best-effort join notice to the other subscribers; never persisted.
        let notice = ServerEvent::UserJoinedGroup {
            user_id: user_id.to_string(),
            username: username.to_string(),
        };
        for (member_session_id, member) in self.rooms.members_of(&key).await {
            if member_session_id != session_id {
                let _ = member.sender.send(notice.clone());
            }
        }
    }

    /// Leave a group room.
    async fn leave_group(&self, session_id: &str, group_id: &str) {
        let key = RoomKey::group(group_id);
        self.rooms.leave(&key, session_id).await;
        if self.sessions.current_room(session_id).await == Some(key) {
            self.sessions.set_room(session_id, None).await;
        }
    }

    /// Leave whatever room the session is in.
    async fn leave_room(&self, session_id: &str) {
        if let Some(key) = self.sessions.set_room(session_id, None).await {
            self.rooms.leave(&key, session_id).await;
        }
    }

    /// Private history, delivered to the requesting session only.
    async fn get_conversation(&self, session_id: &str, sender_id: &str, receiver_id: &str) {
        if sender_id.is_empty() || receiver_id.is_empty() {
            self.reject(session_id, "missing_ids", "senderId and receiverId are required")
                .await;
            return;
        }

        let repo = MessageRepository::new(self.db.pool());
        let page = HistoryPage::with_limit(self.history_limit);
        let messages = match repo.history_for_private(sender_id, receiver_id, page).await {
            Ok(messages) => messages.into_iter().map(Into::into).collect(),
            Err(e) => {
                // Fetch failures surface as an empty conversation
                warn!("Failed to fetch private history: {}", e);
                Vec::new()
            }
        };

        self.sessions
            .send_to(session_id, ServerEvent::ConversationHistory { messages })
            .await;
    }

    /// Group history, filtered to the requester's visibility, delivered to
    /// the requesting session only.
    async fn get_group_conversation(&self, session_id: &str, group_id: &str) {
        if group_id.is_empty() {
            self.reject(session_id, "missing_ids", "groupId is required")
                .await;
            return;
        }

        // The requester's identity comes from their join, never the payload
        let user_id = self.sessions.user_id_of(session_id).await.unwrap_or_default();

        let repo = MessageRepository::new(self.db.pool());
        let page = HistoryPage::with_limit(self.history_limit);
        let messages = match repo.history_for_group(group_id, &user_id, page).await {
            Ok(messages) => messages.into_iter().map(Into::into).collect(),
            Err(e) => {
                warn!("Failed to fetch group history: {}", e);
                Vec::new()
            }
        };

        self.sessions
            .send_to(
                session_id,
                ServerEvent::GroupConversationHistory { messages },
            )
            .await;
    }

    /// Persist and deliver a private message to its pair room.
    ///
    /// On persistence failure the message is still delivered in-memory with
    /// an error marker so the sender's client can flag it as unsent.
    async fn send_private(&self, sender_id: &str, receiver_id: &str, message: String) {
        if sender_id.is_empty() || receiver_id.is_empty() {
            // Send errors are addressed to the room, and without ids there
            // is no room to address. Drop.
            warn!("Dropping private send with missing ids");
            return;
        }

        let key = RoomKey::private(sender_id, receiver_id);
        let timestamp = Utc::now();
        let repo = MessageRepository::new(self.db.pool());
        let new_message = NewMessage::private(sender_id, receiver_id, &message, timestamp);

        let event = match repo.save(&new_message).await {
            Ok(saved) => ServerEvent::MessageReceived {
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                message,
                timestamp: saved.timestamp,
                message_id: Some(saved.id),
                error: None,
            },
            Err(e) => {
                error!("Failed to save private message: {}", e);
                ServerEvent::MessageReceived {
                    sender_id: sender_id.to_string(),
                    receiver_id: receiver_id.to_string(),
                    message,
                    timestamp,
                    message_id: None,
                    error: Some(SAVE_FAILED.to_string()),
                }
            }
        };

        self.deliver_to_room(&key, event).await;
    }

    /// Persist and deliver a group message, narrowing delivery to the
    /// visibility scope when the sender mentioned members.
    async fn send_group(
        &self,
        sender_id: &str,
        group_id: &str,
        message: String,
        mention_users: &[MentionUser],
    ) {
        if sender_id.is_empty() || group_id.is_empty() {
            warn!("Dropping group send with missing ids");
            return;
        }

        let key = RoomKey::group(group_id);
        let timestamp = Utc::now();

        // Only the id field of a mention entry is trusted
        let candidates: Vec<String> = mention_users
            .iter()
            .map(|u| u.id.clone())
            .filter(|id| !id.is_empty())
            .collect();

        let group_repo = GroupRepository::new(self.db.pool());
        let mentions = match resolve_mentions(&group_repo, group_id, &candidates).await {
            Ok(mentions) => mentions,
            Err(e) => {
                error!("Failed to validate mentions: {}", e);
                self.deliver_to_room(
                    &key,
                    self.group_error(sender_id, group_id, &message),
                )
                .await;
                return;
            }
        };

        // Restricted scope: sender plus the validated mentions
        let visible_to = if mentions.is_empty() {
            None
        } else {
            let mut scope = vec![sender_id.to_string()];
            scope.extend(mentions.iter().filter(|m| *m != sender_id).cloned());
            Some(scope)
        };

        let repo = MessageRepository::new(self.db.pool());
        let new_message = NewMessage::group(
            sender_id,
            group_id,
            &message,
            timestamp,
            mentions.clone(),
            visible_to.clone(),
        );

        match repo.save(&new_message).await {
            Ok(saved) => {
                // Enrich the payload with sender display metadata
                let sender_profile = match UserRepository::new(self.db.pool())
                    .get_by_id(sender_id)
                    .await
                {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!("Failed to fetch sender profile: {}", e);
                        None
                    }
                };

                let event = ServerEvent::GroupMessageReceived {
                    sender_id: sender_id.to_string(),
                    group_id: group_id.to_string(),
                    message,
                    timestamp: saved.timestamp,
                    message_id: saved.id,
                    sender_name: sender_profile.as_ref().map(|p| p.username.clone()),
                    sender_avatar: sender_profile.and_then(|p| p.avatar_url),
                    mentions,
                    is_private_mention: visible_to.is_some(),
                };

                match &visible_to {
                    Some(scope) => {
                        let scope: HashSet<&str> = scope.iter().map(String::as_str).collect();
                        self.deliver_scoped(&key, &scope, event).await;
                    }
                    None => self.deliver_to_room(&key, event).await,
                }
            }
            Err(e) => {
                error!("Failed to save group message: {}", e);
                let event = self.group_error(sender_id, group_id, &message);
                // Error notification follows the intended visibility: a
                // failed private mention is not announced to the whole room
                match &visible_to {
                    Some(scope) => {
                        let scope: HashSet<&str> = scope.iter().map(String::as_str).collect();
                        self.deliver_scoped(&key, &scope, event).await;
                    }
                    None => self.deliver_to_room(&key, event).await,
                }
            }
        }
    }

    fn group_error(&self, sender_id: &str, group_id: &str, message: &str) -> ServerEvent {
        ServerEvent::GroupMessageError {
            sender_id: sender_id.to_string(),
            group_id: group_id.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            error: SAVE_FAILED.to_string(),
        }
    }

    /// Move a session into a room, leaving its previous room first.
    ///
    /// A connection receives live pushes for at most one conversation at a
    /// time; joining always evicts the previous subscription.
    async fn switch_room(&self, session_id: &str, key: RoomKey, user_id: &str) {
        let Some(sender) = self.sessions.sender_of(session_id).await else {
            return;
        };

        if let Some(prev) = self.sessions.set_room(session_id, Some(key.clone())).await {
            if prev != key {
                self.rooms.leave(&prev, session_id).await;
            }
        }

        self.rooms
            .join(
                key,
                session_id,
                RoomMember {
                    user_id: user_id.to_string(),
                    sender,
                },
            )
            .await;
    }

    /// Deliver an event to every connection subscribed to a room.
    async fn deliver_to_room(&self, key: &RoomKey, event: ServerEvent) {
        for (_, member) in self.rooms.members_of(key).await {
            let _ = member.sender.send(event.clone());
        }
    }

    /// Deliver an event only to subscribed connections whose user id is in
    /// scope. Connections outside scope receive nothing.
    async fn deliver_scoped(&self, key: &RoomKey, scope: &HashSet<&str>, event: ServerEvent) {
        for (_, member) in self.rooms.members_of(key).await {
            if scope.contains(member.user_id.as_str()) {
                let _ = member.sender.send(event.clone());
            }
        }
    }

    async fn reject(&self, session_id: &str, code: &str, reason: &str) {
        self.sessions
            .send_to(session_id, ServerEvent::rejected(code, reason))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChatUser, NewGroup};
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn setup() -> (Dispatcher, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        (Dispatcher::new(Arc::clone(&db), 50), db)
    }

    async fn seed_user(db: &Database, id: &str, username: &str) {
        UserRepository::new(db.pool())
            .create(&ChatUser {
                id: id.to_string(),
                username: username.to_string(),
                avatar_url: None,
            })
            .await
            .unwrap();
    }

    async fn seed_group(db: &Database, id: &str, creator: &str, members: &[&str]) {
        GroupRepository::new(db.pool())
            .create(&NewGroup {
                id: id.to_string(),
                name: format!("Group {id}"),
                description: String::new(),
                avatar_url: None,
                created_by: creator.to_string(),
                members: members.iter().map(|m| (*m).to_string()).collect(),
            })
            .await
            .unwrap();
    }

    async fn connect(dispatcher: &Dispatcher) -> (String, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = dispatcher.connect(tx).await;
        (session_id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn join_chat(username: &str, sender: &str, receiver: &str) -> ClientEvent {
        ClientEvent::JoinChat {
            username: username.to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
        }
    }

    fn join_group(username: &str, user: &str, group: &str) -> ClientEvent {
        ClientEvent::JoinGroup {
            username: username.to_string(),
            user_id: user.to_string(),
            group_id: group.to_string(),
        }
    }

    #[tokio::test]
    async fn test_private_send_delivers_to_both() {
        let (dispatcher, db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;

        // Join from both directions; the room key must commute
        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;
        dispatcher.handle_event(&s2, join_chat("bob", "u2", "u1")).await;
        assert_eq!(
            dispatcher.rooms().member_count(&RoomKey::private("u1", "u2")).await,
            2
        );

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendMessage {
                    sender_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                    message: "hello".to_string(),
                },
            )
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::MessageReceived {
                    sender_id,
                    message,
                    message_id,
                    error,
                    ..
                } => {
                    assert_eq!(sender_id, "u1");
                    assert_eq!(message, "hello");
                    assert!(message_id.is_some());
                    assert!(error.is_none());
                }
                other => panic!("Expected MessageReceived, got {other:?}"),
            }
        }

        // Message is durable
        let history = MessageRepository::new(db.pool())
            .history_for_private("u1", "u2", HistoryPage::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
    }

    #[tokio::test]
    async fn test_private_send_without_receiver_session() {
        let (dispatcher, db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;
        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendMessage {
                    sender_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                    message: "anyone there?".to_string(),
                },
            )
            .await;

        // Sender still gets the echo; the message is persisted for later fetch
        assert_eq!(drain(&mut rx1).len(), 1);
        let history = MessageRepository::new(db.pool())
            .history_for_private("u2", "u1", HistoryPage::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_private_send_persistence_failure_degrades() {
        let (dispatcher, db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;
        dispatcher.handle_event(&s2, join_chat("bob", "u2", "u1")).await;

        // Force storage failure
        db.pool().close().await;

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendMessage {
                    sender_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                    message: "doomed".to_string(),
                },
            )
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::MessageReceived {
                    message,
                    message_id,
                    error,
                    ..
                } => {
                    assert_eq!(message, "doomed");
                    assert!(message_id.is_none());
                    assert_eq!(error.as_deref(), Some("Failed to save message"));
                }
                other => panic!("Expected MessageReceived, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_with_missing_ids_dropped() {
        let (dispatcher, _db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendMessage {
                    sender_id: String::new(),
                    receiver_id: "u2".to_string(),
                    message: "hi".to_string(),
                },
            )
            .await;

        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_join_with_missing_ids_rejected() {
        let (dispatcher, _db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_chat("alice", "", "u2")).await;

        let events = drain(&mut rx1);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Rejected { .. }));
        assert_eq!(dispatcher.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_group_notifies_others_only() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2"]).await;
        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        assert!(drain(&mut rx1).is_empty());

        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;

        // Existing member sees the notice; the joiner does not
        let events = drain(&mut rx1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::UserJoinedGroup { user_id, username } => {
                assert_eq!(user_id, "u2");
                assert_eq!(username, "bob");
            }
            other => panic!("Expected UserJoinedGroup, got {other:?}"),
        }
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_single_active_room_per_session() {
        let (dispatcher, _db) = setup().await;
        let (s1, _rx1) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;

        // The group subscription was evicted by the private join
        assert_eq!(dispatcher.rooms().member_count(&RoomKey::group("g1")).await, 0);
        assert_eq!(
            dispatcher.rooms().member_count(&RoomKey::private("u1", "u2")).await,
            1
        );
        assert_eq!(
            dispatcher.sessions().current_room(&s1).await,
            Some(RoomKey::private("u1", "u2"))
        );
    }

    #[tokio::test]
    async fn test_unrestricted_group_send_broadcasts() {
        let (dispatcher, db) = setup().await;
        seed_user(&db, "u1", "alice").await;
        seed_group(&db, "g1", "u1", &["u2", "u3"]).await;

        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        let (s3, mut rx3) = connect(&dispatcher).await;
        let (_s4, mut rx4) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;
        dispatcher.handle_event(&s3, join_group("carol", "u3", "g1")).await;
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            drain(rx);
        }

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendGroupMessage {
                    sender_id: "u1".to_string(),
                    group_id: "g1".to_string(),
                    message: "hi all".to_string(),
                    mention_users: Vec::new(),
                },
            )
            .await;

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::GroupMessageReceived {
                    message,
                    sender_name,
                    is_private_mention,
                    mentions,
                    ..
                } => {
                    assert_eq!(message, "hi all");
                    assert_eq!(sender_name.as_deref(), Some("alice"));
                    assert!(!is_private_mention);
                    assert!(mentions.is_empty());
                }
                other => panic!("Expected GroupMessageReceived, got {other:?}"),
            }
        }
        // A connection that never joined the room receives nothing
        assert!(drain(&mut rx4).is_empty());
    }

    #[tokio::test]
    async fn test_mention_scoped_send() {
        let (dispatcher, db) = setup().await;
        seed_user(&db, "u1", "alice").await;
        seed_group(&db, "g1", "u1", &["u2", "u3"]).await;

        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        let (s3, mut rx3) = connect(&dispatcher).await;

        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;
        dispatcher.handle_event(&s3, join_group("carol", "u3", "g1")).await;
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            drain(rx);
        }

        // u4 is not a member; only u2 survives validation
        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendGroupMessage {
                    sender_id: "u1".to_string(),
                    group_id: "g1".to_string(),
                    message: "just us".to_string(),
                    mention_users: vec![
                        MentionUser {
                            id: "u4".to_string(),
                            username: Some("dave".to_string()),
                        },
                        MentionUser {
                            id: "u2".to_string(),
                            username: Some("bob".to_string()),
                        },
                    ],
                },
            )
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::GroupMessageReceived {
                    mentions,
                    is_private_mention,
                    ..
                } => {
                    assert_eq!(mentions, &vec!["u2".to_string()]);
                    assert!(is_private_mention);
                }
                other => panic!("Expected GroupMessageReceived, got {other:?}"),
            }
        }
        // Out of scope: nothing, not even a stub
        assert!(drain(&mut rx3).is_empty());

        // History honors the same scope
        let repo = MessageRepository::new(db.pool());
        let for_u3 = repo
            .history_for_group("g1", "u3", HistoryPage::default())
            .await
            .unwrap();
        assert!(for_u3.is_empty());
        let for_u2 = repo
            .history_for_group("g1", "u2", HistoryPage::default())
            .await
            .unwrap();
        assert_eq!(for_u2.len(), 1);
    }

    #[tokio::test]
    async fn test_group_send_persistence_failure_scoped_error() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2", "u3"]).await;

        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        let (s3, mut rx3) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;
        dispatcher.handle_event(&s3, join_group("carol", "u3", "g1")).await;
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            drain(rx);
        }

        // Mention validation still works; only the insert fails
        sqlx::query("DROP TABLE messages")
            .execute(db.pool())
            .await
            .unwrap();

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendGroupMessage {
                    sender_id: "u1".to_string(),
                    group_id: "g1".to_string(),
                    message: "secret".to_string(),
                    mention_users: vec![MentionUser {
                        id: "u2".to_string(),
                        username: None,
                    }],
                },
            )
            .await;

        // Error stays within the intended visibility scope
        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], ServerEvent::GroupMessageError { .. }));
        }
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn test_get_conversation_requester_only() {
        let (dispatcher, db) = setup().await;
        let repo = MessageRepository::new(db.pool());
        repo.save(&NewMessage::private("u1", "u2", "hi", Utc::now()))
            .await
            .unwrap();

        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;
        dispatcher.handle_event(&s2, join_chat("bob", "u2", "u1")).await;

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::GetConversation {
                    sender_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                },
            )
            .await;

        let events = drain(&mut rx1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::ConversationHistory { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message, "hi");
            }
            other => panic!("Expected ConversationHistory, got {other:?}"),
        }
        // Not broadcast to the other participant
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_get_group_conversation_uses_session_identity() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2", "u3"]).await;
        let repo = MessageRepository::new(db.pool());
        repo.save(&NewMessage::group("u1", "g1", "public", Utc::now(), Vec::new(), None))
            .await
            .unwrap();
        repo.save(&NewMessage::group(
            "u1",
            "g1",
            "for u2",
            Utc::now(),
            vec!["u2".to_string()],
            Some(vec!["u1".to_string(), "u2".to_string()]),
        ))
        .await
        .unwrap();

        let (s3, mut rx3) = connect(&dispatcher).await;
        dispatcher.handle_event(&s3, join_group("carol", "u3", "g1")).await;
        drain(&mut rx3);

        dispatcher
            .handle_event(
                &s3,
                ClientEvent::GetGroupConversation {
                    group_id: "g1".to_string(),
                },
            )
            .await;

        let events = drain(&mut rx3);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::GroupConversationHistory { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message, "public");
            }
            other => panic!("Expected GroupConversationHistory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_group_conversation_failure_yields_empty() {
        let (dispatcher, db) = setup().await;
        let (s1, mut rx1) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        drain(&mut rx1);

        db.pool().close().await;

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::GetGroupConversation {
                    group_id: "g1".to_string(),
                },
            )
            .await;

        let events = drain(&mut rx1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::GroupConversationHistory { messages } => {
                assert!(messages.is_empty());
            }
            other => panic!("Expected GroupConversationHistory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_group_stops_delivery() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2"]).await;
        let (s1, mut rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;
        drain(&mut rx1);

        dispatcher
            .handle_event(
                &s2,
                ClientEvent::LeaveGroup {
                    group_id: "g1".to_string(),
                },
            )
            .await;
        assert!(dispatcher.sessions().current_room(&s2).await.is_none());

        dispatcher
            .handle_event(
                &s1,
                ClientEvent::SendGroupMessage {
                    sender_id: "u1".to_string(),
                    group_id: "g1".to_string(),
                    message: "still here?".to_string(),
                    mention_users: Vec::new(),
                },
            )
            .await;

        assert_eq!(drain(&mut rx1).len(), 1);
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_leave_room() {
        let (dispatcher, _db) = setup().await;
        let (s1, _rx1) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_chat("alice", "u1", "u2")).await;

        dispatcher.handle_event(&s1, ClientEvent::LeaveRoom).await;

        assert_eq!(dispatcher.rooms().room_count().await, 0);
        assert!(dispatcher.sessions().current_room(&s1).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2"]).await;
        let (s1, _rx1) = connect(&dispatcher).await;
        let (s2, mut rx2) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;

        dispatcher.disconnect(&s1).await;

        assert_eq!(dispatcher.sessions().session_count().await, 1);
        assert_eq!(dispatcher.rooms().member_count(&RoomKey::group("g1")).await, 1);
        // Disconnect is silent
        drain(&mut rx2);
        dispatcher.disconnect(&s2).await;
        assert_eq!(dispatcher.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_reconnect() {
        let (dispatcher, db) = setup().await;
        seed_group(&db, "g1", "u1", &["u2"]).await;

        let (s1, _rx1) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1, join_group("alice", "u1", "g1")).await;
        dispatcher.disconnect(&s1).await;

        // Fresh session, same user: client re-issues the join on reconnect
        let (s1b, mut rx1b) = connect(&dispatcher).await;
        dispatcher.handle_event(&s1b, join_group("alice", "u1", "g1")).await;
        assert_eq!(dispatcher.rooms().member_count(&RoomKey::group("g1")).await, 1);

        let (s2, _rx2) = connect(&dispatcher).await;
        dispatcher.handle_event(&s2, join_group("bob", "u2", "g1")).await;
        drain(&mut rx1b);

        dispatcher
            .handle_event(
                &s2,
                ClientEvent::SendGroupMessage {
                    sender_id: "u2".to_string(),
                    group_id: "g1".to_string(),
                    message: "welcome back".to_string(),
                    mention_users: Vec::new(),
                },
            )
            .await;
        assert_eq!(drain(&mut rx1b).len(), 1);
    }
}
