//! Wire-level chat events.
//!
//! Event and field names mirror the browser client's JSON surface, so the
//! serde representations use camelCase tags throughout. Client-supplied
//! mention entries are untrusted: only the id field is read, and membership
//! is revalidated server-side regardless of any metadata sent along.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{GroupHistoryMessage, StoredMessage};

/// A user entry in a sendGroupMessage mention list.
///
/// Clients send full user objects; everything except the id is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct MentionUser {
    /// User identifier.
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name, unused by the server.
    #[serde(default)]
    pub username: Option<String>,
}

/// Events sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Join a private conversation room.
    #[serde(rename_all = "camelCase")]
    JoinChat {
        /// Sender's display name.
        #[serde(default)]
        username: String,
        /// Sender's user id.
        #[serde(default)]
        sender_id: String,
        /// Other participant's user id.
        #[serde(default)]
        receiver_id: String,
    },
    /// Join a group room.
    #[serde(rename_all = "camelCase")]
    JoinGroup {
        /// Joining user's display name.
        #[serde(default)]
        username: String,
        /// Joining user's id.
        #[serde(default)]
        user_id: String,
        /// Group id.
        #[serde(default)]
        group_id: String,
    },
    /// Leave a group room.
    #[serde(rename_all = "camelCase")]
    LeaveGroup {
        /// Group id.
        #[serde(default)]
        group_id: String,
    },
    /// Leave the current room.
    LeaveRoom,
    /// Request private conversation history.
    #[serde(rename_all = "camelCase")]
    GetConversation {
        /// One participant's user id.
        #[serde(default)]
        sender_id: String,
        /// Other participant's user id.
        #[serde(default)]
        receiver_id: String,
    },
    /// Request group conversation history.
    #[serde(rename_all = "camelCase")]
    GetGroupConversation {
        /// Group id.
        #[serde(default)]
        group_id: String,
    },
    /// Send a private message.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Sender's user id.
        #[serde(default)]
        sender_id: String,
        /// Receiver's user id.
        #[serde(default)]
        receiver_id: String,
        /// Message body.
        #[serde(default)]
        message: String,
    },
    /// Send a group message, optionally narrowed to mentioned users.
    #[serde(rename_all = "camelCase")]
    SendGroupMessage {
        /// Sender's user id.
        #[serde(default)]
        sender_id: String,
        /// Group id.
        #[serde(default)]
        group_id: String,
        /// Message body.
        #[serde(default)]
        message: String,
        /// Candidate mention list.
        #[serde(default)]
        mention_users: Vec<MentionUser>,
    },
}

/// A private message as delivered in a conversationHistory payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessageRecord {
    /// Message id.
    pub message_id: i64,
    /// Sender's user id.
    pub sender_id: String,
    /// Receiver's user id.
    pub receiver_id: String,
    /// Message body.
    pub message: String,
    /// Send timestamp.
    pub timestamp: DateTime<Utc>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for PrivateMessageRecord {
    fn from(msg: StoredMessage) -> Self {
        Self {
            message_id: msg.id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id.unwrap_or_default(),
            message: msg.body,
            timestamp: msg.timestamp,
            created_at: msg.created_at,
        }
    }
}

/// A group message as delivered in a groupConversationHistory payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageRecord {
    /// Message id.
    pub message_id: i64,
    /// Sender's user id.
    pub sender_id: String,
    /// Group id.
    pub group_id: String,
    /// Message body.
    pub message: String,
    /// Send timestamp.
    pub timestamp: DateTime<Utc>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Sender's display name.
    pub sender_name: Option<String>,
    /// Sender's avatar URL.
    pub sender_avatar: Option<String>,
    /// Validated mention list.
    pub mentions: Vec<String>,
    /// Whether the message was visible only to its mention scope.
    pub is_private_mention: bool,
}

impl From<GroupHistoryMessage> for GroupMessageRecord {
    fn from(msg: GroupHistoryMessage) -> Self {
        Self {
            message_id: msg.id,
            sender_id: msg.sender_id,
            group_id: msg.group_id,
            message: msg.body,
            timestamp: msg.timestamp,
            created_at: msg.created_at,
            sender_name: msg.sender_name,
            sender_avatar: msg.sender_avatar,
            mentions: msg.mentions,
            is_private_mention: msg.is_private_mention,
        }
    }
}

/// Events sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Another member joined the group room.
    #[serde(rename_all = "camelCase")]
    UserJoinedGroup {
        /// Joining user's id.
        user_id: String,
        /// Joining user's display name.
        username: String,
    },
    /// Private conversation history, delivered to the requester only.
    #[serde(rename_all = "camelCase")]
    ConversationHistory {
        /// Messages in ascending timestamp order.
        messages: Vec<PrivateMessageRecord>,
    },
    /// Group conversation history, delivered to the requester only.
    #[serde(rename_all = "camelCase")]
    GroupConversationHistory {
        /// Messages visible to the requester, ascending timestamp order.
        messages: Vec<GroupMessageRecord>,
    },
    /// A private message delivered to the conversation room.
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        /// Sender's user id.
        sender_id: String,
        /// Receiver's user id.
        receiver_id: String,
        /// Message body.
        message: String,
        /// Send timestamp.
        timestamp: DateTime<Utc>,
        /// Message id; absent when persistence failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
        /// Error marker set when persistence failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A group message delivered to its visibility scope.
    #[serde(rename_all = "camelCase")]
    GroupMessageReceived {
        /// Sender's user id.
        sender_id: String,
        /// Group id.
        group_id: String,
        /// Message body.
        message: String,
        /// Send timestamp.
        timestamp: DateTime<Utc>,
        /// Message id.
        message_id: i64,
        /// Sender's display name.
        sender_name: Option<String>,
        /// Sender's avatar URL.
        sender_avatar: Option<String>,
        /// Validated mention list.
        mentions: Vec<String>,
        /// Whether delivery was narrowed to the mention scope.
        is_private_mention: bool,
    },
    /// A group send failed at the persistence layer.
    #[serde(rename_all = "camelCase")]
    GroupMessageError {
        /// Sender's user id.
        sender_id: String,
        /// Group id.
        group_id: String,
        /// Message body as submitted.
        message: String,
        /// Failure timestamp.
        timestamp: DateTime<Utc>,
        /// Error description.
        error: String,
    },
    /// An inbound event was rejected before processing.
    #[serde(rename_all = "camelCase")]
    Rejected {
        /// Machine-readable code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl ServerEvent {
    /// Create a rejection event.
    pub fn rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            reason: reason.into(),
        }
    }
}
