//! Message persistence gateway for Parley.
//!
//! Messages are immutable once saved. A group message may carry a visibility
//! scope: a set of user ids allowed to see it. A message with no scope is
//! visible to every group member, and the history queries enforce that rule
//! server-side so a requester never receives messages outside their scope.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::DbPool;
use crate::{ParleyError, Result};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Two-party message.
    Private,
    /// Group message.
    Group,
}

impl MessageKind {
    /// Get string representation, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Private => "private",
            MessageKind::Group => "group",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(MessageKind::Private),
            "group" => Ok(MessageKind::Group),
            other => Err(ParleyError::Database(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Sender's user id.
    pub sender_id: String,
    /// Message body text.
    pub body: String,
    /// Client-supplied send timestamp.
    pub timestamp: DateTime<Utc>,
    /// Message type.
    pub kind: MessageKind,
    /// Receiver's user id (private messages only).
    pub receiver_id: Option<String>,
    /// Group id (group messages only).
    pub group_id: Option<String>,
    /// Validated mention list (group messages only).
    pub mentions: Vec<String>,
    /// Visibility scope; None means visible to all group members.
    pub visible_to: Option<Vec<String>>,
}

impl NewMessage {
    /// Create a private message.
    pub fn private(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            body: body.into(),
            timestamp,
            kind: MessageKind::Private,
            receiver_id: Some(receiver_id.into()),
            group_id: None,
            mentions: Vec::new(),
            visible_to: None,
        }
    }

    /// Create a group message with an optional visibility scope.
    pub fn group(
        sender_id: impl Into<String>,
        group_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
        mentions: Vec<String>,
        visible_to: Option<Vec<String>>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            body: body.into(),
            timestamp,
            kind: MessageKind::Group,
            receiver_id: None,
            group_id: Some(group_id.into()),
            mentions,
            visible_to,
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Generated message id.
    pub id: i64,
    /// Sender's user id.
    pub sender_id: String,
    /// Message body text.
    pub body: String,
    /// Message type.
    pub kind: MessageKind,
    /// Receiver's user id (private messages only).
    pub receiver_id: Option<String>,
    /// Group id (group messages only).
    pub group_id: Option<String>,
    /// Validated mention list.
    pub mentions: Vec<String>,
    /// Visibility scope; None means visible to all group members.
    pub visible_to: Option<Vec<String>>,
    /// Send timestamp; source of truth for history ordering.
    pub timestamp: DateTime<Utc>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A group history entry enriched with sender display metadata.
#[derive(Debug, Clone)]
pub struct GroupHistoryMessage {
    /// Message id.
    pub id: i64,
    /// Sender's user id.
    pub sender_id: String,
    /// Group id.
    pub group_id: String,
    /// Message body text.
    pub body: String,
    /// Send timestamp.
    pub timestamp: DateTime<Utc>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Sender's display name, when the user record exists.
    pub sender_name: Option<String>,
    /// Sender's avatar URL.
    pub sender_avatar: Option<String>,
    /// Validated mention list.
    pub mentions: Vec<String>,
    /// Whether the message carried a restricted visibility scope.
    pub is_private_mention: bool,
}

/// Pagination for history queries.
#[derive(Debug, Clone, Copy)]
pub struct HistoryPage {
    /// Maximum number of messages to return.
    pub limit: i64,
    /// Number of messages to skip.
    pub offset: i64,
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl HistoryPage {
    /// First page with the given limit.
    pub fn with_limit(limit: i64) -> Self {
        Self { limit, offset: 0 }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    sender_id: String,
    body: String,
    message_type: String,
    receiver_id: Option<String>,
    group_id: Option<String>,
    mentions: Option<String>,
    visible_to: Option<String>,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_stored(self) -> Result<StoredMessage> {
        Ok(StoredMessage {
            id: self.id,
            sender_id: self.sender_id,
            body: self.body,
            kind: MessageKind::parse(&self.message_type)?,
            receiver_id: self.receiver_id,
            group_id: self.group_id,
            mentions: decode_id_list(self.mentions.as_deref())?,
            visible_to: self
                .visible_to
                .as_deref()
                .map(|raw| decode_id_list(Some(raw)))
                .transpose()?,
            timestamp: self.timestamp,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct GroupHistoryRow {
    id: i64,
    sender_id: String,
    group_id: String,
    body: String,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
    sender_name: Option<String>,
    sender_avatar: Option<String>,
    mentions: Option<String>,
    visible_to: Option<String>,
}

fn encode_id_list(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids).map_err(|e| ParleyError::Database(e.to_string()))
}

fn decode_id_list(raw: Option<&str>) -> Result<Vec<String>> {
    match raw {
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| ParleyError::Database(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

/// Repository for message persistence and history retrieval.
pub struct MessageRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> MessageRepository<'a> {
    /// Create a new MessageRepository with the given database pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Persist a message, returning it with the generated id.
    pub async fn save(&self, new_message: &NewMessage) -> Result<StoredMessage> {
        let mentions_json = if new_message.mentions.is_empty() {
            None
        } else {
            Some(encode_id_list(&new_message.mentions)?)
        };
        let visible_to_json = new_message
            .visible_to
            .as_ref()
            .map(|ids| encode_id_list(ids))
            .transpose()?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO messages
                (sender_id, body, message_type, receiver_id, group_id, mentions, visible_to,
                 timestamp, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_message.sender_id)
        .bind(&new_message.body)
        .bind(new_message.kind.as_str())
        .bind(&new_message.receiver_id)
        .bind(&new_message.group_id)
        .bind(&mentions_json)
        .bind(&visible_to_json)
        .bind(new_message.timestamp)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            sender_id: new_message.sender_id.clone(),
            body: new_message.body.clone(),
            kind: new_message.kind,
            receiver_id: new_message.receiver_id.clone(),
            group_id: new_message.group_id.clone(),
            mentions: new_message.mentions.clone(),
            visible_to: new_message.visible_to.clone(),
            timestamp: new_message.timestamp,
            created_at: now,
        })
    }

    /// Get a message by id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<StoredMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, sender_id, body, message_type, receiver_id, group_id, mentions,
                    visible_to, timestamp, created_at
             FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        row.map(MessageRow::into_stored).transpose()
    }

    /// Conversation history between two users, both directions, ascending
    /// timestamp order.
    pub async fn history_for_private(
        &self,
        user_a: &str,
        user_b: &str,
        page: HistoryPage,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, sender_id, body, message_type, receiver_id, group_id, mentions,
                    visible_to, timestamp, created_at
             FROM messages
             WHERE message_type = 'private'
               AND ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
             ORDER BY timestamp ASC
             LIMIT ?3 OFFSET ?4",
        )
        .bind(user_a)
        .bind(user_b)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        rows.into_iter().map(MessageRow::into_stored).collect()
    }

    /// Group history visible to the requesting user, ascending timestamp
    /// order, enriched with sender display metadata.
    ///
    /// A message is visible if it has no visibility scope or the requesting
    /// user is in its scope.
    pub async fn history_for_group(
        &self,
        group_id: &str,
        requesting_user_id: &str,
        page: HistoryPage,
    ) -> Result<Vec<GroupHistoryMessage>> {
        let rows = sqlx::query_as::<_, GroupHistoryRow>(
            "SELECT m.id, m.sender_id, m.group_id, m.body, m.timestamp, m.created_at,
                    u.username AS sender_name, u.avatar_url AS sender_avatar,
                    m.mentions, m.visible_to
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.group_id = ?1
               AND (m.visible_to IS NULL
                 OR EXISTS (SELECT 1 FROM json_each(m.visible_to) WHERE json_each.value = ?2))
             ORDER BY m.timestamp ASC
             LIMIT ?3 OFFSET ?4",
        )
        .bind(group_id)
        .bind(requesting_user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(GroupHistoryMessage {
                    id: row.id,
                    sender_id: row.sender_id,
                    group_id: row.group_id,
                    body: row.body,
                    timestamp: row.timestamp,
                    created_at: row.created_at,
                    sender_name: row.sender_name,
                    sender_avatar: row.sender_avatar,
                    mentions: decode_id_list(row.mentions.as_deref())?,
                    is_private_mention: row.visible_to.is_some(),
                })
            })
            .collect()
    }
}
