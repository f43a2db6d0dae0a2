//! User lookup for Parley.
//!
//! The chat core reads users only to enrich outgoing message payloads with
//! display metadata; account CRUD belongs to the excluded HTTP layer.

use sqlx::FromRow;

use super::DbPool;
use crate::{ParleyError, Result};

/// A chat user as seen by the message router.
#[derive(Debug, Clone, FromRow)]
pub struct ChatUser {
    /// User identifier.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Avatar URL, if set.
    pub avatar_url: Option<String>,
}

/// Repository for user lookups.
pub struct UserRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> UserRepository<'a> {
    /// Create a new UserRepository with the given database pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ChatUser>> {
        let result = sqlx::query_as::<_, ChatUser>(
            "SELECT id, username, avatar_url FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        Ok(result)
    }

    /// Insert a user. Used by the account layer and tests.
    pub async fn create(&self, user: &ChatUser) -> Result<()> {
        sqlx::query("INSERT INTO users (id, username, avatar_url) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.username)
            .bind(&user.avatar_url)
            .execute(self.pool)
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn user(id: &str, username: &str) -> ChatUser {
        ChatUser {
            id: id.to_string(),
            username: username.to_string(),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = UserRepository::new(db.pool());

        repo.create(&user("u1", "alice")).await.unwrap();

        let found = repo.get_by_id("u1").await.unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert_eq!(found.username, "alice");
        assert!(found.avatar_url.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_user() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = UserRepository::new(db.pool());

        let found = repo.get_by_id("nobody").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_create_with_avatar() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = UserRepository::new(db.pool());

        let mut u = user("u2", "bob");
        u.avatar_url = Some("/avatars/bob.png".to_string());
        repo.create(&u).await.unwrap();

        let found = repo.get_by_id("u2").await.unwrap().unwrap();
        assert_eq!(found.avatar_url.as_deref(), Some("/avatars/bob.png"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = UserRepository::new(db.pool());

        repo.create(&user("u1", "alice")).await.unwrap();
        let result = repo.create(&user("u1", "imposter")).await;
        assert!(result.is_err());
    }
}
