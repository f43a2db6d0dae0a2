//! Group storage for Parley.
//!
//! Groups are an external entity as far as the message router is concerned:
//! the core reads membership to validate mentions and never mutates it. The
//! write helpers here exist for the group management layer and for tests.

use std::collections::HashSet;

use sqlx::FromRow;

use super::DbPool;
use crate::{ParleyError, Result};

/// A member of a group.
#[derive(Debug, Clone, FromRow)]
pub struct GroupMember {
    /// User identifier.
    pub user_id: String,
    /// Whether the member holds the admin role.
    pub is_admin: bool,
}

/// A chat group with its membership.
#[derive(Debug, Clone)]
pub struct Group {
    /// Group identifier.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Group description.
    pub description: String,
    /// Avatar URL, if set.
    pub avatar_url: Option<String>,
    /// Members, including admins.
    pub members: Vec<GroupMember>,
}

impl Group {
    /// Set of member ids, for O(1) membership checks.
    pub fn member_ids(&self) -> HashSet<&str> {
        self.members.iter().map(|m| m.user_id.as_str()).collect()
    }

    /// Whether the given user is a member.
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    /// Whether the given user is an admin.
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.user_id == user_id && m.is_admin)
    }
}

/// Data for creating a group.
#[derive(Debug, Clone)]
pub struct NewGroup {
    /// Group identifier.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Group description.
    pub description: String,
    /// Avatar URL, if set.
    pub avatar_url: Option<String>,
    /// Creator's user id; becomes the first admin.
    pub created_by: String,
    /// Initial member ids (the creator is added implicitly).
    pub members: Vec<String>,
}

/// Repository for group reads (and creation, for the management layer).
pub struct GroupRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> GroupRepository<'a> {
    /// Create a new GroupRepository with the given database pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a group with its membership by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Group>> {
        #[derive(FromRow)]
        struct GroupRow {
            id: String,
            name: String,
            description: String,
            avatar_url: Option<String>,
        }

        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, name, description, avatar_url FROM groups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let members = sqlx::query_as::<_, GroupMember>(
            "SELECT user_id, is_admin FROM group_members WHERE group_id = ? ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        Ok(Some(Group {
            id: row.id,
            name: row.name,
            description: row.description,
            avatar_url: row.avatar_url,
            members,
        }))
    }

    /// Create a group with its initial membership.
    ///
    /// The creator is always a member and the first admin.
    pub async fn create(&self, new_group: &NewGroup) -> Result<Group> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO groups (id, name, description, avatar_url, created_by)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&new_group.id)
        .bind(&new_group.name)
        .bind(&new_group.description)
        .bind(&new_group.avatar_url)
        .bind(&new_group.created_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        let mut member_ids: Vec<&str> =
            new_group.members.iter().map(String::as_str).collect();
        if !member_ids.contains(&new_group.created_by.as_str()) {
            member_ids.push(&new_group.created_by);
        }

        for member_id in member_ids {
            let is_admin = member_id == new_group.created_by;
            sqlx::query(
                "INSERT INTO group_members (group_id, user_id, is_admin) VALUES (?, ?, ?)",
            )
            .bind(&new_group.id)
            .bind(member_id)
            .bind(is_admin)
            .execute(&mut *tx)
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        self.get_by_id(&new_group.id)
            .await?
            .ok_or_else(|| ParleyError::NotFound("group".to_string()))
    }

    /// Add a member to a group. No-op if already a member.
    pub async fn add_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, is_admin) VALUES (?, ?, 0)",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(self.pool)
        .await
        .map_err(|e| ParleyError::Database(e.to_string()))?;

        Ok(())
    }
}
