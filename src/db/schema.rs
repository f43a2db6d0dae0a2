//! Database schema migrations for Parley.
//!
//! Migrations are applied in order; each entry is one schema version.

/// Schema migrations, applied sequentially.
pub const MIGRATIONS: &[&str] = &[
    // v1: users and groups consumed by the chat core.
    // The chat core only reads these; the HTTP CRUD layer owns writes.
    r"
    CREATE TABLE users (
        id          TEXT PRIMARY KEY,
        username    TEXT NOT NULL,
        avatar_url  TEXT,
        created_at  TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE groups (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        avatar_url  TEXT,
        created_by  TEXT,
        created_at  TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE group_members (
        group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        user_id     TEXT NOT NULL,
        is_admin    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (group_id, user_id)
    );
    ",
    // v2: message store. Exactly one of receiver_id / group_id is set.
    // mentions and visible_to are JSON arrays of user ids; a NULL
    // visible_to means the message is visible to all group members.
    r"
    CREATE TABLE messages (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id     TEXT NOT NULL,
        body          TEXT NOT NULL,
        message_type  TEXT NOT NULL CHECK (message_type IN ('private', 'group')),
        receiver_id   TEXT,
        group_id      TEXT,
        mentions      TEXT,
        visible_to    TEXT,
        timestamp     TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        CHECK ((receiver_id IS NULL) <> (group_id IS NULL))
    );

    CREATE INDEX idx_messages_private ON messages (sender_id, receiver_id, timestamp);
    CREATE INDEX idx_messages_group ON messages (group_id, timestamp);
    ",
];
