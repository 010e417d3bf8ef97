//! v001 -- Initial schema creation.
//!
//! Creates the key-check table and the five mirrored tables: `profiles`,
//! `discovery_profiles`, `matches`, `chats` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Store metadata (key-check canary)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS store_meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);

-- ----------------------------------------------------------------
-- Profiles (one row per observed user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    id              TEXT PRIMARY KEY NOT NULL,
    user_id         TEXT NOT NULL UNIQUE,
    raw_data        BLOB NOT NULL,              -- sealed JSON
    last_fetched_at TEXT NOT NULL,              -- RFC-3339
    created_at      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Discovery feed cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS discovery_profiles (
    id              TEXT PRIMARY KEY NOT NULL,
    user_id         TEXT NOT NULL,
    raw_data        BLOB NOT NULL,              -- sealed JSON
    place_id        TEXT NOT NULL,
    last_fetched_at TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_discovery_place ON discovery_profiles(place_id);
CREATE INDEX IF NOT EXISTS idx_discovery_user ON discovery_profiles(user_id);

-- ----------------------------------------------------------------
-- Matches
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS matches (
    id               TEXT PRIMARY KEY NOT NULL,
    chat_id          TEXT,
    user_a           TEXT NOT NULL,
    user_b           TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'active',
    matched_at       TEXT NOT NULL,
    unmatched_at     TEXT,
    place_id         TEXT,
    place_name       TEXT,
    user_a_opened_at TEXT,
    user_b_opened_at TEXT,
    other_user_id    TEXT,
    other_user_name  TEXT,
    other_user_photo TEXT,
    synced_at        TEXT,
    sync_status      TEXT NOT NULL DEFAULT 'synced'
);

CREATE INDEX IF NOT EXISTS idx_matches_sync ON matches(sync_status);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                   TEXT PRIMARY KEY NOT NULL,
    match_id             TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    last_message_content BLOB,                  -- sealed
    last_message_at      TEXT,
    other_user_id        TEXT,
    other_user_name      TEXT,
    other_user_photo     TEXT,
    place_id             TEXT,
    place_name           TEXT,
    unread_count         INTEGER NOT NULL DEFAULT 0,
    synced_at            TEXT,
    sync_status          TEXT NOT NULL DEFAULT 'synced'
);

CREATE INDEX IF NOT EXISTS idx_chats_match ON chats(match_id);
CREATE INDEX IF NOT EXISTS idx_chats_last_message ON chats(last_message_at DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,
    chat_id     TEXT NOT NULL,                  -- FK -> chats(id)
    sender_id   TEXT NOT NULL,
    content     BLOB NOT NULL,                  -- sealed
    created_at  TEXT NOT NULL,
    read_at     TEXT,
    status      TEXT NOT NULL DEFAULT 'sent',
    synced_at   TEXT,
    sync_status TEXT NOT NULL DEFAULT 'synced',

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
