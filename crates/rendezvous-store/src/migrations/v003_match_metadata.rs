use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Match provenance
ALTER TABLE matches ADD COLUMN match_origin TEXT;
ALTER TABLE matches ADD COLUMN match_metadata TEXT;     -- JSON
ALTER TABLE matches ADD COLUMN first_message_at TEXT;

-- Explicit dismissal of discovery cards
ALTER TABLE discovery_profiles ADD COLUMN is_dismissed INTEGER NOT NULL DEFAULT 0;

-- Client-generated id of a locally sent message
ALTER TABLE messages ADD COLUMN temp_id TEXT;
CREATE INDEX IF NOT EXISTS idx_messages_temp_id ON messages(temp_id);

-- Flush diagnostics
ALTER TABLE swipe_queue ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
ALTER TABLE swipe_queue ADD COLUMN last_error TEXT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
