use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS swipe_queue (
    id             TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    target_user_id TEXT NOT NULL,
    action         TEXT NOT NULL,               -- 'like' | 'dislike'
    place_id       TEXT NOT NULL,
    context        TEXT,                        -- JSON
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_swipe_queue_target ON swipe_queue(target_user_id);

-- Users known to have liked the local user.
CREATE TABLE IF NOT EXISTS liker_ids (
    user_id    TEXT PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
