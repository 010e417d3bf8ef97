//! Durable queue of unconfirmed swipes, and the set of known likers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::columns::{fmt_ts, opt_json_text, parse_opt_json, parse_text, parse_ts};
use crate::database::{Database, Writer};
use crate::error::Result;
use crate::models::{Liker, SwipeQueueEntry};
use crate::observe::{Record, Table};

const QUEUE_COLUMNS: &str =
    "id, target_user_id, action, place_id, context, created_at, attempts, last_error";

impl Writer<'_> {
    /// Append `entry`, replacing any entry already queued for the same target.
    ///
    /// Returns the number of replaced entries.
    pub fn enqueue_swipe(&mut self, entry: &SwipeQueueEntry) -> Result<usize> {
        let replaced: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT id FROM swipe_queue WHERE target_user_id = ?1")?;
            let rows = stmt.query_map(params![entry.target_user_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        self.conn().execute(
            "DELETE FROM swipe_queue WHERE target_user_id = ?1",
            params![entry.target_user_id],
        )?;

        self.conn().execute(
            "INSERT INTO swipe_queue
                 (id, target_user_id, action, place_id, context, created_at, attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.target_user_id,
                entry.action.as_str(),
                entry.place_id,
                opt_json_text(&entry.context),
                fmt_ts(&entry.created_at),
                entry.attempts,
                entry.last_error,
            ],
        )?;

        let count = replaced.len();
        for id in replaced {
            self.touch(Table::SwipeQueue, id);
        }
        self.touch(Table::SwipeQueue, entry.id.clone());
        Ok(count)
    }

    /// Remove a flushed entry.  Returns `true` if it was still queued.
    pub fn remove_swipe(&mut self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM swipe_queue WHERE id = ?1", params![id])?;
        if affected > 0 {
            self.touch(Table::SwipeQueue, id);
        }
        Ok(affected > 0)
    }

    /// Keep a failed entry queued and note why it failed.
    pub fn record_swipe_failure(&mut self, id: &str, error: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE swipe_queue SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if affected > 0 {
            self.touch(Table::SwipeQueue, id);
        }
        Ok(affected > 0)
    }

    pub fn add_liker(&mut self, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO liker_ids (user_id, created_at) VALUES (?1, ?2)",
            params![user_id, fmt_ts(&at)],
        )?;
        if affected > 0 {
            self.touch(Table::LikerIds, user_id);
        }
        Ok(affected > 0)
    }

    pub fn remove_liker(&mut self, user_id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM liker_ids WHERE user_id = ?1", params![user_id])?;
        if affected > 0 {
            self.touch(Table::LikerIds, user_id);
        }
        Ok(affected > 0)
    }

    /// Replace the whole liker set with the server's view.
    pub fn replace_likers(&mut self, user_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let keep: HashSet<&str> = user_ids.iter().map(String::as_str).collect();
        for existing in load_liker_ids(self.conn())? {
            if !keep.contains(existing.as_str()) {
                self.remove_liker(&existing)?;
            }
        }
        for user_id in user_ids {
            self.add_liker(user_id, at)?;
        }
        Ok(())
    }
}

impl Database {
    pub fn enqueue_swipe(&self, entry: &SwipeQueueEntry) -> Result<usize> {
        self.write(|w| w.enqueue_swipe(entry))
    }

    /// Queued swipes, oldest first.
    pub fn list_swipe_queue(&self) -> Result<Vec<SwipeQueueEntry>> {
        query_queue(self.conn())
    }

    pub fn swipe_for_target(&self, target_user_id: &str) -> Result<Option<SwipeQueueEntry>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM swipe_queue WHERE target_user_id = ?1"),
                params![target_user_id],
                row_to_entry,
            )
            .optional()?)
    }

    /// Targets with a swipe still waiting for the server.
    pub fn queued_targets(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn().prepare("SELECT target_user_id FROM swipe_queue")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn is_liker(&self, user_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM liker_ids WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_likers(&self) -> Result<Vec<Liker>> {
        query_likers(self.conn())
    }
}

fn query_queue(conn: &Connection) -> Result<Vec<SwipeQueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM swipe_queue ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([], row_to_entry)?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn query_likers(conn: &Connection) -> Result<Vec<Liker>> {
    let mut stmt =
        conn.prepare("SELECT user_id, created_at FROM liker_ids ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], |row| {
        let created: String = row.get(1)?;
        Ok(Liker {
            user_id: row.get(0)?,
            created_at: parse_ts(1, &created)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn load_liker_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM liker_ids")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

impl Record for SwipeQueueEntry {
    const TABLE: Table = Table::SwipeQueue;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_queue(db.conn())
    }
}

impl Record for Liker {
    const TABLE: Table = Table::LikerIds;

    fn record_id(&self) -> &str {
        &self.user_id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_likers(db.conn())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SwipeQueueEntry> {
    let action: String = row.get(2)?;
    let context: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;

    Ok(SwipeQueueEntry {
        id: row.get(0)?,
        target_user_id: row.get(1)?,
        action: parse_text(2, &action)?,
        place_id: row.get(3)?,
        context: parse_opt_json(4, context)?,
        created_at: parse_ts(5, &created)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rendezvous_shared::SwipeAction;

    use super::*;

    fn entry(id: &str, target: &str, action: SwipeAction, offset_secs: i64) -> SwipeQueueEntry {
        SwipeQueueEntry {
            id: id.into(),
            target_user_id: target.into(),
            action,
            place_id: "place-1".into(),
            context: Some(serde_json::json!({ "source": "feed" })),
            created_at: Utc::now() + Duration::seconds(offset_secs),
            attempts: 0,
            last_error: None,
        }
    }

    #[test]
    fn enqueue_is_last_write_wins_per_target() {
        let db = Database::open_in_memory(&[1u8; 32]).unwrap();
        assert_eq!(db.enqueue_swipe(&entry("s1", "u1", SwipeAction::Like, 0)).unwrap(), 0);
        assert_eq!(db.enqueue_swipe(&entry("s2", "u2", SwipeAction::Like, 1)).unwrap(), 0);
        assert_eq!(db.enqueue_swipe(&entry("s3", "u1", SwipeAction::Dislike, 2)).unwrap(), 1);

        let queue = db.list_swipe_queue().unwrap();
        assert_eq!(queue.len(), 2);
        let u1 = db.swipe_for_target("u1").unwrap().unwrap();
        assert_eq!(u1.id, "s3");
        assert_eq!(u1.action, SwipeAction::Dislike);
        assert_eq!(u1.context, Some(serde_json::json!({ "source": "feed" })));
    }

    #[test]
    fn failures_are_recorded_without_dropping_the_entry() {
        let db = Database::open_in_memory(&[1u8; 32]).unwrap();
        db.enqueue_swipe(&entry("s1", "u1", SwipeAction::Like, 0)).unwrap();

        db.write(|w| w.record_swipe_failure("s1", "timeout")).unwrap();
        db.write(|w| w.record_swipe_failure("s1", "503")).unwrap();

        let e = db.swipe_for_target("u1").unwrap().unwrap();
        assert_eq!(e.attempts, 2);
        assert_eq!(e.last_error.as_deref(), Some("503"));

        assert!(db.write(|w| w.remove_swipe("s1")).unwrap());
        assert!(!db.write(|w| w.remove_swipe("s1")).unwrap());
        assert!(db.queued_targets().unwrap().is_empty());
    }

    #[test]
    fn liker_set_is_replaced_wholesale() {
        let db = Database::open_in_memory(&[1u8; 32]).unwrap();
        db.write(|w| w.replace_likers(&["a".into(), "b".into()], Utc::now()))
            .unwrap();
        db.write(|w| w.replace_likers(&["b".into(), "c".into()], Utc::now()))
            .unwrap();

        assert!(!db.is_liker("a").unwrap());
        assert!(db.is_liker("b").unwrap());
        assert!(db.is_liker("c").unwrap());
        assert_eq!(db.list_likers().unwrap().len(), 2);
    }
}
