//! CRUD operations for [`Chat`] records.
//!
//! The last-message fields are a denormalized copy of the newest message and
//! only ever move forward in time.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use rendezvous_shared::SyncStatus;

use crate::columns::{fmt_opt_ts, fmt_ts, parse_opt_ts, parse_text, parse_ts, FieldCipher};
use crate::database::{Database, Writer};
use crate::error::{Result, StoreError};
use crate::models::Chat;
use crate::observe::{Record, Table};

const CHAT_COLUMNS: &str = "id, match_id, created_at, last_message_content, last_message_at, \
     other_user_id, other_user_name, other_user_photo, place_id, place_name, unread_count, \
     synced_at, sync_status";

const UPSERT_SQL: &str = "INSERT INTO chats (
        id, match_id, created_at, last_message_content, last_message_at, other_user_id,
        other_user_name, other_user_photo, place_id, place_name, unread_count, synced_at,
        sync_status)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
     ON CONFLICT(id) DO UPDATE SET
        match_id             = excluded.match_id,
        last_message_content = CASE
            WHEN chats.last_message_at IS NULL
              OR excluded.last_message_at >= chats.last_message_at
            THEN excluded.last_message_content ELSE chats.last_message_content END,
        last_message_at      = CASE
            WHEN chats.last_message_at IS NULL
              OR excluded.last_message_at >= chats.last_message_at
            THEN excluded.last_message_at ELSE chats.last_message_at END,
        other_user_id        = excluded.other_user_id,
        other_user_name      = excluded.other_user_name,
        other_user_photo     = excluded.other_user_photo,
        place_id             = excluded.place_id,
        place_name           = excluded.place_name,
        unread_count         = excluded.unread_count,
        synced_at            = excluded.synced_at,
        sync_status          = excluded.sync_status";

impl Writer<'_> {
    /// Insert or update a chat with an explicit local sync status.
    pub fn upsert_chat(&mut self, chat: &Chat, sync_status: SyncStatus) -> Result<()> {
        let sealed = self.cipher().seal_opt(chat.last_message_content.as_deref())?;
        self.conn().execute(
            UPSERT_SQL,
            params![
                chat.id,
                chat.match_id,
                fmt_ts(&chat.created_at),
                sealed,
                fmt_opt_ts(&chat.last_message_at),
                chat.other_user_id,
                chat.other_user_name,
                chat.other_user_photo,
                chat.place_id,
                chat.place_name,
                chat.unread_count,
                fmt_opt_ts(&chat.synced_at),
                sync_status.as_str(),
            ],
        )?;
        self.touch(Table::Chats, chat.id.clone());
        Ok(())
    }

    /// Create the chat as synced unless it already exists.
    pub fn insert_chat_if_absent(&mut self, chat: &Chat) -> Result<bool> {
        if self.chat_exists(&chat.id)? {
            return Ok(false);
        }
        let mut row = chat.clone();
        row.synced_at = Some(Utc::now());
        self.upsert_chat(&row, SyncStatus::Synced)?;
        Ok(true)
    }

    pub fn chat_exists(&self, id: &str) -> Result<bool> {
        chat_exists(self.conn(), id)
    }

    pub fn find_chat(&self, id: &str) -> Result<Option<Chat>> {
        select_chat(self.conn(), self.cipher(), id)
    }

    /// Update the denormalized last-message fields if `at` is not older than
    /// what the chat already shows, and optionally count one more unread.
    ///
    /// Returns `false` when the chat does not exist.
    pub fn bump_chat_last_message(
        &mut self,
        chat_id: &str,
        content: &str,
        at: DateTime<Utc>,
        count_unread: bool,
    ) -> Result<bool> {
        if !self.chat_exists(chat_id)? {
            return Ok(false);
        }

        let sealed = self.cipher().seal(content)?;
        self.conn().execute(
            "UPDATE chats SET last_message_content = ?2, last_message_at = ?3
             WHERE id = ?1 AND (last_message_at IS NULL OR last_message_at <= ?3)",
            params![chat_id, sealed, fmt_ts(&at)],
        )?;
        if count_unread {
            self.conn().execute(
                "UPDATE chats SET unread_count = unread_count + 1 WHERE id = ?1",
                params![chat_id],
            )?;
        }
        self.touch(Table::Chats, chat_id);
        Ok(true)
    }

    /// Zero the unread counter.  Pending push when it changed.
    pub fn clear_chat_unread(&mut self, chat_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET unread_count = 0,
                 sync_status = CASE WHEN sync_status = 'created' THEN 'created' ELSE 'updated' END
             WHERE id = ?1 AND unread_count > 0",
            params![chat_id],
        )?;
        if affected > 0 {
            self.touch(Table::Chats, chat_id);
        }
        Ok(affected > 0)
    }
}

impl Database {
    pub fn get_chat(&self, id: &str) -> Result<Chat> {
        select_chat(self.conn(), self.cipher(), id)?
            .filter(|c| c.sync_status != SyncStatus::Deleted)
            .ok_or(StoreError::NotFound)
    }

    /// Visible chats, most recently active first.
    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        query_chats(self.conn(), self.cipher())
    }

    /// Sum of unread counters across visible chats.
    pub fn total_unread(&self) -> Result<u32> {
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(unread_count), 0) FROM chats WHERE sync_status != 'deleted'",
            [],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }
}

fn chat_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn select_chat(conn: &Connection, cipher: &FieldCipher, id: &str) -> Result<Option<Chat>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            params![id],
            |row| row_to_chat(row, cipher),
        )
        .optional()?)
}

fn query_chats(conn: &Connection, cipher: &FieldCipher) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats
         WHERE sync_status != 'deleted'
         ORDER BY COALESCE(last_message_at, created_at) DESC"
    ))?;
    let rows = stmt.query_map([], |row| row_to_chat(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub(crate) fn query_chats_with_status(
    conn: &Connection,
    cipher: &FieldCipher,
    sync_status: SyncStatus,
) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats WHERE sync_status = ?1"
    ))?;
    let rows = stmt.query_map(params![sync_status.as_str()], |row| row_to_chat(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

impl Record for Chat {
    const TABLE: Table = Table::Chats;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_chats(db.conn(), db.cipher())
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>, cipher: &FieldCipher) -> rusqlite::Result<Chat> {
    let created_at: String = row.get(2)?;
    let sync_status: String = row.get(12)?;

    Ok(Chat {
        id: row.get(0)?,
        match_id: row.get(1)?,
        created_at: parse_ts(2, &created_at)?,
        last_message_content: cipher.open_opt_column(3, row.get(3)?)?,
        last_message_at: parse_opt_ts(4, row.get(4)?)?,
        other_user_id: row.get(5)?,
        other_user_name: row.get(6)?,
        other_user_photo: row.get(7)?,
        place_id: row.get(8)?,
        place_name: row.get(9)?,
        unread_count: row.get(10)?,
        synced_at: parse_opt_ts(11, row.get(11)?)?,
        sync_status: parse_text(12, &sync_status)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;

    pub(crate) fn sample_chat(id: &str) -> Chat {
        Chat {
            id: id.into(),
            match_id: format!("match-{id}"),
            created_at: Utc::now() - Duration::days(1),
            last_message_content: None,
            last_message_at: None,
            other_user_id: Some("them".into()),
            other_user_name: Some("Robin".into()),
            other_user_photo: None,
            place_id: None,
            place_name: None,
            unread_count: 0,
            synced_at: None,
            sync_status: SyncStatus::Synced,
        }
    }

    #[test]
    fn last_message_only_moves_forward() {
        let db = Database::open_in_memory(&[4u8; 32]).unwrap();
        db.write(|w| w.upsert_chat(&sample_chat("c1"), SyncStatus::Synced))
            .unwrap();

        let now = Utc::now();
        db.write(|w| w.bump_chat_last_message("c1", "newer", now, true))
            .unwrap();
        db.write(|w| w.bump_chat_last_message("c1", "older", now - Duration::minutes(5), false))
            .unwrap();

        let chat = db.get_chat("c1").unwrap();
        assert_eq!(chat.last_message_content.as_deref(), Some("newer"));
        assert_eq!(chat.unread_count, 1);

        // The content column is sealed on disk.
        let raw: Vec<u8> = db
            .conn()
            .query_row("SELECT last_message_content FROM chats WHERE id = 'c1'", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.windows(5).any(|w| w == b"newer"));
    }

    #[test]
    fn bump_on_missing_chat_is_a_no_op() {
        let db = Database::open_in_memory(&[4u8; 32]).unwrap();
        assert!(!db
            .write(|w| w.bump_chat_last_message("nope", "hi", Utc::now(), true))
            .unwrap());
    }

    #[test]
    fn clear_unread_marks_pending() {
        let db = Database::open_in_memory(&[4u8; 32]).unwrap();
        let mut chat = sample_chat("c1");
        chat.unread_count = 3;
        db.write(|w| w.upsert_chat(&chat, SyncStatus::Synced)).unwrap();

        assert!(db.write(|w| w.clear_chat_unread("c1")).unwrap());
        assert!(!db.write(|w| w.clear_chat_unread("c1")).unwrap());

        let chat = db.get_chat("c1").unwrap();
        assert_eq!(chat.unread_count, 0);
        assert_eq!(chat.sync_status, SyncStatus::Updated);
        assert_eq!(db.total_unread().unwrap(), 0);
    }

    #[test]
    fn insert_if_absent_keeps_existing_row() {
        let db = Database::open_in_memory(&[4u8; 32]).unwrap();
        let mut chat = sample_chat("c1");
        chat.unread_count = 2;
        assert!(db.write(|w| w.insert_chat_if_absent(&chat)).unwrap());

        chat.unread_count = 0;
        assert!(!db.write(|w| w.insert_chat_if_absent(&chat)).unwrap());
        assert_eq!(db.get_chat("c1").unwrap().unread_count, 2);
    }
}
