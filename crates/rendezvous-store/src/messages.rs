//! CRUD operations for [`Message`] records.
//!
//! Outgoing messages start life under their client-generated `temp_id` and are
//! re-keyed to the server id once the send is confirmed.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use rendezvous_shared::{MessageStatus, SyncStatus};

use crate::columns::{fmt_opt_ts, fmt_ts, parse_opt_ts, parse_text, parse_ts, FieldCipher};
use crate::database::{Database, Writer};
use crate::error::{Result, StoreError};
use crate::models::Message;
use crate::observe::{Record, Table};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, content, created_at, read_at, status, temp_id, synced_at, sync_status";

impl Writer<'_> {
    /// Plain insert.  Fails with a unique violation if the id already exists.
    pub fn insert_message(&mut self, message: &Message, sync_status: SyncStatus) -> Result<()> {
        let sealed = self.cipher().seal(&message.content)?;
        self.conn().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                message.id,
                message.chat_id,
                message.sender_id,
                sealed,
                fmt_ts(&message.created_at),
                fmt_opt_ts(&message.read_at),
                message.status.as_str(),
                message.temp_id,
                fmt_opt_ts(&message.synced_at),
                sync_status.as_str(),
            ],
        )?;
        self.touch(Table::Messages, message.id.clone());
        Ok(())
    }

    /// Insert or update.  `read_at` is set once and never cleared.
    pub fn upsert_message(&mut self, message: &Message, sync_status: SyncStatus) -> Result<()> {
        let sealed = self.cipher().seal(&message.content)?;
        self.conn().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    chat_id     = excluded.chat_id,
                    sender_id   = excluded.sender_id,
                    content     = excluded.content,
                    created_at  = excluded.created_at,
                    read_at     = COALESCE(messages.read_at, excluded.read_at),
                    status      = excluded.status,
                    temp_id     = COALESCE(excluded.temp_id, messages.temp_id),
                    synced_at   = excluded.synced_at,
                    sync_status = excluded.sync_status"
            ),
            params![
                message.id,
                message.chat_id,
                message.sender_id,
                sealed,
                fmt_ts(&message.created_at),
                fmt_opt_ts(&message.read_at),
                message.status.as_str(),
                message.temp_id,
                fmt_opt_ts(&message.synced_at),
                sync_status.as_str(),
            ],
        )?;
        self.touch(Table::Messages, message.id.clone());
        Ok(())
    }

    pub fn message_exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .conn()
            .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn find_message(&self, id: &str) -> Result<Option<Message>> {
        select_message(self.conn(), self.cipher(), "id", id)
    }

    /// The local row still keyed by its client id, if any.
    pub fn find_unsent_by_temp_id(&self, temp_id: &str) -> Result<Option<Message>> {
        Ok(select_message(self.conn(), self.cipher(), "temp_id", temp_id)?
            .filter(|m| m.id == temp_id))
    }

    /// Re-key a locally sent message to the id the server assigned.
    ///
    /// When the server row already arrived by another path (pull or
    /// broadcast) the temporary row is dropped instead.
    pub fn confirm_message(
        &mut self,
        temp_id: &str,
        server_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.find_unsent_by_temp_id(temp_id)?.is_none() {
            return Ok(false);
        }

        if temp_id != server_id && self.message_exists(server_id)? {
            self.conn()
                .execute("DELETE FROM messages WHERE id = ?1", params![temp_id])?;
            self.conn().execute(
                "UPDATE messages SET temp_id = COALESCE(temp_id, ?2) WHERE id = ?1",
                params![server_id, temp_id],
            )?;
        } else {
            self.conn().execute(
                "UPDATE messages SET id = ?2, status = 'sent', created_at = ?3,
                     synced_at = ?4, sync_status = 'synced'
                 WHERE id = ?1",
                params![temp_id, server_id, fmt_ts(&created_at), fmt_ts(&Utc::now())],
            )?;
        }
        self.touch(Table::Messages, temp_id);
        self.touch(Table::Messages, server_id);
        Ok(true)
    }

    pub fn set_message_status(&mut self, id: &str, status: MessageStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if affected > 0 {
            self.touch(Table::Messages, id);
        }
        Ok(affected > 0)
    }

    /// Mark every outgoing message of `sender_id` still `pending` as
    /// `failed`.  Only valid when no send can be in progress, i.e. right
    /// after the store is opened.
    pub fn fail_unsent_messages(&mut self, sender_id: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT id FROM messages WHERE sender_id = ?1 AND status = 'pending'",
            )?;
            let rows = stmt.query_map(params![sender_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for id in &ids {
            self.conn().execute(
                "UPDATE messages SET status = 'failed' WHERE id = ?1",
                params![id],
            )?;
            self.touch(Table::Messages, id.clone());
        }
        Ok(ids.len())
    }

    /// Set `read_at` on every unread message in the chat not sent by
    /// `local_user_id`.  Each one becomes pending push.
    pub fn mark_inbound_read(
        &mut self,
        chat_id: &str,
        local_user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT id FROM messages
                 WHERE chat_id = ?1 AND sender_id != ?2 AND read_at IS NULL
                   AND sync_status != 'deleted'",
            )?;
            let rows = stmt.query_map(params![chat_id, local_user_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for id in &ids {
            self.conn().execute(
                "UPDATE messages SET read_at = ?2, status = 'read',
                     sync_status = CASE WHEN sync_status = 'created' THEN 'created' ELSE 'updated' END
                 WHERE id = ?1",
                params![id, fmt_ts(&at)],
            )?;
            self.touch(Table::Messages, id.clone());
        }
        Ok(ids.len())
    }

    /// Remove a row outright, without a tombstone.
    pub fn delete_message(&mut self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        if affected > 0 {
            self.touch(Table::Messages, id);
        }
        Ok(affected > 0)
    }
}

impl Database {
    pub fn get_message(&self, id: &str) -> Result<Message> {
        select_message(self.conn(), self.cipher(), "id", id)?
            .filter(|m| m.sync_status != SyncStatus::Deleted)
            .ok_or(StoreError::NotFound)
    }

    /// Visible messages of a chat in conversation order.
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ?1 AND sync_status != 'deleted'
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![chat_id], |row| row_to_message(row, self.cipher()))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn failed_messages(&self) -> Result<Vec<Message>> {
        Ok(query_messages(self.conn(), self.cipher())?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .collect())
    }
}

fn select_message(
    conn: &Connection,
    cipher: &FieldCipher,
    column: &str,
    value: &str,
) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1 LIMIT 1"),
            params![value],
            |row| row_to_message(row, cipher),
        )
        .optional()?)
}

fn query_messages(conn: &Connection, cipher: &FieldCipher) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE sync_status != 'deleted'
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([], |row| row_to_message(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Rows with unpushed changes.  Unsent outgoing messages travel through the
/// send endpoint instead and are left out.
pub(crate) fn query_messages_with_status(
    conn: &Connection,
    cipher: &FieldCipher,
    sync_status: SyncStatus,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE sync_status = ?1 AND status NOT IN ('pending', 'failed')"
    ))?;
    let rows = stmt.query_map(params![sync_status.as_str()], |row| row_to_message(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

impl Record for Message {
    const TABLE: Table = Table::Messages;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_messages(db.conn(), db.cipher())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>, cipher: &FieldCipher) -> rusqlite::Result<Message> {
    let content: Vec<u8> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let status: String = row.get(6)?;
    let sync_status: String = row.get(9)?;

    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: cipher.open_column(3, &content)?,
        created_at: parse_ts(4, &created_at)?,
        read_at: parse_opt_ts(5, row.get(5)?)?,
        status: parse_text(6, &status)?,
        temp_id: row.get(7)?,
        synced_at: parse_opt_ts(8, row.get(8)?)?,
        sync_status: parse_text(9, &sync_status)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chats::tests::sample_chat;

    pub(crate) fn sample_message(id: &str, chat_id: &str, sender: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: sender.into(),
            content: format!("hello from {sender}"),
            created_at: Utc::now(),
            read_at: None,
            status: MessageStatus::Sent,
            temp_id: None,
            synced_at: None,
            sync_status: SyncStatus::Synced,
        }
    }

    fn db_with_chat() -> Database {
        let db = Database::open_in_memory(&[5u8; 32]).unwrap();
        db.write(|w| w.upsert_chat(&sample_chat("c1"), SyncStatus::Synced))
            .unwrap();
        db
    }

    #[test]
    fn unsent_messages_of_sender_are_failed() {
        let db = db_with_chat();
        let mut mine = sample_message("t1", "c1", "me");
        mine.status = MessageStatus::Pending;
        let mut theirs = sample_message("t2", "c1", "them");
        theirs.status = MessageStatus::Pending;
        db.write(|w| {
            w.insert_message(&mine, SyncStatus::Created)?;
            w.insert_message(&theirs, SyncStatus::Synced)?;
            w.insert_message(&sample_message("s1", "c1", "me"), SyncStatus::Synced)
        })
        .unwrap();

        assert_eq!(db.write(|w| w.fail_unsent_messages("me")).unwrap(), 1);
        assert_eq!(db.get_message("t1").unwrap().status, MessageStatus::Failed);
        assert_eq!(db.get_message("t2").unwrap().status, MessageStatus::Pending);
        assert_eq!(db.get_message("s1").unwrap().status, MessageStatus::Sent);
        assert_eq!(db.write(|w| w.fail_unsent_messages("me")).unwrap(), 0);
    }

    #[test]
    fn duplicate_insert_is_unique_violation() {
        let db = db_with_chat();
        let msg = sample_message("m1", "c1", "them");
        db.write(|w| w.insert_message(&msg, SyncStatus::Synced)).unwrap();

        let err = db
            .write(|w| w.insert_message(&msg, SyncStatus::Synced))
            .unwrap_err();
        assert!(err.is_unique_violation(), "unexpected error: {err}");
        assert_eq!(db.messages_for_chat("c1").unwrap().len(), 1);
    }

    #[test]
    fn message_requires_existing_chat() {
        let db = db_with_chat();
        let msg = sample_message("m1", "missing", "them");
        assert!(db.write(|w| w.insert_message(&msg, SyncStatus::Synced)).is_err());
    }

    #[test]
    fn confirm_rekeys_or_drops_temp_row() {
        let db = db_with_chat();
        let mut local = sample_message("tmp-1", "c1", "me");
        local.status = MessageStatus::Pending;
        local.temp_id = Some("tmp-1".into());
        db.write(|w| w.insert_message(&local, SyncStatus::Created)).unwrap();

        assert!(db
            .write(|w| w.confirm_message("tmp-1", "srv-1", Utc::now()))
            .unwrap());
        let confirmed = db.get_message("srv-1").unwrap();
        assert_eq!(confirmed.status, MessageStatus::Sent);
        assert_eq!(confirmed.temp_id.as_deref(), Some("tmp-1"));
        assert!(db.get_message("tmp-1").is_err());

        // Second outgoing message whose server copy was pulled first.
        let mut local = sample_message("tmp-2", "c1", "me");
        local.status = MessageStatus::Pending;
        local.temp_id = Some("tmp-2".into());
        db.write(|w| w.insert_message(&local, SyncStatus::Created)).unwrap();
        db.write(|w| w.insert_message(&sample_message("srv-2", "c1", "me"), SyncStatus::Synced))
            .unwrap();

        db.write(|w| w.confirm_message("tmp-2", "srv-2", Utc::now()))
            .unwrap();
        let ids: Vec<_> = db
            .messages_for_chat("c1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"srv-2".to_string()));
        assert!(!ids.contains(&"tmp-2".to_string()));
    }

    #[test]
    fn mark_inbound_read_skips_own_messages() {
        let db = db_with_chat();
        db.write(|w| {
            w.insert_message(&sample_message("a", "c1", "them"), SyncStatus::Synced)?;
            w.insert_message(&sample_message("b", "c1", "me"), SyncStatus::Synced)
        })
        .unwrap();

        let at = Utc::now();
        assert_eq!(db.write(|w| w.mark_inbound_read("c1", "me", at)).unwrap(), 1);
        assert_eq!(db.write(|w| w.mark_inbound_read("c1", "me", at)).unwrap(), 0);

        let inbound = db.get_message("a").unwrap();
        assert!(inbound.read_at.is_some());
        assert_eq!(inbound.sync_status, SyncStatus::Updated);
        assert!(db.get_message("b").unwrap().read_at.is_none());
    }
}
