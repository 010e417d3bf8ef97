//! Changesets exchanged with the sync endpoints.
//!
//! A [`ChangeSet`] carries created, updated and deleted rows for the three
//! tables the server tracks.  Pulled changesets are applied with
//! [`Writer::apply_changeset`]; outgoing ones are assembled from the
//! `sync_status` column by [`Database::pending_changes`].

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use rendezvous_shared::SyncStatus;

use crate::chats::query_chats_with_status;
use crate::columns::fmt_ts;
use crate::database::{Database, Writer};
use crate::error::{Result, StoreError};
use crate::matches::query_matches_with_status;
use crate::messages::query_messages_with_status;
use crate::models::{Chat, Match, Message};
use crate::observe::Table;

/// Created, updated and deleted rows of one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TableChanges<T> {
    pub created: Vec<T>,
    pub updated: Vec<T>,
    /// Ids only.
    pub deleted: Vec<String>,
}

impl<T> Default for TableChanges<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> TableChanges<T> {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChangeSet {
    pub matches: TableChanges<Match>,
    pub chats: TableChanges<Chat>,
    pub messages: TableChanges<Message>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.matches.len() + self.chats.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop created messages whose id is already in `existing`, and repeated
    /// ids within the changeset.  Returns how many were dropped.
    ///
    /// The local row always wins: it is never overwritten by a duplicate.
    pub fn dedupe_messages(&mut self, existing: &HashSet<String>) -> usize {
        let before = self.messages.created.len();
        let mut seen = HashSet::new();
        self.messages
            .created
            .retain(|m| !existing.contains(&m.id) && seen.insert(m.id.clone()));
        before - self.messages.created.len()
    }

    pub fn created_message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.created.iter().map(|m| m.id.as_str())
    }
}

/// What [`Writer::apply_changeset`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows left alone because they carry unpushed local changes.
    pub skipped_pending: usize,
    /// Messages whose chat is not cached.
    pub orphaned: usize,
    /// Local unsent rows replaced by their server copy.
    pub replaced_temp: usize,
}

impl ApplyStats {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl Writer<'_> {
    /// Apply a pulled changeset.  Applying the same changeset twice leaves
    /// the same rows as applying it once.
    pub fn apply_changeset(&mut self, changes: &ChangeSet, local_user_id: &str) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        let synced_at = Utc::now();

        // Chats first: messages reference them.
        for chat in changes.chats.created.iter().chain(&changes.chats.updated) {
            if self.is_pending(Table::Chats, &chat.id)? {
                stats.skipped_pending += 1;
                continue;
            }
            let existed = self.chat_exists(&chat.id)?;
            let mut row = chat.clone();
            row.synced_at = Some(synced_at);
            self.upsert_chat(&row, SyncStatus::Synced)?;
            count(&mut stats, existed);
        }

        for m in changes.matches.created.iter().chain(&changes.matches.updated) {
            if self.is_pending(Table::Matches, &m.id)? {
                stats.skipped_pending += 1;
                continue;
            }
            let existed = self.find_match(&m.id)?.is_some();
            let mut row = m.clone();
            row.synced_at = Some(synced_at);
            self.upsert_match(&row, SyncStatus::Synced)?;
            count(&mut stats, existed);
        }

        let chats_in_changeset: HashSet<&str> = changes
            .chats
            .created
            .iter()
            .chain(&changes.chats.updated)
            .map(|c| c.id.as_str())
            .collect();

        let created = changes.messages.created.iter().map(|m| (m, true));
        let updated = changes.messages.updated.iter().map(|m| (m, false));
        for (message, is_create) in created.chain(updated) {
            if !self.chat_exists(&message.chat_id)? {
                tracing::debug!(id = %message.id, chat_id = %message.chat_id, "skipping orphan message");
                stats.orphaned += 1;
                continue;
            }

            if let Some(temp_id) = message.temp_id.as_deref() {
                if temp_id != message.id && self.find_unsent_by_temp_id(temp_id)?.is_some() {
                    self.delete_message(temp_id)?;
                    stats.replaced_temp += 1;
                }
            }

            let existed = self.message_exists(&message.id)?;
            if existed && is_create {
                continue;
            }
            if self.is_pending(Table::Messages, &message.id)? {
                stats.skipped_pending += 1;
                continue;
            }

            let mut row = message.clone();
            row.synced_at = Some(synced_at);
            self.upsert_message(&row, SyncStatus::Synced)?;
            count(&mut stats, existed);

            if !existed && !chats_in_changeset.contains(message.chat_id.as_str()) {
                let inbound_unread = message.sender_id != local_user_id && message.read_at.is_none();
                self.bump_chat_last_message(
                    &message.chat_id,
                    &message.content,
                    message.created_at,
                    inbound_unread,
                )?;
            }
        }

        for id in &changes.messages.deleted {
            if self.delete_message(id)? {
                stats.deleted += 1;
            }
        }
        for id in &changes.matches.deleted {
            if self.hard_delete(Table::Matches, id)? {
                stats.deleted += 1;
            }
        }
        for id in &changes.chats.deleted {
            let message_ids = self.message_ids_for_chat(id)?;
            if self.hard_delete(Table::Chats, id)? {
                stats.deleted += 1;
                for message_id in message_ids {
                    self.touch(Table::Messages, message_id);
                }
            }
        }

        tracing::debug!(?stats, "changeset applied");
        Ok(stats)
    }

    /// Mark the rows of a successfully pushed changeset as synced and purge
    /// pushed tombstones.
    pub fn mark_pushed(&mut self, pushed: &ChangeSet) -> Result<usize> {
        let now = fmt_ts(&Utc::now());
        let mut marked = 0;

        let rows = [
            (Table::Matches, row_ids(&pushed.matches, |m| m.id.as_str())),
            (Table::Chats, row_ids(&pushed.chats, |c| c.id.as_str())),
            (Table::Messages, row_ids(&pushed.messages, |m| m.id.as_str())),
        ];
        for (table, ids) in rows {
            for id in ids {
                let affected = self.conn().execute(
                    &format!(
                        "UPDATE {} SET sync_status = 'synced', synced_at = ?2
                         WHERE id = ?1 AND sync_status IN ('created', 'updated')",
                        table.name()
                    ),
                    params![id, now],
                )?;
                if affected > 0 {
                    self.touch(table, id);
                    marked += affected;
                }
            }
        }

        let tombstones = [
            (Table::Matches, &pushed.matches.deleted),
            (Table::Chats, &pushed.chats.deleted),
            (Table::Messages, &pushed.messages.deleted),
        ];
        for (table, ids) in tombstones {
            for id in ids {
                if self.row_sync_status(table, id)? == Some(SyncStatus::Deleted) {
                    self.hard_delete(table, id)?;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    /// Delete a tracked row locally.  Rows the server never saw go at once;
    /// others become tombstones until the next push.
    pub fn tombstone(&mut self, table: Table, id: &str) -> Result<bool> {
        ensure_tracked(table)?;
        match self.row_sync_status(table, id)? {
            None | Some(SyncStatus::Deleted) => Ok(false),
            Some(SyncStatus::Created) => self.hard_delete(table, id),
            Some(_) => {
                self.conn().execute(
                    &format!("UPDATE {} SET sync_status = 'deleted' WHERE id = ?1", table.name()),
                    params![id],
                )?;
                self.touch(table, id);
                Ok(true)
            }
        }
    }

    pub fn row_sync_status(&self, table: Table, id: &str) -> Result<Option<SyncStatus>> {
        ensure_tracked(table)?;
        let status: Option<String> = self
            .conn()
            .query_row(
                &format!("SELECT sync_status FROM {} WHERE id = ?1", table.name()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| s.parse::<SyncStatus>().map_err(|e| StoreError::Invalid(format!("{e}"))))
            .transpose()
    }

    fn is_pending(&self, table: Table, id: &str) -> Result<bool> {
        Ok(self
            .row_sync_status(table, id)?
            .map_or(false, |s| s.is_pending()))
    }

    fn hard_delete(&mut self, table: Table, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table.name()), params![id])?;
        if affected > 0 {
            self.touch(table, id);
        }
        Ok(affected > 0)
    }

    fn message_ids_for_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM messages WHERE chat_id = ?1")?;
        let rows = stmt.query_map(params![chat_id], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

impl Database {
    /// Every local change not yet pushed.
    pub fn pending_changes(&self) -> Result<ChangeSet> {
        let conn = self.conn();
        let cipher = self.cipher();
        Ok(ChangeSet {
            matches: TableChanges {
                created: query_matches_with_status(conn, SyncStatus::Created)?,
                updated: query_matches_with_status(conn, SyncStatus::Updated)?,
                deleted: self.tombstone_ids(Table::Matches)?,
            },
            chats: TableChanges {
                created: query_chats_with_status(conn, cipher, SyncStatus::Created)?,
                updated: query_chats_with_status(conn, cipher, SyncStatus::Updated)?,
                deleted: self.tombstone_ids(Table::Chats)?,
            },
            messages: TableChanges {
                created: query_messages_with_status(conn, cipher, SyncStatus::Created)?,
                updated: query_messages_with_status(conn, cipher, SyncStatus::Updated)?,
                deleted: self.tombstone_ids(Table::Messages)?,
            },
        })
    }

    /// Every id present locally in `table`, tombstones included.  Sent with
    /// each pull so the server can report rows it no longer has.
    pub fn local_ids(&self, table: Table) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM {} ORDER BY {}",
            table.key_column(),
            table.name(),
            table.key_column()
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Subset of `ids` already stored as messages.
    pub fn existing_message_ids<'i>(
        &self,
        ids: impl IntoIterator<Item = &'i str>,
    ) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        let mut stmt = self.conn().prepare("SELECT 1 FROM messages WHERE id = ?1")?;
        for id in ids {
            if stmt.exists(params![id])? {
                found.insert(id.to_string());
            }
        }
        Ok(found)
    }

    fn tombstone_ids(&self, table: Table) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT id FROM {} WHERE sync_status = 'deleted'",
            table.name()
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

fn count(stats: &mut ApplyStats, existed: bool) {
    if existed {
        stats.updated += 1;
    } else {
        stats.created += 1;
    }
}

fn row_ids<'c, T, F>(changes: &'c TableChanges<T>, id: F) -> Vec<&'c str>
where
    F: Fn(&T) -> &str,
{
    changes.created.iter().chain(&changes.updated).map(id).collect()
}

fn ensure_tracked(table: Table) -> Result<()> {
    match table {
        Table::Matches | Table::Chats | Table::Messages => Ok(()),
        other => Err(StoreError::Invalid(format!(
            "{} has no change tracking",
            other.name()
        ))),
    }
}
