//! CRUD operations for [`Match`] records.
//!
//! Two invariants are enforced in SQL so that every write path honours them:
//! `unmatched` is terminal, and each side's opened timestamp is set once.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use rendezvous_shared::{MatchStatus, SyncStatus};

use crate::columns::{
    fmt_opt_ts, fmt_ts, opt_json_text, parse_opt_json, parse_opt_ts, parse_text, parse_ts,
};
use crate::database::{Database, Writer};
use crate::error::{Result, StoreError};
use crate::models::Match;
use crate::observe::{Record, Table};

const MATCH_COLUMNS: &str = "id, chat_id, user_a, user_b, status, matched_at, unmatched_at, \
     place_id, place_name, user_a_opened_at, user_b_opened_at, other_user_id, other_user_name, \
     other_user_photo, match_origin, match_metadata, first_message_at, synced_at, sync_status";

const UPSERT_SQL: &str = "INSERT INTO matches (
        id, chat_id, user_a, user_b, status, matched_at, unmatched_at, place_id, place_name,
        user_a_opened_at, user_b_opened_at, other_user_id, other_user_name, other_user_photo,
        match_origin, match_metadata, first_message_at, synced_at, sync_status)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
     ON CONFLICT(id) DO UPDATE SET
        chat_id          = COALESCE(excluded.chat_id, matches.chat_id),
        user_a           = excluded.user_a,
        user_b           = excluded.user_b,
        status           = CASE WHEN matches.status = 'unmatched' THEN 'unmatched'
                                ELSE excluded.status END,
        matched_at       = excluded.matched_at,
        unmatched_at     = COALESCE(matches.unmatched_at, excluded.unmatched_at),
        place_id         = excluded.place_id,
        place_name       = excluded.place_name,
        user_a_opened_at = COALESCE(matches.user_a_opened_at, excluded.user_a_opened_at),
        user_b_opened_at = COALESCE(matches.user_b_opened_at, excluded.user_b_opened_at),
        other_user_id    = excluded.other_user_id,
        other_user_name  = excluded.other_user_name,
        other_user_photo = excluded.other_user_photo,
        match_origin     = excluded.match_origin,
        match_metadata   = excluded.match_metadata,
        first_message_at = COALESCE(matches.first_message_at, excluded.first_message_at),
        synced_at        = excluded.synced_at,
        sync_status      = excluded.sync_status";

/// Partial update carried by a realtime `match_update` event.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchPatch {
    pub status: Option<MatchStatus>,
    pub unmatched_at: Option<DateTime<Utc>>,
    pub chat_id: Option<String>,
    pub user_a_opened_at: Option<DateTime<Utc>>,
    pub user_b_opened_at: Option<DateTime<Utc>>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub other_user_name: Option<String>,
    pub other_user_photo: Option<String>,
    pub place_name: Option<String>,
    pub match_metadata: Option<serde_json::Value>,
}

impl MatchPatch {
    /// Merge into `m`, honouring the terminal status and set-once timestamps.
    pub fn apply_to(&self, m: &mut Match) {
        if let Some(status) = self.status {
            if m.status.can_transition_to(status) {
                m.status = status;
            }
        }
        m.unmatched_at = m.unmatched_at.or(self.unmatched_at);
        m.user_a_opened_at = m.user_a_opened_at.or(self.user_a_opened_at);
        m.user_b_opened_at = m.user_b_opened_at.or(self.user_b_opened_at);
        m.first_message_at = m.first_message_at.or(self.first_message_at);
        if self.chat_id.is_some() {
            m.chat_id = self.chat_id.clone();
        }
        if self.other_user_name.is_some() {
            m.other_user_name = self.other_user_name.clone();
        }
        if self.other_user_photo.is_some() {
            m.other_user_photo = self.other_user_photo.clone();
        }
        if self.place_name.is_some() {
            m.place_name = self.place_name.clone();
        }
        if self.match_metadata.is_some() {
            m.match_metadata = self.match_metadata.clone();
        }
    }
}

impl Writer<'_> {
    /// Insert or update a match with an explicit local sync status.
    pub fn upsert_match(&mut self, m: &Match, sync_status: SyncStatus) -> Result<()> {
        self.conn().execute(
            UPSERT_SQL,
            params![
                m.id,
                m.chat_id,
                m.user_a,
                m.user_b,
                m.status.as_str(),
                fmt_ts(&m.matched_at),
                fmt_opt_ts(&m.unmatched_at),
                m.place_id,
                m.place_name,
                fmt_opt_ts(&m.user_a_opened_at),
                fmt_opt_ts(&m.user_b_opened_at),
                m.other_user_id,
                m.other_user_name,
                m.other_user_photo,
                m.match_origin,
                opt_json_text(&m.match_metadata),
                fmt_opt_ts(&m.first_message_at),
                fmt_opt_ts(&m.synced_at),
                sync_status.as_str(),
            ],
        )?;
        self.touch(Table::Matches, m.id.clone());
        Ok(())
    }

    /// Insert `m` as synced unless a row with its id already exists.
    pub fn insert_match_if_absent(&mut self, m: &Match) -> Result<bool> {
        if self.find_match(&m.id)?.is_some() {
            return Ok(false);
        }
        let mut row = m.clone();
        row.synced_at = Some(Utc::now());
        self.upsert_match(&row, SyncStatus::Synced)?;
        Ok(true)
    }

    pub fn find_match(&self, id: &str) -> Result<Option<Match>> {
        select_match(self.conn(), id)
    }

    /// Apply a server-originated partial update.  Returns `false` when the
    /// match is not cached locally.
    pub fn patch_match(&mut self, id: &str, patch: &MatchPatch) -> Result<bool> {
        let Some(mut m) = self.find_match(id)? else {
            return Ok(false);
        };
        patch.apply_to(&mut m);
        let status = m.sync_status;
        self.upsert_match(&m, status)?;
        Ok(true)
    }

    /// Record that `user_id` opened the match.  Set-once; pending push.
    pub fn mark_match_opened(&mut self, id: &str, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let m = self.find_match(id)?.ok_or(StoreError::NotFound)?;
        let column = if m.user_a == user_id {
            "user_a_opened_at"
        } else if m.user_b == user_id {
            "user_b_opened_at"
        } else {
            return Err(StoreError::Invalid(format!(
                "user {user_id} is not part of match {id}"
            )));
        };

        let affected = self.conn().execute(
            &format!(
                "UPDATE matches SET {column} = ?2,
                     sync_status = CASE WHEN sync_status = 'created' THEN 'created' ELSE 'updated' END
                 WHERE id = ?1 AND {column} IS NULL"
            ),
            params![id, fmt_ts(&at)],
        )?;
        if affected > 0 {
            self.touch(Table::Matches, id);
        }
        Ok(affected > 0)
    }

    /// Terminal transition to `unmatched`.  Pending push.
    pub fn unmatch(&mut self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE matches SET status = 'unmatched', unmatched_at = ?2,
                 sync_status = CASE WHEN sync_status = 'created' THEN 'created' ELSE 'updated' END
             WHERE id = ?1 AND status = 'active'",
            params![id, fmt_ts(&at)],
        )?;
        if affected > 0 {
            self.touch(Table::Matches, id);
        }
        Ok(affected > 0)
    }
}

impl Database {
    /// Fetch a visible match by id.
    pub fn get_match(&self, id: &str) -> Result<Match> {
        select_match(self.conn(), id)?
            .filter(|m| m.sync_status != SyncStatus::Deleted)
            .ok_or(StoreError::NotFound)
    }

    /// Visible matches, most recent first.
    pub fn list_matches(&self) -> Result<Vec<Match>> {
        query_matches(self.conn())
    }

    /// Visible matches in `status`.
    pub fn list_matches_by_status(&self, status: MatchStatus) -> Result<Vec<Match>> {
        Ok(query_matches(self.conn())?
            .into_iter()
            .filter(|m| m.status == status)
            .collect())
    }

    pub fn find_match_for_chat(&self, chat_id: &str) -> Result<Option<Match>> {
        Ok(query_matches(self.conn())?
            .into_iter()
            .find(|m| m.chat_id.as_deref() == Some(chat_id)))
    }
}

fn select_match(conn: &Connection, id: &str) -> Result<Option<Match>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?1"),
            params![id],
            row_to_match,
        )
        .optional()?)
}

fn query_matches(conn: &Connection) -> Result<Vec<Match>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MATCH_COLUMNS} FROM matches
         WHERE sync_status != 'deleted'
         ORDER BY matched_at DESC"
    ))?;
    let rows = stmt.query_map([], row_to_match)?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub(crate) fn query_matches_with_status(conn: &Connection, sync_status: SyncStatus) -> Result<Vec<Match>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MATCH_COLUMNS} FROM matches WHERE sync_status = ?1"
    ))?;
    let rows = stmt.query_map(params![sync_status.as_str()], row_to_match)?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

impl Record for Match {
    const TABLE: Table = Table::Matches;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_matches(db.conn())
    }
}

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<Match> {
    let status: String = row.get(4)?;
    let matched_at: String = row.get(5)?;
    let metadata: Option<String> = row.get(15)?;
    let sync_status: String = row.get(18)?;

    Ok(Match {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_a: row.get(2)?,
        user_b: row.get(3)?,
        status: parse_text(4, &status)?,
        matched_at: parse_ts(5, &matched_at)?,
        unmatched_at: parse_opt_ts(6, row.get(6)?)?,
        place_id: row.get(7)?,
        place_name: row.get(8)?,
        user_a_opened_at: parse_opt_ts(9, row.get(9)?)?,
        user_b_opened_at: parse_opt_ts(10, row.get(10)?)?,
        other_user_id: row.get(11)?,
        other_user_name: row.get(12)?,
        other_user_photo: row.get(13)?,
        match_origin: row.get(14)?,
        match_metadata: parse_opt_json(15, metadata)?,
        first_message_at: parse_opt_ts(16, row.get(16)?)?,
        synced_at: parse_opt_ts(17, row.get(17)?)?,
        sync_status: parse_text(18, &sync_status)?,
    })
}
