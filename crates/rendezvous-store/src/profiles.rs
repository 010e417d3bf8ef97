//! CRUD operations for [`Profile`] and [`DiscoveryProfile`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::columns::{fmt_ts, parse_ts, FieldCipher};
use crate::database::{Database, Writer};
use crate::error::Result;
use crate::models::{DiscoveryProfile, Profile};
use crate::observe::{Record, Table};

const PROFILE_COLUMNS: &str = "id, user_id, raw_data, last_fetched_at, created_at";
const DISCOVERY_COLUMNS: &str =
    "id, user_id, raw_data, place_id, last_fetched_at, is_dismissed, created_at";

impl Writer<'_> {
    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Insert or refresh the cached profile of `profile.user_id`.
    ///
    /// An older fetch never overwrites a newer one, so `last_fetched_at`
    /// only moves forward.  Returns `true` if the row changed.
    pub fn upsert_profile(&mut self, profile: &Profile) -> Result<bool> {
        let raw = self.cipher().seal(&profile.raw_data)?;
        let affected = self.conn().execute(
            "INSERT INTO profiles (id, user_id, raw_data, last_fetched_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                 raw_data = excluded.raw_data,
                 last_fetched_at = excluded.last_fetched_at
             WHERE excluded.last_fetched_at >= profiles.last_fetched_at",
            params![
                profile.id,
                profile.user_id,
                raw,
                fmt_ts(&profile.last_fetched_at),
                fmt_ts(&profile.created_at),
            ],
        )?;

        if affected > 0 {
            let id: String = self.conn().query_row(
                "SELECT id FROM profiles WHERE user_id = ?1",
                params![profile.user_id],
                |row| row.get(0),
            )?;
            self.touch(Table::Profiles, id);
        }
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Discovery feed
    // ------------------------------------------------------------------

    pub fn insert_discovery_profile(&mut self, card: &DiscoveryProfile) -> Result<()> {
        let raw = self.cipher().seal(&card.raw_data)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO discovery_profiles
                 (id, user_id, raw_data, place_id, last_fetched_at, is_dismissed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                card.id,
                card.user_id,
                raw,
                card.place_id,
                fmt_ts(&card.last_fetched_at),
                card.is_dismissed as i32,
                fmt_ts(&card.created_at),
            ],
        )?;
        self.touch(Table::DiscoveryProfiles, card.id.clone());
        Ok(())
    }

    /// Replace the cached feed of a place with a freshly fetched one.
    pub fn replace_discovery_feed(
        &mut self,
        place_id: &str,
        cards: &[DiscoveryProfile],
    ) -> Result<usize> {
        let stale: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT id FROM discovery_profiles WHERE place_id = ?1")?;
            let rows = stmt.query_map(params![place_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        self.conn().execute(
            "DELETE FROM discovery_profiles WHERE place_id = ?1",
            params![place_id],
        )?;
        for id in stale {
            self.touch(Table::DiscoveryProfiles, id);
        }

        for card in cards {
            self.insert_discovery_profile(card)?;
        }
        Ok(cards.len())
    }

    /// Remove every card showing `user_id`, in any place.  Used for the
    /// optimistic removal after a swipe and for explicit dismissal.
    pub fn delete_discovery_for_user(&mut self, user_id: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT id FROM discovery_profiles WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        self.conn().execute(
            "DELETE FROM discovery_profiles WHERE user_id = ?1",
            params![user_id],
        )?;
        let count = ids.len();
        for id in ids {
            self.touch(Table::DiscoveryProfiles, id);
        }
        Ok(count)
    }
}

impl Database {
    pub fn get_profile_by_user(&self, user_id: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1");
        let cipher = self.cipher();
        Ok(self
            .conn()
            .query_row(&sql, params![user_id], |row| row_to_profile(row, cipher))
            .optional()?)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        query_profiles(self.conn(), self.cipher())
    }

    pub fn upsert_profile(&self, profile: &Profile) -> Result<bool> {
        self.write(|w| w.upsert_profile(profile))
    }

    /// Visible (non-dismissed) cards for a place, oldest first.
    pub fn discovery_feed(&self, place_id: &str) -> Result<Vec<DiscoveryProfile>> {
        let sql = format!(
            "SELECT {DISCOVERY_COLUMNS} FROM discovery_profiles
             WHERE place_id = ?1 AND is_dismissed = 0
             ORDER BY created_at ASC, id ASC"
        );
        let cipher = self.cipher();
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![place_id], |row| row_to_discovery(row, cipher))?;

        let mut cards = Vec::new();
        for row in rows {
            cards.push(row?);
        }
        Ok(cards)
    }

    /// When the feed of a place was last fetched, if it is cached at all.
    pub fn discovery_fetched_at(&self, place_id: &str) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<String> = self.conn().query_row(
            "SELECT MIN(last_fetched_at) FROM discovery_profiles WHERE place_id = ?1",
            params![place_id],
            |row| row.get(0),
        )?;
        Ok(ts.map(|s| parse_ts(0, &s)).transpose()?)
    }

    pub fn delete_discovery_for_user(&self, user_id: &str) -> Result<usize> {
        self.write(|w| w.delete_discovery_for_user(user_id))
    }
}

fn query_profiles(conn: &Connection, cipher: &FieldCipher) -> Result<Vec<Profile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY last_fetched_at DESC"
    ))?;
    let rows = stmt.query_map([], |row| row_to_profile(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn query_discovery(conn: &Connection, cipher: &FieldCipher) -> Result<Vec<DiscoveryProfile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DISCOVERY_COLUMNS} FROM discovery_profiles ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([], |row| row_to_discovery(row, cipher))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

impl Record for Profile {
    const TABLE: Table = Table::Profiles;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_profiles(db.conn(), db.cipher())
    }
}

impl Record for DiscoveryProfile {
    const TABLE: Table = Table::DiscoveryProfiles;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn load_all(db: &Database) -> Result<Vec<Self>> {
        query_discovery(db.conn(), db.cipher())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_profile(row: &rusqlite::Row<'_>, cipher: &FieldCipher) -> rusqlite::Result<Profile> {
    let raw: Vec<u8> = row.get(2)?;
    let fetched: String = row.get(3)?;
    let created: String = row.get(4)?;

    Ok(Profile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        raw_data: cipher.open_column(2, &raw)?,
        last_fetched_at: parse_ts(3, &fetched)?,
        created_at: parse_ts(4, &created)?,
    })
}

fn row_to_discovery(
    row: &rusqlite::Row<'_>,
    cipher: &FieldCipher,
) -> rusqlite::Result<DiscoveryProfile> {
    let raw: Vec<u8> = row.get(2)?;
    let fetched: String = row.get(4)?;
    let dismissed: i32 = row.get(5)?;
    let created: String = row.get(6)?;

    Ok(DiscoveryProfile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        raw_data: cipher.open_column(2, &raw)?,
        place_id: row.get(3)?,
        last_fetched_at: parse_ts(4, &fetched)?,
        is_dismissed: dismissed != 0,
        created_at: parse_ts(6, &created)?,
    })
}
