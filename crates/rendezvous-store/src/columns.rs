//! Column encoding shared by the per-table modules.
//!
//! Timestamps are stored as fixed-width RFC-3339 (`...T12:00:00.000Z`) so that
//! SQL string comparison orders them correctly.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

use rendezvous_shared::crypto::{self, SymmetricKey};

use crate::error::Result;

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(fmt_ts)
}

fn conversion_err<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_text<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>().map_err(|e| conversion_err(idx, Type::Text, e))
}

pub(crate) fn parse_opt_json(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<serde_json::Value>> {
    s.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(idx, Type::Text, e)))
        .transpose()
}

pub(crate) fn opt_json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

/// Seals and opens the encrypted columns of a single database.
pub(crate) struct FieldCipher {
    key: SymmetricKey,
}

impl FieldCipher {
    pub(crate) fn new(store_key: &SymmetricKey) -> Self {
        Self {
            key: crypto::derive_field_key(store_key),
        }
    }

    pub(crate) fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        Ok(crypto::encrypt(&self.key, plaintext.as_bytes())?)
    }

    pub(crate) fn seal_opt(&self, plaintext: Option<&str>) -> Result<Option<Vec<u8>>> {
        plaintext.map(|p| self.seal(p)).transpose()
    }

    pub(crate) fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(crypto::encrypt(&self.key, plaintext)?)
    }

    pub(crate) fn open_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(crypto::decrypt(&self.key, sealed)?)
    }

    /// Decrypt a column while mapping a row.
    pub(crate) fn open_column(&self, idx: usize, sealed: &[u8]) -> rusqlite::Result<String> {
        let plain = crypto::decrypt(&self.key, sealed).map_err(|e| conversion_err(idx, Type::Blob, e))?;
        String::from_utf8(plain).map_err(|e| conversion_err(idx, Type::Blob, e))
    }

    pub(crate) fn open_opt_column(
        &self,
        idx: usize,
        sealed: Option<Vec<u8>>,
    ) -> rusqlite::Result<Option<String>> {
        sealed.map(|s| self.open_column(idx, &s)).transpose()
    }
}
