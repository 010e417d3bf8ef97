//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run and the store key is verified before any other
//! operation.  Mutations go through [`Database::write`], which hands a
//! [`Writer`] to a closure running inside one transaction.
//!
//! Without the `sqlcipher` feature the file itself is plain SQLite and only
//! the sensitive columns are sealed with XChaCha20-Poly1305.  With it, the
//! whole file is keyed via `PRAGMA key` as well.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use rendezvous_shared::constants::KEY_CHECK_PLAINTEXT;
use rendezvous_shared::crypto::SymmetricKey;

use crate::columns::FieldCipher;
use crate::error::{Result, StoreError};
use crate::migrations;
use crate::observe::{Observers, Table, Touched};

const KEY_CHECK: &str = "key_check";

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    cipher: FieldCipher,
    observers: Observers,
}

impl Database {
    /// Platform-appropriate location of the default database file:
    /// - Linux:   `~/.local/share/rendezvous/rendezvous.db`
    /// - macOS:   `~/Library/Application Support/app.rendezvous.rendezvous/rendezvous.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\rendezvous\rendezvous\data\rendezvous.db`
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("app", "rendezvous", "rendezvous").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join("rendezvous.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path, key: &SymmetricKey) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::init(conn, key)
    }

    /// Open a throwaway in-memory database.  Used by tests and by sessions
    /// that must not touch disk.
    pub fn open_in_memory(key: &SymmetricKey) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, key)
    }

    fn init(conn: Connection, key: &SymmetricKey) -> Result<Self> {
        #[cfg(feature = "sqlcipher")]
        conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", hex::encode(key)))?;

        // With SQLCipher this is the first statement that reads the file, so a
        // wrong key surfaces here as SQLITE_NOTADB.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        let db = Self {
            conn,
            cipher: FieldCipher::new(key),
            observers: Observers::default(),
        };
        db.verify_key()?;
        Ok(db)
    }

    /// Check the sealed canary, writing it on first open.
    fn verify_key(&self) -> Result<()> {
        let sealed: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![KEY_CHECK],
                |row| row.get(0),
            )
            .optional()?;

        match sealed {
            Some(sealed) => match self.cipher.open_bytes(&sealed) {
                Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(()),
                _ => Err(StoreError::CipherMismatch),
            },
            None => {
                let sealed = self.cipher.seal_bytes(KEY_CHECK_PLAINTEXT)?;
                self.conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                    params![KEY_CHECK, sealed],
                )?;
                Ok(())
            }
        }
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed helpers; writing through this
    /// connection bypasses observer notification.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Run `f` inside a single transaction.
    ///
    /// Either every change made through the [`Writer`] commits or none does.
    /// After commit, observers whose tables were touched are re-evaluated
    /// synchronously on this thread, while the caller still holds whatever
    /// lock guards this `Database`.  Callbacks must not re-enter the store at
    /// all: no writes, and no reads through a wrapper that takes that lock
    /// again (such as `AppContext::with_db` in the client).
    pub fn write<R>(&self, f: impl FnOnce(&mut Writer<'_>) -> Result<R>) -> Result<R> {
        let tx = self.conn.unchecked_transaction()?;
        let (out, touched) = {
            let mut writer = Writer::new(&tx, &self.cipher);
            let out = f(&mut writer)?;
            (out, writer.touched)
        };
        tx.commit()?;

        if !touched.is_empty() {
            self.observers.notify(self, &touched);
        }
        Ok(out)
    }

    /// Delete every cached row, in one transaction.
    ///
    /// The key-check canary goes too, so the next open under a new key starts
    /// clean instead of reporting a mismatch.
    pub fn wipe(&self) -> Result<usize> {
        self.write(|w| {
            let mut removed = 0;
            for table in Table::ALL {
                removed += w.wipe_table(table)?;
            }
            w.conn().execute("DELETE FROM store_meta", [])?;
            Ok(removed)
        })
    }
}

/// Handle to an open write transaction.
///
/// Every mutation records the rows it touched so that observers can be
/// notified once the transaction commits.
pub struct Writer<'a> {
    conn: &'a Connection,
    cipher: &'a FieldCipher,
    touched: Touched,
}

impl<'a> Writer<'a> {
    fn new(conn: &'a Connection, cipher: &'a FieldCipher) -> Self {
        Self {
            conn,
            cipher,
            touched: Touched::default(),
        }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub(crate) fn cipher(&self) -> &FieldCipher {
        self.cipher
    }

    /// Record that `id` in `table` changed in this transaction.
    pub fn touch(&mut self, table: Table, id: impl Into<String>) {
        self.touched.mark(table, id);
    }

    fn wipe_table(&mut self, table: Table) -> Result<usize> {
        let ids: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT {} FROM {}", table.key_column(), table.name()))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        self.conn.execute(&format!("DELETE FROM {}", table.name()), [])?;
        let count = ids.len();
        for id in ids {
            self.touch(table, id);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let key = [0xABu8; 32];

        let db = Database::open_at(&path, &key).expect("should open");
        assert!(db.path().is_some());
        drop(db);

        Database::open_at(&path, &key).expect("should reopen with the same key");
    }

    #[test]
    fn wrong_key_is_cipher_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        drop(Database::open_at(&path, &[1u8; 32]).unwrap());

        let err = Database::open_at(&path, &[2u8; 32]).err().expect("must fail");
        assert!(err.is_cipher_mismatch(), "unexpected error: {err}");
    }

    #[test]
    fn failed_write_rolls_back() {
        let db = Database::open_in_memory(&[9u8; 32]).unwrap();

        let result: Result<()> = db.write(|w| {
            w.conn().execute(
                "INSERT INTO liker_ids (user_id, created_at) VALUES ('u1', '2024-01-01T00:00:00.000Z')",
                [],
            )?;
            Err(StoreError::Invalid("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM liker_ids", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    // Under SQLCipher the file stays keyed with the old key after a wipe.
    #[cfg(not(feature = "sqlcipher"))]
    #[test]
    fn wipe_clears_canary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path, &[1u8; 32]).unwrap();
        db.wipe().unwrap();
        drop(db);

        Database::open_at(&path, &[2u8; 32]).expect("wiped store accepts a new key");
    }
}
