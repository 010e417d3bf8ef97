//! Process-wide access to the open store.
//!
//! [`StoreProvider::open`] is idempotent: the first call opens the database,
//! later calls return the same handle.  A key that cannot read the existing
//! file is treated as unrecoverable for that file: the key is reset, the
//! database and the sync checkpoints are discarded and the open is retried
//! once.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rendezvous_shared::crypto::SymmetricKey;

use crate::checkpoints::CheckpointStore;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::keystore::KeyProvider;

const MAX_OPEN_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// An open database behind the lock that serializes all access to it.
pub struct Store {
    db: Mutex<Database>,
}

impl Store {
    fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Lock the database.  Never hold the guard across an `.await`.
    pub fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

pub type StoreHandle = Arc<Store>;

pub struct StoreProvider {
    location: StoreLocation,
    keys: KeyProvider,
    checkpoints: Arc<dyn CheckpointStore>,
    handle: Mutex<Option<StoreHandle>>,
}

impl StoreProvider {
    pub fn new(
        location: StoreLocation,
        keys: KeyProvider,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            location,
            keys,
            checkpoints,
            handle: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Return the shared handle, opening the database on first use.
    pub fn open(&self) -> Result<StoreHandle> {
        let mut slot = self.handle.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let mut attempt = 0;
        let db = loop {
            attempt += 1;
            let key = self.keys.get_key()?;
            match self.open_database(&key) {
                Ok(db) => break db,
                Err(e) if e.is_cipher_mismatch() && attempt < MAX_OPEN_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "store key cannot read database, starting over");
                    self.keys.reset_key()?;
                    self.discard_files()?;
                    self.checkpoints.clear()?;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "failed to open store");
                    return Err(e);
                }
            }
        };

        let handle = Arc::new(Store::new(db));
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Drop all local data: every table, the key and the checkpoints.
    ///
    /// Handles obtained earlier keep pointing at the wiped database; callers
    /// should re-acquire through [`StoreProvider::open`].
    pub fn reset(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .take();

        match handle {
            Some(handle) => {
                let removed = handle.db()?.wipe()?;
                tracing::info!(removed, "store wiped");
            }
            None => self.discard_files()?,
        }

        self.keys.reset_key()?;
        self.checkpoints.clear()?;
        Ok(())
    }

    fn open_database(&self, key: &SymmetricKey) -> Result<Database> {
        match &self.location {
            StoreLocation::File(path) => Database::open_at(path, key),
            StoreLocation::Memory => Database::open_in_memory(key),
        }
    }

    fn discard_files(&self) -> Result<()> {
        let StoreLocation::File(path) = &self.location else {
            return Ok(());
        };
        for suffix in ["", "-wal", "-shm"] {
            remove_if_exists(&with_suffix(path, suffix))?;
        }
        tracing::info!(path = %path.display(), "discarded database files");
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
