//! Durable sync cursors.
//!
//! Checkpoints live outside the database in a small key-value file, so they
//! survive a store wipe unless cleared explicitly.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use rendezvous_shared::constants::CHECKPOINT_KEY;

use crate::error::{Result, StoreError};

/// Unix epoch milliseconds of the last successful pull and push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoints {
    pub last_pulled_at: Option<i64>,
    pub last_pushed_at: Option<i64>,
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Checkpoints>;
    fn save(&self, checkpoints: &Checkpoints) -> Result<()>;
    fn clear(&self) -> Result<()>;

    fn record_pull(&self, timestamp: i64) -> Result<()> {
        let mut cp = self.load()?;
        cp.last_pulled_at = Some(timestamp);
        self.save(&cp)
    }

    fn record_push(&self, timestamp: i64) -> Result<()> {
        let mut cp = self.load()?;
        cp.last_pushed_at = Some(timestamp);
        self.save(&cp)
    }
}

/// JSON object on disk; checkpoints sit under one fixed key.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Result<HashMap<String, serde_json::Value>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    // Write-then-rename so a crash never leaves a truncated file.
    fn write_all(&self, entries: &HashMap<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Checkpoints> {
        match self.read_all()?.remove(CHECKPOINT_KEY) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Checkpoints::default()),
        }
    }

    fn save(&self, checkpoints: &Checkpoints) -> Result<()> {
        let mut entries = self.read_all()?;
        entries.insert(CHECKPOINT_KEY.to_string(), serde_json::to_value(checkpoints)?);
        self.write_all(&entries)
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.read_all()?;
        if entries.remove(CHECKPOINT_KEY).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Checkpoints>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Checkpoints> {
        Ok(*self.inner.lock().map_err(|_| StoreError::LockPoisoned)?)
    }

    fn save(&self, checkpoints: &Checkpoints) -> Result<()> {
        *self.inner.lock().map_err(|_| StoreError::LockPoisoned)? = *checkpoints;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.save(&Checkpoints::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_persists_and_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.load().unwrap(), Checkpoints::default());

        store.record_pull(1_000).unwrap();
        store.record_push(2_000).unwrap();

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(
            reopened.load().unwrap(),
            Checkpoints {
                last_pulled_at: Some(1_000),
                last_pushed_at: Some(2_000),
            }
        );

        reopened.clear().unwrap();
        assert_eq!(reopened.load().unwrap(), Checkpoints::default());

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
    }

    #[test]
    fn memory_store_clear() {
        let store = MemoryCheckpointStore::new();
        store.record_pull(5).unwrap();
        assert_eq!(store.load().unwrap().last_pulled_at, Some(5));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap().last_pulled_at, None);
    }
}
