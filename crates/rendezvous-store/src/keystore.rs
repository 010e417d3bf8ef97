//! Store key management.
//!
//! The 256-bit key that seals the database lives in a [`SecretStore`], the
//! seam to whatever secure storage the platform offers.  [`KeyProvider`]
//! creates the key on first use and caches it for the life of the process.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rendezvous_shared::constants::{STORE_KEY_NAME, SYMMETRIC_KEY_SIZE};
use rendezvous_shared::crypto::{self, SymmetricKey};

use crate::error::{Result, StoreError};

/// Named secret storage, modelled on an OS keyring.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, name: &str) -> io::Result<Option<String>>;
    fn set_secret(&self, name: &str, value: &str) -> io::Result<()>;
    /// Deleting a missing secret is not an error.
    fn delete_secret(&self, name: &str) -> io::Result<()>;
}

/// One file per secret under a private directory.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid secret name '{name}'"),
            ));
        }
        Ok(self.dir.join(name))
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(name)?) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_secret(&self, name: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name)?;
        fs::write(&path, value)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn delete_secret(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(name)?) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Process-local secrets; nothing survives a restart.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "secret store lock poisoned")
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, name: &str) -> io::Result<Option<String>> {
        Ok(self.secrets.lock().map_err(|_| poisoned())?.get(name).cloned())
    }

    fn set_secret(&self, name: &str, value: &str) -> io::Result<()> {
        self.secrets
            .lock()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, name: &str) -> io::Result<()> {
        self.secrets.lock().map_err(|_| poisoned())?.remove(name);
        Ok(())
    }
}

/// Hands out the store key.  There is no unencrypted fallback: if the
/// secret store fails, so does every caller.
pub struct KeyProvider {
    secrets: Arc<dyn SecretStore>,
    cached: Mutex<Option<SymmetricKey>>,
}

impl KeyProvider {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            cached: Mutex::new(None),
        }
    }

    /// Return the stored key, generating and persisting one on first call.
    pub fn get_key(&self) -> Result<SymmetricKey> {
        let mut cached = self.cached.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(key) = *cached {
            return Ok(key);
        }

        let key = match self.secrets.get_secret(STORE_KEY_NAME).map_err(unavailable)? {
            Some(encoded) => decode_key(&encoded)?,
            None => {
                let key = crypto::generate_symmetric_key();
                self.secrets
                    .set_secret(STORE_KEY_NAME, &hex::encode(key))
                    .map_err(unavailable)?;
                tracing::info!("generated new store key");
                key
            }
        };
        *cached = Some(key);
        Ok(key)
    }

    /// Forget the key, both persisted and cached.
    pub fn reset_key(&self) -> Result<()> {
        let mut cached = self.cached.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.secrets.delete_secret(STORE_KEY_NAME).map_err(unavailable)?;
        *cached = None;
        tracing::info!("store key reset");
        Ok(())
    }

    pub fn has_key(&self) -> Result<bool> {
        if self.cached.lock().map_err(|_| StoreError::LockPoisoned)?.is_some() {
            return Ok(true);
        }
        Ok(self
            .secrets
            .get_secret(STORE_KEY_NAME)
            .map_err(unavailable)?
            .is_some())
    }
}

fn unavailable(err: io::Error) -> StoreError {
    StoreError::KeyUnavailable(err.to_string())
}

fn decode_key(encoded: &str) -> Result<SymmetricKey> {
    let bytes = hex::decode(encoded)
        .map_err(|e| StoreError::KeyUnavailable(format!("stored key is not hex: {e}")))?;
    crypto::key_from_slice(&bytes).map_err(|_| {
        StoreError::KeyUnavailable(format!(
            "stored key has {} bytes, expected {SYMMETRIC_KEY_SIZE}",
            bytes.len()
        ))
    })
}
