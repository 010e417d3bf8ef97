use rendezvous_shared::CryptoError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite / SQLCipher error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Column encryption / decryption failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The store key does not match the one the database was written with.
    #[error("Cipher mismatch: store key cannot decrypt the existing database")]
    CipherMismatch,

    /// The secure key storage could not produce the store key.
    #[error("Store key unavailable: {0}")]
    KeyUnavailable(String),

    /// JSON (de)serialization error for opaque payload columns.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A writer panicked while holding the store lock.
    #[error("Store lock poisoned")]
    LockPoisoned,

    /// A caller asked for a state change the record does not allow.
    #[error("Invalid operation: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether this error means the key and the on-disk data disagree.
    ///
    /// Covers the canary check, column decryption failures and SQLCipher's
    /// `SQLITE_NOTADB`, which is what a wrong `PRAGMA key` produces.
    pub fn is_cipher_mismatch(&self) -> bool {
        match self {
            Self::CipherMismatch => true,
            Self::Crypto(CryptoError::DecryptionFailed) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, msg)) => {
                err.code == rusqlite::ErrorCode::NotADatabase
                    || msg.as_deref().is_some_and(mentions_cipher)
            }
            Self::Migration(msg) => mentions_cipher(msg),
            _ => false,
        }
    }

    /// Whether this error is a primary-key / unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
                    && matches!(
                        err.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    )
            }
            _ => false,
        }
    }
}

fn mentions_cipher(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("file is not a database") || msg.contains("cipher") || msg.contains("decrypt")
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_failure_is_cipher_mismatch() {
        assert!(StoreError::CipherMismatch.is_cipher_mismatch());
        assert!(StoreError::Crypto(CryptoError::DecryptionFailed).is_cipher_mismatch());
        assert!(!StoreError::NotFound.is_cipher_mismatch());
    }

    #[test]
    fn not_a_database_is_cipher_mismatch() {
        let err = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            Some("file is not a database".into()),
        ));
        assert!(err.is_cipher_mismatch());
    }

    #[test]
    fn key_unavailable_is_not_recoverable() {
        assert!(!StoreError::KeyUnavailable("keystore locked".into()).is_cipher_mismatch());
    }
}
