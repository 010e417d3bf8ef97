
/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Name under which the store encryption key is kept in the secret store
pub const STORE_KEY_NAME: &str = "rendezvous.store.key";

/// Fixed key-value key holding the sync checkpoint pair
pub const CHECKPOINT_KEY: &str = "sync_checkpoints";

/// Plaintext sealed into `store_meta` to detect a stale store key on open
pub const KEY_CHECK_PLAINTEXT: &[u8] = b"rendezvous-key-check-v1";

/// Minimum age of a cached profile before it may be re-fetched (5 minutes)
pub const PROFILE_THROTTLE_SECS: u64 = 5 * 60;

/// Default interval between background sync cycles
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Default timeout for remote API calls
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_FIELD_KEY: &str = "rendezvous-field-key-v1";
