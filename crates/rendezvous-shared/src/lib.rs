//! # rendezvous-shared
//!
//! Primitives shared by the store and client crates: symmetric crypto used for
//! encryption at rest, protocol constants, and the small enums that appear both
//! in persisted rows and on the wire.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::CryptoError;
pub use types::{MatchStatus, MessageStatus, SwipeAction, SyncStatus};
