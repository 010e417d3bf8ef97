//! # rendezvous-store
//!
//! Local-first encrypted storage for the Rendezvous client.
//!
//! The store is a cache mirroring the backend: discovery cards, profiles,
//! matches, chats and messages, plus the durable queue of swipes that have not
//! reached the server yet.  Sensitive columns are sealed with
//! XChaCha20-Poly1305 under a key held by a [`KeyProvider`]; with the
//! `sqlcipher` feature the whole file is keyed as well.
//!
//! All writes go through [`Database::write`], which runs a closure inside one
//! SQLite transaction and, after commit, notifies the observers registered via
//! [`Database::observe`].

pub mod changes;
pub mod chats;
pub mod checkpoints;
pub mod database;
pub mod keystore;
pub mod matches;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod observe;
pub mod profiles;
pub mod provider;
pub mod swipe_queue;

mod columns;
mod error;

pub use changes::{ApplyStats, ChangeSet, TableChanges};
pub use checkpoints::{CheckpointStore, Checkpoints, FileCheckpointStore, MemoryCheckpointStore};
pub use database::{Database, Writer};
pub use matches::MatchPatch;
pub use error::{Result, StoreError};
pub use keystore::{FileSecretStore, KeyProvider, MemorySecretStore, SecretStore};
pub use models::*;
pub use observe::{Record, Subscription, Table, Touched};
pub use provider::{Store, StoreHandle, StoreLocation, StoreProvider};
