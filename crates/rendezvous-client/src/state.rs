//! Process-wide client state.
//!
//! One [`AppContext`] exists per signed-in session.  It is created at sign-in
//! (or app start with a remembered user), shared as `Arc<AppContext>` by every
//! component, and torn down by [`AppContext::logout`], which also wipes the
//! local store.
//!
//! The in-memory sets here are per process and never persisted: after a
//! restart anything still in the swipe queue is simply retried.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use rendezvous_store::{
    CheckpointStore, Database, FileCheckpointStore, FileSecretStore, KeyProvider, Match,
    StoreError, StoreHandle, StoreLocation, StoreProvider,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::EventBus;
use crate::remote::Remote;

/// Central client state.
pub struct AppContext {
    config: ClientConfig,

    /// Opens the store lazily.  Always go through [`AppContext::store`]:
    /// a handle cached elsewhere goes stale after a reset.
    provider: StoreProvider,

    remote: Arc<dyn Remote>,

    /// Id of the signed-in user.
    user_id: String,

    /// Users swiped on during this session, hidden from future feeds even
    /// after their queue entry has been delivered.
    acted_user_ids: Mutex<HashSet<String>>,

    /// Targets whose swipe is being processed right now.
    swipes_in_flight: Mutex<HashSet<String>>,

    /// Latest instant match, held until the UI has shown it.
    pending_match: Mutex<Option<Match>>,

    /// Set once messages left `pending` by an earlier process are failed.
    unsent_recovered: Mutex<bool>,

    events: EventBus,
}

impl AppContext {
    /// Build a context backed by files under `config.data_dir`.
    pub fn new(config: ClientConfig, remote: Arc<dyn Remote>, user_id: impl Into<String>) -> Self {
        let keys = KeyProvider::new(Arc::new(FileSecretStore::new(config.secrets_dir())));
        let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoints_path()));
        let provider = StoreProvider::new(StoreLocation::File(config.db_path()), keys, checkpoints);
        Self::with_provider(config, provider, remote, user_id)
    }

    pub fn with_provider(
        config: ClientConfig,
        provider: StoreProvider,
        remote: Arc<dyn Remote>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            provider,
            remote,
            user_id: user_id.into(),
            acted_user_ids: Mutex::new(HashSet::new()),
            swipes_in_flight: Mutex::new(HashSet::new()),
            pending_match: Mutex::new(None),
            unsent_recovered: Mutex::new(false),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        self.provider.checkpoints()
    }

    /// The open store, opening it on first use.
    ///
    /// The first call also fails any outgoing message a previous process
    /// left `pending`, so it can be retried.  Other callers wait for that to
    /// finish, so no send of this process is caught by it.
    pub fn store(&self) -> Result<StoreHandle> {
        let store = self.provider.open()?;
        let mut recovered = lock(&self.unsent_recovered);
        if !*recovered {
            let failed = store
                .db()?
                .write(|w| w.fail_unsent_messages(&self.user_id))?;
            if failed > 0 {
                tracing::info!(failed, "messages interrupted by a restart marked failed");
            }
            *recovered = true;
        }
        Ok(store)
    }

    /// Run `f` against the locked database.  The lock is released before
    /// this returns, so it is safe to call between `.await` points.
    ///
    /// Not reentrant: observer callbacks fire inside `Database::write` while
    /// this lock is held, so they must not call `with_db`, not even to read.
    pub fn with_db<R>(
        &self,
        f: impl FnOnce(&Database) -> std::result::Result<R, StoreError>,
    ) -> Result<R> {
        let store = self.store()?;
        let db = store.db()?;
        Ok(f(&db)?)
    }

    // -- Acted users --

    pub fn mark_acted(&self, user_id: &str) {
        lock(&self.acted_user_ids).insert(user_id.to_string());
    }

    pub fn has_acted(&self, user_id: &str) -> bool {
        lock(&self.acted_user_ids).contains(user_id)
    }

    pub fn acted_user_ids(&self) -> HashSet<String> {
        lock(&self.acted_user_ids).clone()
    }

    // -- Swipes in flight --

    /// Claim `target` for one swipe.  The claim is released when the guard
    /// drops, on every exit path.
    pub fn begin_swipe(&self, target: &str) -> Result<SwipeClaim<'_>> {
        if !lock(&self.swipes_in_flight).insert(target.to_string()) {
            return Err(ClientError::SwipeInProgress(target.to_string()));
        }
        Ok(SwipeClaim {
            ctx: self,
            target: target.to_string(),
        })
    }

    pub fn is_swipe_in_flight(&self, target: &str) -> bool {
        lock(&self.swipes_in_flight).contains(target)
    }

    // -- Pending match --

    pub fn set_pending_match(&self, m: Match) {
        *lock(&self.pending_match) = Some(m);
    }

    /// Take the pending match, leaving none.
    pub fn take_pending_match(&self) -> Option<Match> {
        lock(&self.pending_match).take()
    }

    /// Sign out: wipe the store, forget the key and the checkpoints, and
    /// clear every in-memory set.
    pub fn logout(&self) -> Result<()> {
        self.provider.reset()?;
        lock(&self.acted_user_ids).clear();
        lock(&self.swipes_in_flight).clear();
        lock(&self.pending_match).take();
        tracing::info!(user_id = %self.user_id, "logged out");
        self.events.emit(crate::events::ClientEvent::LoggedOut);
        Ok(())
    }
}

/// Held while a swipe on `target` is being processed.
pub struct SwipeClaim<'a> {
    ctx: &'a AppContext,
    target: String,
}

impl Drop for SwipeClaim<'_> {
    fn drop(&mut self) {
        lock(&self.ctx.swipes_in_flight).remove(&self.target);
    }
}

// These sets hold plain data, so a poisoned lock is still consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
