//! Reactive query surface.
//!
//! [`Database::observe`] registers a predicate and a callback for one record
//! type.  The callback receives the full matching result set immediately, and
//! again after every committed write that touched a row matching either before
//! or after the write.  The returned [`Subscription`] releases the observer
//! when dropped or when [`Subscription::unsubscribe`] is called.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use crate::database::Database;
use crate::error::Result;

/// Tables whose rows can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    DiscoveryProfiles,
    SwipeQueue,
    LikerIds,
    Matches,
    Chats,
    Messages,
}

impl Table {
    // Children before parents, so a wipe never trips a foreign key.
    pub const ALL: [Table; 7] = [
        Table::Messages,
        Table::Chats,
        Table::Matches,
        Table::SwipeQueue,
        Table::LikerIds,
        Table::DiscoveryProfiles,
        Table::Profiles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::DiscoveryProfiles => "discovery_profiles",
            Table::SwipeQueue => "swipe_queue",
            Table::LikerIds => "liker_ids",
            Table::Matches => "matches",
            Table::Chats => "chats",
            Table::Messages => "messages",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            Table::LikerIds => "user_id",
            _ => "id",
        }
    }
}

/// A row type that can be loaded and observed.
pub trait Record: Clone + Send + 'static {
    const TABLE: Table;

    /// Value of the table's key column.
    fn record_id(&self) -> &str;

    /// Load every visible row of the table.
    fn load_all(db: &Database) -> Result<Vec<Self>>;
}

/// Rows touched by one transaction, grouped by table.
#[derive(Debug, Default, Clone)]
pub struct Touched {
    rows: HashMap<Table, HashSet<String>>,
}

impl Touched {
    pub fn mark(&mut self, table: Table, id: impl Into<String>) {
        self.rows.entry(table).or_default().insert(id.into());
    }

    pub fn ids(&self, table: Table) -> Option<&HashSet<String>> {
        self.rows.get(&table)
    }

    pub fn contains(&self, table: Table, id: &str) -> bool {
        self.rows.get(&table).is_some_and(|ids| ids.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(HashSet::is_empty)
    }
}

trait Observer: Send + Sync {
    fn table(&self) -> Table;

    /// Re-run the query after a commit that touched `touched` in our table.
    fn refresh(&self, db: &Database, touched: &HashSet<String>);
}

struct QueryObserver<T, P, C> {
    predicate: P,
    callback: C,
    last_ids: Mutex<HashSet<String>>,
    _record: PhantomData<fn() -> T>,
}

impl<T, P, C> Observer for QueryObserver<T, P, C>
where
    T: Record,
    P: Fn(&T) -> bool + Send + Sync,
    C: Fn(&[T]) + Send + Sync,
{
    fn table(&self) -> Table {
        T::TABLE
    }

    fn refresh(&self, db: &Database, touched: &HashSet<String>) {
        let rows = match self.evaluate(db) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(table = T::TABLE.name(), error = %e, "observer query failed");
                return;
            }
        };
        let ids: HashSet<String> = rows.iter().map(|r| r.record_id().to_string()).collect();

        let Ok(mut last) = self.last_ids.lock() else {
            return;
        };
        if touched.is_disjoint(&last) && touched.is_disjoint(&ids) {
            return;
        }
        *last = ids;
        drop(last);

        (self.callback)(&rows);
    }
}

impl<T, P, C> QueryObserver<T, P, C>
where
    T: Record,
    P: Fn(&T) -> bool,
{
    fn evaluate(&self, db: &Database) -> Result<Vec<T>> {
        Ok(T::load_all(db)?
            .into_iter()
            .filter(|r| (self.predicate)(r))
            .collect())
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, Arc<dyn Observer>>,
}

#[derive(Clone, Default)]
pub(crate) struct Observers {
    inner: Arc<Mutex<Registry>>,
}

impl Observers {
    fn register(&self, observer: Arc<dyn Observer>) -> Subscription {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.insert(id, observer);

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn notify(&self, db: &Database, touched: &Touched) {
        // Snapshot first so callbacks may drop subscriptions without deadlocking.
        let interested: Vec<Arc<dyn Observer>> = {
            let registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            registry
                .entries
                .values()
                .filter(|o| touched.ids(o.table()).is_some())
                .cloned()
                .collect()
        };

        for observer in interested {
            if let Some(ids) = touched.ids(observer.table()) {
                observer.refresh(db, ids);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|r| r.entries.len())
            .unwrap_or_default()
    }
}

/// Live registration of an observer.  Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Explicitly release the observer.
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .and_then(|r| r.lock().ok().map(|r| r.entries.contains_key(&self.id)))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|p| p.into_inner());
            registry.entries.remove(&self.id);
        }
    }
}

impl Database {
    /// Observe the rows of `T` matching `predicate`.
    ///
    /// `callback` is invoked once right away with the current result set.
    pub fn observe<T, P, C>(&self, predicate: P, callback: C) -> Result<Subscription>
    where
        T: Record,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        C: Fn(&[T]) + Send + Sync + 'static,
    {
        let observer = Arc::new(QueryObserver {
            predicate,
            callback,
            last_ids: Mutex::new(HashSet::new()),
            _record: PhantomData,
        });

        let rows = observer.evaluate(self)?;
        if let Ok(mut last) = observer.last_ids.lock() {
            *last = rows.iter().map(|r| r.record_id().to_string()).collect();
        }
        (observer.callback)(&rows);

        Ok(self.observers().register(observer))
    }

    /// Number of live subscriptions.
    pub fn observer_count(&self) -> usize {
        self.observers().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::models::Liker;

    type Emissions = Arc<Mutex<Vec<Vec<String>>>>;

    fn recorder() -> (Emissions, impl Fn(&[Liker]) + Send + Sync + 'static) {
        let seen: Emissions = Arc::default();
        let sink = seen.clone();
        let callback = move |rows: &[Liker]| {
            let ids = rows.iter().map(|l| l.user_id.clone()).collect();
            sink.lock().unwrap().push(ids);
        };
        (seen, callback)
    }

    #[test]
    fn emits_initial_set_then_on_matching_writes() {
        let db = Database::open_in_memory(&[7u8; 32]).unwrap();
        db.write(|w| w.add_liker("alice", Utc::now())).unwrap();

        let (seen, callback) = recorder();
        let _sub = db
            .observe(|l: &Liker| l.user_id.starts_with('a'), callback)
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        // Touches a row outside the predicate: no emission.
        db.write(|w| w.add_liker("bob", Utc::now())).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        db.write(|w| w.add_liker("anna", Utc::now())).unwrap();
        // A row leaving the result set also counts.
        db.write(|w| w.remove_liker("alice")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], vec!["anna".to_string()]);
    }

    #[test]
    fn dropped_subscription_stops_emitting() {
        let db = Database::open_in_memory(&[7u8; 32]).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let sub = db
            .observe(
                |_: &Liker| true,
                move |_: &[Liker]| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        assert!(sub.is_active());
        assert_eq!(db.observer_count(), 1);

        sub.unsubscribe();
        assert_eq!(db.observer_count(), 0);

        db.write(|w| w.add_liker("carol", Utc::now())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rolled_back_write_does_not_notify() {
        let db = Database::open_in_memory(&[7u8; 32]).unwrap();
        let (seen, callback) = recorder();
        let _sub = db.observe(|_: &Liker| true, callback).unwrap();

        let _ = db.write(|w| {
            w.add_liker("dave", Utc::now())?;
            Err::<(), _>(crate::error::StoreError::Invalid("abort".into()))
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
