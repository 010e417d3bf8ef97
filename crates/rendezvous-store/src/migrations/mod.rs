//! Database migration runner.
//!
//! Migrations are executed in order on every [`Database::open_at`] call.  Each
//! step is guarded by the `user_version` pragma so it runs exactly once, and
//! runs in its own transaction together with the version bump.
//!
//! Steps are strictly additive (new tables, new nullable or defaulted
//! columns) so an upgrade never drops cached rows.
//!
//! [`Database::open_at`]: crate::Database::open_at

pub mod v001_initial;
pub mod v002_swipe_queue;
pub mod v003_match_metadata;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// The ordered ladder.  Append a new entry whenever the schema changes.
const MIGRATIONS: &[(u32, &str, Step)] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_swipe_queue", v002_swipe_queue::up),
    (3, "v003_match_metadata", v003_match_metadata::up),
];

/// Current schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Run all pending migrations against the open connection.
///
/// Returns the number of steps applied.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    let mut applied = 0;
    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, "applying migration {name}");

        let tx = conn.unchecked_transaction()?;
        up(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;

        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info('{table}')"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn ladder_is_contiguous() {
        for (i, (version, _, _)) in MIGRATIONS.iter().enumerate() {
            assert_eq!(*version as usize, i + 1);
        }
        assert_eq!(MIGRATIONS.last().unwrap().0, CURRENT_VERSION);
    }

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 3);

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        // Re-running is a no-op.
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn upgrade_keeps_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        v001_initial::up(&conn).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO matches (id, user_a, user_b, status, matched_at)
             VALUES ('m1', 'ua', 'ub', 'active', '2024-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), 2);

        assert!(columns(&conn, "matches").contains(&"match_origin".to_string()));
        assert!(columns(&conn, "swipe_queue").contains(&"attempts".to_string()));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM matches", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StoreError::Migration(_))
        ));
    }
}
