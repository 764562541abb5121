//! Schema-version tracking and ordered migrations.
//!
//! The version lives in a single-row `schema` table. On connect the store
//! reads it and compares against [`SCHEMA_VERSION`]:
//!
//! - no `schema` table yet → a fresh database: the table is created and
//!   seeded with version 0 in one transaction, and migration is implicitly
//!   permitted for this run regardless of configuration;
//! - equal → nothing to do;
//! - behind, and migration not permitted → [`StoreError::SchemaVersion`],
//!   which names the `--migrate` flag;
//! - ahead → the same error; this build refuses to run against a newer
//!   schema.
//!
//! Each pending step applies its DDL and its version bump inside one
//! transaction, so a mid-migration failure leaves the schema at the last
//! fully committed version, never half-applied.

use deadpool_postgres::Pool;
use rusqlite::OptionalExtension;
use tracing::info;

use super::{Result, StoreError};

/// The schema version this build requires.
pub const SCHEMA_VERSION: i64 = 1;

struct Step {
    version: i64,
    ddl: &'static str,
}

const POSTGRES_STEPS: &[Step] = &[Step {
    version: 1,
    ddl: "CREATE TABLE IF NOT EXISTS objects (
            id BIGSERIAL PRIMARY KEY,
            tenant_id BIGINT NOT NULL,
            collection TEXT NOT NULL,
            body JSONB NOT NULL
          );
          CREATE INDEX idx_objects_tenant_id ON objects (tenant_id);
          CREATE INDEX idx_objects_collection ON objects (collection);",
}];

const SQLITE_STEPS: &[Step] = &[Step {
    version: 1,
    ddl: "CREATE TABLE IF NOT EXISTS objects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            collection TEXT NOT NULL,
            body TEXT NOT NULL
          );
          CREATE INDEX idx_objects_tenant_id ON objects (tenant_id);
          CREATE INDEX idx_objects_collection ON objects (collection);",
}];

fn version_gate(current: i64, allow: bool) -> Result<Option<i64>> {
    if current == SCHEMA_VERSION {
        return Ok(None);
    }
    if current > SCHEMA_VERSION || !allow {
        return Err(StoreError::SchemaVersion {
            found: current,
            want: SCHEMA_VERSION,
        });
    }
    Ok(Some(current))
}

/// Check and, when permitted, migrate a PostgreSQL database.
pub(crate) async fn migrate_postgres(pool: &Pool, allow: bool) -> Result<i64> {
    let mut client = pool
        .get()
        .await
        .map_err(|e| StoreError::Backend(format!("failed to check out connection: {e}")))?;

    let mut allow = allow;
    let stored = match client.query_opt("SELECT version FROM schema LIMIT 1", &[]).await {
        Ok(Some(row)) => Some(i64::from(row.get::<_, i32>(0))),
        Ok(None) => None,
        Err(e) if is_undefined_table(&e) => None,
        Err(e) => return Err(StoreError::Backend(e.to_string())),
    };

    let current = match stored {
        Some(version) => version,
        None => {
            // Fresh database: seed the version row and implicitly permit
            // migration for this run.
            let tx = client.transaction().await.map_err(backend)?;
            tx.batch_execute("CREATE TABLE IF NOT EXISTS schema (version INTEGER);")
                .await
                .map_err(backend)?;
            tx.execute("INSERT INTO schema VALUES (0)", &[])
                .await
                .map_err(backend)?;
            tx.commit().await.map_err(backend)?;
            allow = true;
            0
        }
    };

    let Some(current) = version_gate(current, allow)? else {
        return Ok(SCHEMA_VERSION);
    };

    for step in POSTGRES_STEPS.iter().filter(|s| s.version > current) {
        let tx = client.transaction().await.map_err(backend)?;
        tx.batch_execute(step.ddl).await.map_err(backend)?;
        tx.execute("UPDATE schema SET version = $1", &[&(step.version as i32)])
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        info!(version = step.version, "applied postgres migration step");
    }

    Ok(SCHEMA_VERSION)
}

fn is_undefined_table(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNDEFINED_TABLE)
}

fn backend(e: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Check and, when permitted, migrate a SQLite database.
/// Synchronous; callers run it on the blocking pool.
pub(crate) fn migrate_sqlite(conn: &mut rusqlite::Connection, allow: bool) -> Result<i64> {
    let mut allow = allow;
    let stored = read_sqlite_version(conn)?;

    let current = match stored {
        Some(version) => version,
        None => {
            let tx = conn.transaction().map_err(sqlite_backend)?;
            tx.execute_batch("CREATE TABLE IF NOT EXISTS schema (version INTEGER);")
                .map_err(sqlite_backend)?;
            tx.execute("INSERT INTO schema VALUES (0)", [])
                .map_err(sqlite_backend)?;
            tx.commit().map_err(sqlite_backend)?;
            allow = true;
            0
        }
    };

    let Some(current) = version_gate(current, allow)? else {
        return Ok(SCHEMA_VERSION);
    };

    for step in SQLITE_STEPS.iter().filter(|s| s.version > current) {
        let tx = conn.transaction().map_err(sqlite_backend)?;
        tx.execute_batch(step.ddl).map_err(sqlite_backend)?;
        tx.execute("UPDATE schema SET version = ?1", [step.version])
            .map_err(sqlite_backend)?;
        tx.commit().map_err(sqlite_backend)?;
        info!(version = step.version, "applied sqlite migration step");
    }

    Ok(SCHEMA_VERSION)
}

fn read_sqlite_version(conn: &rusqlite::Connection) -> Result<Option<i64>> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .map_err(sqlite_backend)?;
    if !table_exists {
        return Ok(None);
    }
    conn.query_row("SELECT version FROM schema LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(sqlite_backend)
}

fn sqlite_backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_fresh_database_bootstraps_implicitly() {
        let mut conn = memory_conn();
        // migrate=false, but a fresh database is implicit permission.
        let version = migrate_sqlite(&mut conn, false).unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let stored: i64 = conn
            .query_row("SELECT version FROM schema", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, SCHEMA_VERSION);

        // The objects table exists.
        conn.execute(
            "INSERT INTO objects (tenant_id, collection, body) VALUES (1, 'c', '{}')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_up_to_date_is_noop() {
        let mut conn = memory_conn();
        migrate_sqlite(&mut conn, false).unwrap();
        let version = migrate_sqlite(&mut conn, false).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_behind_without_permission_errors() {
        let mut conn = memory_conn();
        conn.execute_batch("CREATE TABLE schema (version INTEGER); INSERT INTO schema VALUES (0);")
            .unwrap();
        let err = migrate_sqlite(&mut conn, false).unwrap_err();
        match err {
            StoreError::SchemaVersion { found, want } => {
                assert_eq!(found, 0);
                assert_eq!(want, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaVersion, got {other:?}"),
        }

        // Nothing was applied.
        let objects_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'objects'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(objects_exists, 0);
    }

    #[test]
    fn test_behind_with_permission_migrates() {
        let mut conn = memory_conn();
        conn.execute_batch("CREATE TABLE schema (version INTEGER); INSERT INTO schema VALUES (0);")
            .unwrap();
        assert_eq!(migrate_sqlite(&mut conn, true).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = memory_conn();
        conn.execute_batch("CREATE TABLE schema (version INTEGER); INSERT INTO schema VALUES (99);")
            .unwrap();
        assert!(matches!(
            migrate_sqlite(&mut conn, true),
            Err(StoreError::SchemaVersion { found: 99, .. })
        ));
    }
}
