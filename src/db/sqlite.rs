//! SQLite object store.
//!
//! Documents live as JSON text in a TEXT column; query predicates compile
//! through [`SqliteDialect`] into `json_extract` calls. rusqlite is
//! synchronous, so every operation runs its blocking work on the tokio
//! blocking pool with one checked-out pooled connection, inside one
//! `rusqlite::Transaction` (which rolls back on drop unless committed).

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use serde_json::Value;
use tokio::task;
use tracing::debug;

use crate::ast::{self, Fragment, Param, SqliteDialect};

use super::config::SqliteConfig;
use super::connection::{SqliteConnection, SqlitePool};
use super::{connection, document, inject_id, migrate, normalize_documents, strip_id};
use super::{Result, StoreError};

const BODY_COLUMN: &str = "body";
/// Bind positions reserved ahead of each compiled fragment: tenant (?1)
/// and collection (?2).
const SCOPE_PARAMS: usize = 2;

#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl rusqlite::ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Param::Str(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Param::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Param::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Param::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*v))),
            Param::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

impl SqliteStore {
    /// Open (or create) the database file and verify its schema version,
    /// migrating first when permitted.
    pub async fn open(config: &SqliteConfig, allow_migrate: bool) -> Result<Self> {
        let pool = connection::create_sqlite_pool(config)?;
        let store = SqliteStore { pool };
        store.migrate(allow_migrate).await?;
        Ok(store)
    }

    /// In-memory store, migrated and ready. Intended for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = connection::create_sqlite_memory_pool()?;
        let store = SqliteStore { pool };
        store.migrate(true).await?;
        Ok(store)
    }

    /// The pool closes when the last handle drops; nothing to flush.
    pub fn close(&self) {}

    async fn migrate(&self, allow: bool) -> Result<()> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            migrate::migrate_sqlite(&mut conn, allow)?;
            Ok(())
        })
        .await
    }

    pub async fn select_by_id(&self, tenant_id: i64, collection: &str, id: i64) -> Result<Value> {
        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let body = tx
                .query_row(
                    "SELECT body FROM objects WHERE id = ?1 AND tenant_id = ?2 AND collection = ?3",
                    rusqlite::params![id, tenant_id, collection],
                    |row| row.get::<_, Value>(0),
                )
                .map(Some)
                .or_else(not_found_as_none)?;
            tx.commit().map_err(map_sqlite_error)?;
            match body {
                Some(body) => Ok(document(id, body)),
                None => Err(StoreError::NotFound { id, collection }),
            }
        })
        .await
    }

    pub async fn select(
        &self,
        tenant_id: i64,
        collection: &str,
        query: &str,
        params: &[Param],
    ) -> Result<Vec<Value>> {
        // Parse and compile before a connection is even checked out.
        let fragment = compile_query(query, params)?;
        let sql = select_sql(&fragment);
        debug!(sql = %sql, "compiled select");

        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let rows = query_documents(&tx, &sql, tenant_id, &collection, &fragment.params)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(rows.into_iter().map(|(_, doc)| doc).collect())
        })
        .await
    }

    pub async fn insert(
        &self,
        tenant_id: i64,
        collection: &str,
        payload: Value,
    ) -> Result<Vec<Value>> {
        let docs = normalize_documents(payload)?;

        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let mut results = Vec::with_capacity(docs.len());
            {
                let mut stmt = tx
                    .prepare("INSERT INTO objects (tenant_id, collection, body) VALUES (?1, ?2, ?3)")
                    .map_err(map_sqlite_error)?;
                for mut doc in docs {
                    // Any failure drops the transaction, rolling back the
                    // whole batch.
                    let id = stmt
                        .insert(rusqlite::params![tenant_id, collection, doc])
                        .map_err(map_sqlite_error)?;
                    inject_id(&mut doc, id);
                    results.push(doc);
                }
            }
            tx.commit().map_err(map_sqlite_error)?;
            Ok(results)
        })
        .await
    }

    pub async fn update_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
        payload: Value,
    ) -> Result<Value> {
        let mut doc = strip_id(payload)?;

        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let updated = tx
                .execute(
                    "UPDATE objects SET body = ?1 WHERE id = ?2 AND tenant_id = ?3 AND collection = ?4",
                    rusqlite::params![doc, id, tenant_id, collection],
                )
                .map_err(map_sqlite_error)?;
            tx.commit().map_err(map_sqlite_error)?;
            if updated == 0 {
                return Err(StoreError::NotFound { id, collection });
            }
            inject_id(&mut doc, id);
            Ok(doc)
        })
        .await
    }

    pub async fn delete_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
    ) -> Result<Option<Value>> {
        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            // Read-then-delete, so the pre-deletion document can be
            // returned; both statements share one transaction.
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let body = tx
                .query_row(
                    "SELECT body FROM objects WHERE id = ?1 AND tenant_id = ?2 AND collection = ?3",
                    rusqlite::params![id, tenant_id, collection],
                    |row| row.get::<_, Value>(0),
                )
                .map(Some)
                .or_else(not_found_as_none)?;
            let Some(body) = body else {
                return Ok(None);
            };
            tx.execute(
                "DELETE FROM objects WHERE id = ?1 AND tenant_id = ?2 AND collection = ?3",
                rusqlite::params![id, tenant_id, collection],
            )
            .map_err(map_sqlite_error)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(Some(document(id, body)))
        })
        .await
    }

    pub async fn delete(
        &self,
        tenant_id: i64,
        collection: &str,
        query: &str,
        params: &[Param],
    ) -> Result<Vec<Value>> {
        let fragment = compile_query(query, params)?;
        let sql = select_sql(&fragment);
        debug!(sql = %sql, "compiled delete");

        let pool = self.pool.clone();
        let collection = collection.to_string();
        run_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            // Selecting and deleting share this transaction, so the row set
            // cannot change between the two passes.
            let rows = query_documents(&tx, &sql, tenant_id, &collection, &fragment.params)?;
            {
                let mut stmt = tx
                    .prepare("DELETE FROM objects WHERE id = ?1 AND tenant_id = ?2 AND collection = ?3")
                    .map_err(map_sqlite_error)?;
                for (id, _) in &rows {
                    stmt.execute(rusqlite::params![id, tenant_id, collection])
                        .map_err(map_sqlite_error)?;
                }
            }
            tx.commit().map_err(map_sqlite_error)?;
            Ok(rows.into_iter().map(|(_, doc)| doc).collect())
        })
        .await
    }

    /// Raw pooled connection, for tests that need extra DDL.
    #[cfg(test)]
    pub(crate) fn raw_connection(&self) -> Result<SqliteConnection> {
        checkout(&self.pool)
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
}

fn checkout(pool: &SqlitePool) -> Result<SqliteConnection> {
    pool.get()
        .map_err(|e| StoreError::Backend(format!("failed to check out connection: {e}")))
}

fn compile_query(query: &str, params: &[Param]) -> Result<Fragment> {
    let parsed = ast::parse(query)?;
    Ok(ast::compile(
        &parsed,
        &SqliteDialect,
        params,
        BODY_COLUMN,
        SCOPE_PARAMS,
    )?)
}

fn select_sql(fragment: &Fragment) -> String {
    format!(
        "SELECT id, body FROM objects WHERE tenant_id = ?1 AND collection = ?2 AND {}{}",
        fragment.predicate,
        fragment.clauses()
    )
}

fn query_documents(
    conn: &rusqlite::Connection,
    sql: &str,
    tenant_id: i64,
    collection: &str,
    params: &[Param],
) -> Result<Vec<(i64, Value)>> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let mut binds: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id, &collection];
    for param in params {
        binds.push(param);
    }
    let rows = stmt
        .query_map(&binds[..], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?))
        })
        .map_err(map_sqlite_error)?;

    let mut results = Vec::new();
    for row in rows {
        let (id, body) = row.map_err(map_sqlite_error)?;
        results.push((id, document(id, body)));
    }
    Ok(results)
}

/// Treat "no rows" as `None`; pass every other error through.
fn not_found_as_none<T>(e: rusqlite::Error) -> Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(map_sqlite_error(other)),
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Constraint(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            )
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_select_round_trip() {
        let store = store().await;
        let inserted = store
            .insert(1, "users", json!({"name": "alice", "age": 30}))
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
        let id = inserted[0]["$id"].as_i64().unwrap();

        let fetched = store.select_by_id(1, "users", id).await.unwrap();
        assert_eq!(fetched, inserted[0]);
        assert_eq!(fetched["name"], json!("alice"));
        assert_eq!(fetched["age"], json!(30));
    }

    #[tokio::test]
    async fn test_insert_strips_inbound_id() {
        let store = store().await;
        let inserted = store
            .insert(1, "users", json!({"$id": 999_999, "name": "x"}))
            .await
            .unwrap();
        let id = inserted[0]["$id"].as_i64().unwrap();
        assert_ne!(id, 999_999);

        // The stored body carries no $id; only the injected key does.
        let conn = store.raw_connection().unwrap();
        let body: String = conn
            .query_row("SELECT body FROM objects WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(!body.contains("$id"));
    }

    #[tokio::test]
    async fn test_insert_batch_assigns_ids() {
        let store = store().await;
        let inserted = store
            .insert(1, "users", json!([{"n": 1}, {"n": 2}, {"n": 3}]))
            .await
            .unwrap();
        assert_eq!(inserted.len(), 3);
        let ids: Vec<i64> = inserted
            .iter()
            .map(|d| d["$id"].as_i64().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_insert_rejects_non_objects() {
        let store = store().await;
        assert!(matches!(
            store.insert(1, "users", json!(42)).await,
            Err(StoreError::InvalidDocument(_))
        ));
        assert!(matches!(
            store.insert(1, "users", json!([{"a": 1}, "nope"])).await,
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_insert_is_atomic() {
        let store = store().await;
        {
            let conn = store.raw_connection().unwrap();
            conn.execute_batch(
                "CREATE UNIQUE INDEX idx_users_email
                 ON objects (tenant_id, collection, json_extract(body, '$.email'))",
            )
            .unwrap();
        }

        let result = store
            .insert(
                1,
                "users",
                json!([
                    {"email": "a@x"},
                    {"email": "b@x"},
                    {"email": "a@x"}
                ]),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Constraint(_))));

        // None of the batch is visible afterward.
        let remaining = store.select(1, "users", "true", &[]).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = store().await;
        let inserted = store
            .insert(1, "users", json!({"name": "alice"}))
            .await
            .unwrap();
        let id = inserted[0]["$id"].as_i64().unwrap();

        assert!(matches!(
            store.select_by_id(2, "users", id).await,
            Err(StoreError::NotFound { .. })
        ));
        let other_tenant = store
            .select(2, "users", "name = $1", &["alice".into()])
            .await
            .unwrap();
        assert!(other_tenant.is_empty());
        assert!(matches!(
            store.update_by_id(2, "users", id, json!({"name": "mallory"})).await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.delete_by_id(2, "users", id).await.unwrap(), None);

        // Tenant 1 still sees the original document.
        let doc = store.select_by_id(1, "users", id).await.unwrap();
        assert_eq!(doc["name"], json!("alice"));
    }

    #[tokio::test]
    async fn test_collection_scoping() {
        let store = store().await;
        let inserted = store.insert(1, "users", json!({"n": 1})).await.unwrap();
        let id = inserted[0]["$id"].as_i64().unwrap();
        assert!(matches!(
            store.select_by_id(1, "orders", id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_with_filters() {
        let store = store().await;
        store
            .insert(
                1,
                "users",
                json!([
                    {"name": "alice", "age": 30, "address": {"city": "berlin"}},
                    {"name": "bob", "age": 20, "address": {"city": "paris"}},
                    {"name": "carol", "age": 40, "address": {"city": "berlin"}}
                ]),
            )
            .await
            .unwrap();

        let adults = store
            .select(1, "users", "age > $1", &[Param::Int(25)])
            .await
            .unwrap();
        assert_eq!(adults.len(), 2);

        let berliners = store
            .select(1, "users", r#"address.city = "berlin""#, &[])
            .await
            .unwrap();
        assert_eq!(berliners.len(), 2);

        let either = store
            .select(1, "users", r#"age < 25 OR address.city = "berlin""#, &[])
            .await
            .unwrap();
        assert_eq!(either.len(), 3);

        let grouped = store
            .select(
                1,
                "users",
                r#"name = "alice" AND (age > $1 OR name = $2)"#,
                &[Param::Int(21), "zed".into()],
            )
            .await
            .unwrap();
        assert_eq!(grouped.len(), 1);
    }

    #[tokio::test]
    async fn test_select_null_semantics() {
        let store = store().await;
        store
            .insert(
                1,
                "users",
                json!([
                    {"name": "no-email"},
                    {"name": "null-email", "email": null},
                    {"name": "has-email", "email": "x@y"}
                ]),
            )
            .await
            .unwrap();

        // Both the missing key and the explicit null match `= null`.
        let absent = store
            .select(1, "users", "email = null", &[])
            .await
            .unwrap();
        assert_eq!(absent.len(), 2);

        let present = store
            .select(1, "users", "email != $1", &[Param::Null])
            .await
            .unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0]["name"], json!("has-email"));
    }

    #[tokio::test]
    async fn test_select_numeric_literal_dispatch() {
        let store = store().await;
        store
            .insert(1, "nums", json!([{"v": 3, "tag": "int"}, {"v": 7.5, "tag": "float"}]))
            .await
            .unwrap();

        let ints = store.select(1, "nums", "v = 3", &[]).await.unwrap();
        assert_eq!(ints.len(), 1);
        assert_eq!(ints[0]["tag"], json!("int"));

        let floats = store.select(1, "nums", "v = 7.5", &[]).await.unwrap();
        assert_eq!(floats.len(), 1);
        assert_eq!(floats[0]["tag"], json!("float"));
    }

    #[tokio::test]
    async fn test_select_order_limit_offset() {
        let store = store().await;
        store
            .insert(1, "nums", json!([{"v": 2}, {"v": 10}, {"v": 1}]))
            .await
            .unwrap();

        // Numeric ordering via CAST.
        let ordered = store
            .select(1, "nums", "true ORDER BY CAST(v) ASC", &[])
            .await
            .unwrap();
        let values: Vec<i64> = ordered.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 10]);

        let paged = store
            .select(1, "nums", "true ORDER BY CAST(v) DESC LIMIT 1 OFFSET 1", &[])
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0]["v"], json!(2));
    }

    #[tokio::test]
    async fn test_string_operand_is_bound_not_interpolated() {
        let store = store().await;
        store.insert(1, "users", json!({"name": "x"})).await.unwrap();
        let sneaky = store
            .select(1, "users", "name = $1", &["x' OR '1'='1".into()])
            .await
            .unwrap();
        assert!(sneaky.is_empty());
    }

    #[tokio::test]
    async fn test_update_by_id() {
        let store = store().await;
        let inserted = store
            .insert(1, "users", json!({"name": "alice", "age": 30}))
            .await
            .unwrap();
        let id = inserted[0]["$id"].as_i64().unwrap();

        let updated = store
            .update_by_id(1, "users", id, json!({"name": "alice", "age": 31}))
            .await
            .unwrap();
        assert_eq!(updated["$id"], json!(id));
        assert_eq!(updated["age"], json!(31));

        // Idempotent: applying the same update again yields the same state.
        let again = store
            .update_by_id(1, "users", id, json!({"name": "alice", "age": 31}))
            .await
            .unwrap();
        assert_eq!(again, updated);
        let fetched = store.select_by_id(1, "users", id).await.unwrap();
        assert_eq!(fetched, updated);

        // Full replace: keys absent from the new body are gone.
        let replaced = store
            .update_by_id(1, "users", id, json!({"renamed": true}))
            .await
            .unwrap();
        assert!(replaced.get("name").is_none());

        assert!(matches!(
            store.update_by_id(1, "users", 12_345, json!({"a": 1})).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let store = store().await;
        let inserted = store.insert(1, "users", json!({"n": 1})).await.unwrap();
        let id = inserted[0]["$id"].as_i64().unwrap();

        let deleted = store.delete_by_id(1, "users", id).await.unwrap().unwrap();
        assert_eq!(deleted, inserted[0]);

        // Absence is not an error for delete-by-id.
        assert_eq!(store.delete_by_id(1, "users", id).await.unwrap(), None);
        assert!(matches!(
            store.select_by_id(1, "users", id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_by_query() {
        let store = store().await;
        store
            .insert(
                1,
                "users",
                json!([{"age": 10}, {"age": 20}, {"age": 30}]),
            )
            .await
            .unwrap();
        store.insert(2, "users", json!({"age": 30})).await.unwrap();

        let deleted = store
            .delete(1, "users", "age >= $1", &[Param::Int(20)])
            .await
            .unwrap();
        assert_eq!(deleted.len(), 2);

        let remaining = store.select(1, "users", "true", &[]).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["age"], json!(10));

        // The other tenant's matching document is untouched.
        let other = store.select(2, "users", "true", &[]).await.unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_query_errors_surface_before_execution() {
        let store = store().await;
        assert!(matches!(
            store.select(1, "users", "name = ", &[]).await,
            Err(StoreError::Syntax(_))
        ));
        assert!(matches!(
            store.select(1, "users", "name = $3", &["a".into()]).await,
            Err(StoreError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig {
            path: dir.path().join("store.db"),
            pool_size: 2,
        };

        // A fresh file bootstraps even with migration disabled.
        {
            let store = SqliteStore::open(&config, false).await.unwrap();
            store.insert(1, "users", json!({"n": 1})).await.unwrap();
        }

        // Reopening finds the schema current and the data intact.
        let store = SqliteStore::open(&config, false).await.unwrap();
        let all = store.select(1, "users", "true", &[]).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_open_refuses_stale_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig {
            path: dir.path().join("store.db"),
            pool_size: 2,
        };
        {
            let conn = rusqlite::Connection::open(&config.path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema (version INTEGER); INSERT INTO schema VALUES (0);",
            )
            .unwrap();
        }

        let err = SqliteStore::open(&config, false).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaVersion { found: 0, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let store = std::sync::Arc::new(store().await);
        let mut handles = Vec::new();
        for i in 0..8i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(1, "items", json!({"n": i})).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let all = store.select(1, "items", "true", &[]).await.unwrap();
        assert_eq!(all.len(), 8);
    }
}
