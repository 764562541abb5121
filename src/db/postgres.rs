//! PostgreSQL object store.
//!
//! Documents live in a `jsonb` column; query predicates compile through
//! [`PostgresDialect`] into native `->`/`->>` descent. Every operation checks
//! one pooled connection out for its own lifetime and runs inside its own
//! short-lived transaction, which rolls back on any exit path that is not an
//! explicit commit (including a dropped future).

use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::ast::{self, Fragment, Param, PostgresDialect};

use super::config::PostgresConfig;
use super::{connection, document, inject_id, migrate, normalize_documents, strip_id};
use super::{Result, StoreError};

/// The JSON document column every compiled predicate descends from.
const BODY_COLUMN: &str = "body";
/// Bind positions reserved ahead of each compiled fragment: tenant ($1)
/// and collection ($2).
const SCOPE_PARAMS: usize = 2;

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the pool and verify the schema version, migrating first when
    /// permitted. Fails rather than serving traffic against an unexpected
    /// schema.
    pub async fn connect(config: &PostgresConfig, allow_migrate: bool) -> Result<Self> {
        let pool = connection::create_postgres_pool(config)?;
        migrate::migrate_postgres(&pool, allow_migrate).await?;
        Ok(PostgresStore { pool })
    }

    /// Shut the pool down. In-flight operations fail; idle connections close.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to check out connection: {e}")))
    }

    pub async fn select_by_id(&self, tenant_id: i64, collection: &str, id: i64) -> Result<Value> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let row = tx
            .query_opt(
                "SELECT body FROM objects WHERE id = $1 AND tenant_id = $2 AND collection = $3",
                &[&id, &tenant_id, &collection],
            )
            .await
            .map_err(map_pg_error)?;
        tx.commit().await.map_err(map_pg_error)?;
        match row {
            Some(row) => Ok(document(id, row.get(0))),
            None => Err(StoreError::NotFound {
                id,
                collection: collection.to_string(),
            }),
        }
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

        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let mut binds: Vec<&(dyn ToSql + Sync)> = vec![&tenant_id, &collection];
        push_fragment_params(&mut binds, &fragment.params);
        let rows = tx.query(&sql, &binds).await.map_err(map_pg_error)?;
        tx.commit().await.map_err(map_pg_error)?;

        Ok(rows
            .into_iter()
            .map(|row| document(row.get(0), row.get(1)))
            .collect())
    }

    pub async fn insert(
        &self,
        tenant_id: i64,
        collection: &str,
        payload: Value,
    ) -> Result<Vec<Value>> {
        let docs = normalize_documents(payload)?;

        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let stmt = tx
            .prepare("INSERT INTO objects (tenant_id, collection, body) VALUES ($1, $2, $3) RETURNING id")
            .await
            .map_err(map_pg_error)?;

        let mut results = Vec::with_capacity(docs.len());
        for mut doc in docs {
            // Any failure here drops the transaction, rolling back the
            // whole batch.
            let row = tx
                .query_one(&stmt, &[&tenant_id, &collection, &doc])
                .await
                .map_err(map_pg_error)?;
            inject_id(&mut doc, row.get(0));
            results.push(doc);
        }
        tx.commit().await.map_err(map_pg_error)?;
        Ok(results)
    }

    pub async fn update_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
        payload: Value,
    ) -> Result<Value> {
        let mut doc = strip_id(payload)?;
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let updated = tx
            .execute(
                "UPDATE objects SET body = $1 WHERE id = $2 AND tenant_id = $3 AND collection = $4",
                &[&doc, &id, &tenant_id, &collection],
            )
            .await
            .map_err(map_pg_error)?;
        tx.commit().await.map_err(map_pg_error)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                id,
                collection: collection.to_string(),
            });
        }
        inject_id(&mut doc, id);
        Ok(doc)
    }

    pub async fn delete_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
    ) -> Result<Option<Value>> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let row = tx
            .query_opt(
                "DELETE FROM objects WHERE id = $1 AND tenant_id = $2 AND collection = $3 RETURNING body",
                &[&id, &tenant_id, &collection],
            )
            .await
            .map_err(map_pg_error)?;
        tx.commit().await.map_err(map_pg_error)?;
        Ok(row.map(|row| document(id, row.get(0))))
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

        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        let mut binds: Vec<&(dyn ToSql + Sync)> = vec![&tenant_id, &collection];
        push_fragment_params(&mut binds, &fragment.params);
        // Selecting and deleting share this transaction, so concurrent
        // writers cannot change the row set between the two passes.
        let rows = tx.query(&sql, &binds).await.map_err(map_pg_error)?;
        let stmt = tx
            .prepare("DELETE FROM objects WHERE id = $1 AND tenant_id = $2 AND collection = $3")
            .await
            .map_err(map_pg_error)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            tx.execute(&stmt, &[&id, &tenant_id, &collection])
                .await
                .map_err(map_pg_error)?;
            results.push(document(id, row.get(1)));
        }
        tx.commit().await.map_err(map_pg_error)?;
        Ok(results)
    }
}

fn compile_query(query: &str, params: &[Param]) -> Result<Fragment> {
    let parsed = ast::parse(query)?;
    Ok(ast::compile(
        &parsed,
        &PostgresDialect,
        params,
        BODY_COLUMN,
        SCOPE_PARAMS,
    )?)
}

fn select_sql(fragment: &Fragment) -> String {
    format!(
        "SELECT id, body FROM objects WHERE tenant_id = $1 AND collection = $2 AND {}{}",
        fragment.predicate,
        fragment.clauses()
    )
}

fn push_fragment_params<'a>(binds: &mut Vec<&'a (dyn ToSql + Sync)>, params: &'a [Param]) {
    static NULL_PARAM: Option<i64> = None;
    for param in params {
        match param {
            Param::Str(v) => binds.push(v),
            Param::Int(v) => binds.push(v),
            Param::Float(v) => binds.push(v),
            Param::Bool(v) => binds.push(v),
            // Null operands are elided by the compiler; this arm exists so
            // the match stays exhaustive if that ever changes.
            Param::Null => binds.push(&NULL_PARAM),
        }
    }
}

fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    if let Some(db) = e.as_db_error() {
        // SQLSTATE class 23: integrity constraint violation.
        if db.code().code().starts_with("23") {
            return StoreError::Constraint(db.message().to_string());
        }
    }
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_sql_shape() {
        let fragment = compile_query("name = $1 ORDER BY CAST(age) DESC LIMIT 10", &["a".into()])
            .unwrap();
        assert_eq!(
            select_sql(&fragment),
            "SELECT id, body FROM objects WHERE tenant_id = $1 AND collection = $2 \
             AND (body->>'name' = $3) ORDER BY CAST(body->>'age' AS NUMERIC) DESC LIMIT 10"
        );
    }

    #[test]
    fn test_compile_query_propagates_syntax_errors() {
        assert!(matches!(
            compile_query("name = ", &[]),
            Err(StoreError::Syntax(_))
        ));
        assert!(matches!(
            compile_query("name = $2", &["a".into()]),
            Err(StoreError::Bind(_))
        ));
    }
}
