//! Storage backends for the object store.
//!
//! This module provides the I/O half of the pipeline: pooled connectivity,
//! schema migrations, and the per-backend object stores, unified behind the
//! [`Store`] enum.
//!
//! # Invariants
//!
//! Every backend enforces the same contract, independent of dialect:
//! - All operations are scoped by `(tenant_id, collection)`; the scoping
//!   predicates are appended by the store itself and can never be overridden
//!   by caller-supplied query text.
//! - The reserved `$id` key is stripped from documents before every write
//!   and injected into documents after every read.
//! - Every operation runs inside exactly one short-lived transaction, so
//!   multi-statement work (batch insert, query-then-delete, a migration
//!   step) never leaves partial effects observable, including when the
//!   caller drops the future mid-flight.
//!
//! Stores hold no mutable state beyond the connection pool, so a single
//! instance may be shared across any number of tasks. Parsing and
//! compilation always run before a connection is checked out, so a bad query
//! never occupies a transaction.

pub mod config;
pub mod connection;
pub mod migrate;
pub mod postgres;
pub mod sqlite;

pub use config::{default_config_path, BackendKind, PostgresConfig, SqliteConfig, SslMode, StoreConfig};
pub use migrate::SCHEMA_VERSION;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use serde_json::Value;
use thiserror::Error;

use crate::ast::{CompileError, Param, SyntaxError};

/// Reserved top-level document key carrying the backend-assigned identifier.
pub const ID_KEY: &str = "$id";

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything a store operation can fail with.
///
/// Parser and compiler failures are deterministic and detected before any
/// transaction opens; backend failures during a transaction roll it back
/// before surfacing here. The store itself never retries.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed query text, with the offending position.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// One or more placeholders could not be resolved.
    #[error(transparent)]
    Bind(#[from] CompileError),

    #[error("object {id} not found in collection '{collection}'")]
    NotFound { id: i64, collection: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The backend rejected a write (uniqueness or similar).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The stored schema version does not match this build.
    #[error("the store schema is at version {found} but version {want} is required; migrate by invoking with the --migrate flag")]
    SchemaVersion { found: i64, want: i64 },

    /// Connectivity, transaction, or other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// A backend-agnostic handle to one configured object store.
///
/// All operations are scoped by `(tenant_id, collection)` and return
/// documents with the `$id` key attached.
pub enum Store {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
}

impl Store {
    /// Connect to the configured backend and verify its schema version,
    /// migrating first if `config.migrate` permits.
    pub async fn connect(config: &StoreConfig) -> Result<Store> {
        match config.backend {
            BackendKind::Postgres => Ok(Store::Postgres(
                PostgresStore::connect(&config.postgres, config.migrate).await?,
            )),
            BackendKind::Sqlite => Ok(Store::Sqlite(
                SqliteStore::open(&config.sqlite, config.migrate).await?,
            )),
        }
    }

    /// Read one document by identifier.
    pub async fn select_by_id(&self, tenant_id: i64, collection: &str, id: i64) -> Result<Value> {
        match self {
            Store::Postgres(s) => s.select_by_id(tenant_id, collection, id).await,
            Store::Sqlite(s) => s.select_by_id(tenant_id, collection, id).await,
        }
    }

    /// Query documents with the filter language.
    pub async fn select(
        &self,
        tenant_id: i64,
        collection: &str,
        query: &str,
        params: &[Param],
    ) -> Result<Vec<Value>> {
        match self {
            Store::Postgres(s) => s.select(tenant_id, collection, query, params).await,
            Store::Sqlite(s) => s.select(tenant_id, collection, query, params).await,
        }
    }

    /// Insert one document, or a whole batch when given an array.
    /// A batch is all-or-nothing.
    pub async fn insert(
        &self,
        tenant_id: i64,
        collection: &str,
        document: Value,
    ) -> Result<Vec<Value>> {
        match self {
            Store::Postgres(s) => s.insert(tenant_id, collection, document).await,
            Store::Sqlite(s) => s.insert(tenant_id, collection, document).await,
        }
    }

    /// Replace one document's body by identifier.
    pub async fn update_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
        document: Value,
    ) -> Result<Value> {
        match self {
            Store::Postgres(s) => s.update_by_id(tenant_id, collection, id, document).await,
            Store::Sqlite(s) => s.update_by_id(tenant_id, collection, id, document).await,
        }
    }

    /// Delete one document by identifier, returning it when present.
    /// Absence is not an error here, unlike [`Store::select_by_id`].
    pub async fn delete_by_id(
        &self,
        tenant_id: i64,
        collection: &str,
        id: i64,
    ) -> Result<Option<Value>> {
        match self {
            Store::Postgres(s) => s.delete_by_id(tenant_id, collection, id).await,
            Store::Sqlite(s) => s.delete_by_id(tenant_id, collection, id).await,
        }
    }

    /// Delete every document matching the query, returning the deleted
    /// documents. Runs as a single transaction.
    pub async fn delete(
        &self,
        tenant_id: i64,
        collection: &str,
        query: &str,
        params: &[Param],
    ) -> Result<Vec<Value>> {
        match self {
            Store::Postgres(s) => s.delete(tenant_id, collection, query, params).await,
            Store::Sqlite(s) => s.delete(tenant_id, collection, query, params).await,
        }
    }

    /// Shut the backend pool down.
    pub fn close(&self) {
        match self {
            Store::Postgres(s) => s.close(),
            Store::Sqlite(s) => s.close(),
        }
    }
}

// ---------------------------------------------------------------------------
// Document helpers shared by both backends
// ---------------------------------------------------------------------------

/// Validate an insert payload: one JSON object or an array of JSON objects.
/// Strips any inbound `$id` from each.
pub(crate) fn normalize_documents(document: Value) -> Result<Vec<Value>> {
    match document {
        Value::Array(items) => items.into_iter().map(strip_id).collect(),
        other => Ok(vec![strip_id(other)?]),
    }
}

/// Require a JSON object and remove the reserved identifier key.
pub(crate) fn strip_id(mut document: Value) -> Result<Value> {
    match document.as_object_mut() {
        Some(map) => {
            map.remove(ID_KEY);
            Ok(document)
        }
        None => Err(StoreError::InvalidDocument(
            "expected a JSON object".to_string(),
        )),
    }
}

/// Attach the backend-assigned identifier under the reserved key.
pub(crate) fn inject_id(document: &mut Value, id: i64) {
    if let Some(map) = document.as_object_mut() {
        map.insert(ID_KEY.to_string(), Value::from(id));
    }
}

/// Build the outward document shape from a row.
pub(crate) fn document(id: i64, mut body: Value) -> Value {
    inject_id(&mut body, id);
    body
}
