//! Backend connectivity: a deadpool-managed PostgreSQL pool (TLS-capable)
//! and an r2d2-managed SQLite pool.
//!
//! Each logical store operation checks one connection out of its pool for
//! the duration of that operation's transaction and returns it on every exit
//! path; pools are the only shared resource between concurrent callers.

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use r2d2_sqlite::SqliteConnectionManager;
use tokio_postgres::NoTls;

use super::config::{PostgresConfig, SqliteConfig, SslMode};
use super::{Result, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) type SqlitePool = r2d2::Pool<SqliteConnectionManager>;
pub(crate) type SqliteConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Build the PostgreSQL connection pool. Connections are established lazily,
/// with a per-connection create timeout.
pub(crate) fn create_postgres_pool(config: &PostgresConfig) -> Result<Pool> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.username)
        .password(&config.password)
        .connect_timeout(CONNECT_TIMEOUT)
        .ssl_mode(match config.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = match config.ssl_mode {
        SslMode::Disable => Manager::from_config(pg, NoTls, manager_config),
        SslMode::Prefer | SslMode::Require => {
            Manager::from_config(pg, build_tls_connector(config, false)?, manager_config)
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            Manager::from_config(pg, build_tls_connector(config, true)?, manager_config)
        }
    };

    Pool::builder(manager)
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .create_timeout(Some(CONNECT_TIMEOUT))
        .build()
        .map_err(|e| StoreError::Backend(format!("failed to build connection pool: {e}")))
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `strict_verify` is set for the verify-ca/verify-full modes, where
/// certificate verification must not be disabled.
fn build_tls_connector(config: &PostgresConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            StoreError::Backend(format!("failed to read CA certificate file {ca_path}: {e}"))
        })?;
        let blocks = split_pem_certificates(&pem);
        if blocks.is_empty() {
            return Err(StoreError::Backend(format!(
                "no certificates found in {ca_path}"
            )));
        }
        for block in blocks {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .map_err(|e| StoreError::Backend(format!("invalid CA certificate: {e}")))?;
            builder.add_root_certificate(cert);
        }
    }
    // Otherwise the system CA store applies.

    let connector = builder
        .build()
        .map_err(|e| StoreError::Backend(format!("failed to build TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificate blocks.
fn split_pem_certificates(pem: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(pem);
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut inside = false;
    for line in text.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            inside = true;
            current.clear();
        }
        if inside {
            current.push_str(line);
            current.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") {
            inside = false;
            blocks.push(current.clone());
        }
    }
    blocks
}

/// Build the SQLite connection pool over a database file.
pub(crate) fn create_sqlite_pool(config: &SqliteConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let manager = SqliteConnectionManager::file(&config.path).with_init(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))
    });
    r2d2::Pool::builder()
        .max_size(config.pool_size)
        .build(manager)
        .map_err(|e| StoreError::Backend(format!("failed to build connection pool: {e}")))
}

/// In-memory SQLite pool for tests. Capped at one connection: each in-memory
/// connection is its own database, so the pool must hand out the same one.
pub(crate) fn create_sqlite_memory_pool() -> Result<SqlitePool> {
    let manager = SqliteConnectionManager::memory();
    r2d2::Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| StoreError::Backend(format!("failed to build connection pool: {e}")))
}
