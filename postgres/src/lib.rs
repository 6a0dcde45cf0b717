//! `PostgreSQL` ledgers for Outpost.
//!
//! This crate implements the storage traits from `outpost-core` on top of a
//! sqlx connection pool:
//!
//! - [`TransactionalStore`]: [`PgTransaction`] wraps a sqlx transaction that
//!   rolls back when dropped uncommitted
//! - `OutboxStore`: `outbox_events`, with row claims via `FOR UPDATE SKIP LOCKED`
//! - `InboxStore`: `consumed_messages`, deduplicated by a unique constraint
//! - `EventStore` and `TicketStore`: the `events` and `tickets` tables
//!
//! Other business tables join the same transaction through
//! [`PgTransaction::conn`].
//!
//! # Example
//!
//! ```ignore
//! use outpost_postgres::PostgresStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::new("postgres://localhost/outpost").await?;
//!     store.migrate().await?;
//!
//!     let mut tx = store.begin().await?;
//!     sqlx::query("INSERT INTO events ...").execute(tx.conn()).await?;
//!     store.create_outbox_event(&mut tx, outbox_row).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

mod catalog;
mod inbox;
mod outbox;

use outpost_core::clock::{Clock, SystemClock};
use outpost_core::store::{StoreError, StoreTransaction, TransactionalStore};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Database URL
    pub url: String,
    /// Pool size (default: 10)
    pub max_connections: u32,
    /// Bound on acquiring a connection (default: 30s)
    pub connect_timeout: Duration,
}

impl PoolConfig {
    /// Settings for `url` with default pool limits.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the connection acquire timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Outbox and inbox ledgers in `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the database is unreachable.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(&PoolConfig::new(database_url)).await
    }

    /// Connect with explicit pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the database is unreachable.
    pub async fn connect_with(config: &PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for ledger timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they don't already exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

/// An open database transaction.
///
/// Dropping it without [`commit`](StoreTransaction::commit) rolls back.
pub struct PgTransaction {
    inner: Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// The connection to run business queries on inside this transaction.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

impl StoreTransaction for PgTransaction {
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.inner.commit().await.map_err(map_sqlx_error) }
    }

    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.inner.rollback().await.map_err(map_sqlx_error) }
    }
}

impl TransactionalStore for PostgresStore {
    type Tx = PgTransaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send {
        async move {
            let inner = self.pool.begin().await.map_err(map_sqlx_error)?;
            Ok(PgTransaction { inner })
        }
    }
}

/// Classify a sqlx error.
///
/// Unique violations keep the constraint name so callers can tell a duplicate
/// inbox row from a duplicate business row.
#[must_use]
pub fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            constraint: db.constraint().unwrap_or("unknown").to_string(),
        },
        sqlx::Error::RowNotFound => StoreError::NotFound(error.to_string()),
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Connection(error.to_string()),
        _ => StoreError::Database(error.to_string()),
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolClosed),
            StoreError::Connection(_)
        ));
    }

    #[test]
    fn missing_rows_are_not_found() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn other_errors_are_database_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::ColumnNotFound("seq".to_string())),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::new("postgres://localhost/outpost")
            .with_max_connections(4)
            .with_connect_timeout(Duration::from_secs(5));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(PoolConfig::new("x").max_connections, 10);
    }
}
