//! Transactional storage abstraction shared by the outbox and inbox ledgers.
//!
//! A ledger write is only meaningful when it shares a transaction with the
//! business write it accompanies. [`TransactionalStore::begin`] hands out a
//! [`StoreTransaction`] guard: the caller performs every write through it and
//! then commits. Any exit path that does not call
//! [`StoreTransaction::commit`] (an early `?` return, a panic, a dropped
//! future) rolls the transaction back when the guard is dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tx = store.begin().await?;
//! insert_event_row(&mut tx, &event).await?;          // business write
//! store.create_outbox_event(&mut tx, outbox_row).await?; // ledger write
//! tx.commit().await?;                                 // both or neither
//! ```

use std::future::Future;
use thiserror::Error;

/// Errors raised by the local store (the `TransactionError` class).
///
/// Propagated to the caller of a business write; the write is aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the connection was lost
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// The store rejected or failed a statement
    #[error("Database error: {0}")]
    Database(String),

    /// A uniqueness constraint rejected the write
    #[error("Unique constraint '{constraint}' violated")]
    UniqueViolation {
        /// Name of the violated constraint
        constraint: String,
    },

    /// The addressed row does not exist
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether this error is a uniqueness violation.
    #[must_use]
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    /// Whether this error is a violation of the constraint named `name`.
    #[must_use]
    pub fn violates(&self, name: &str) -> bool {
        matches!(self, Self::UniqueViolation { constraint } if constraint == name)
    }
}

/// An open transaction.
///
/// Dropping the value without calling [`commit`](Self::commit) discards every
/// write made through it.
pub trait StoreTransaction: Send {
    /// Commit all writes made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; the writes are then rolled back.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Explicitly roll back all writes made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store could not be told to roll back.
    /// The writes are discarded regardless.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A store that can open transactions.
pub trait TransactionalStore: Send + Sync {
    /// Transaction guard type handed to ledger and business writes.
    type Tx: StoreTransaction;

    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the store is unavailable.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;
}
