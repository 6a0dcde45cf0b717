//! Inbox ledger: identifiers of messages whose effect has been applied.
//!
//! Both operations take the transaction of the effect they guard. The
//! uniqueness constraint on `message_id` is what makes the ledger safe under
//! concurrent consumers: of two transactions racing on the same id, the second
//! insert fails with [`StoreError::UniqueViolation`] and its effect is rolled
//! back with it.

use crate::store::{StoreError, TransactionalStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Unique constraint on the ledger's `message_id`.
///
/// A violation of this constraint, and only this one, means another
/// transaction already recorded the message.
pub const CONSUMED_MESSAGE_CONSTRAINT: &str = "consumed_messages_message_id_key";

/// A row of the inbox ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessage {
    /// Dedup key (unique)
    pub message_id: String,
    /// When the effect was committed
    pub consumed_at: DateTime<Utc>,
}

/// Result of running an effect through the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome<T> {
    /// The effect ran and committed together with the ledger row
    Applied(T),
    /// The message id was already in the ledger; nothing ran
    Duplicate,
}

impl<T> InboxOutcome<T> {
    /// Whether the message was absorbed as a duplicate.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Storage operations on the inbox ledger.
pub trait InboxStore: TransactionalStore {
    /// Whether `message_id` has been recorded, as seen by `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lookup fails.
    fn is_message_consumed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record `message_id` inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UniqueViolation`] on
    /// [`CONSUMED_MESSAGE_CONSTRAINT`] if the id is already recorded (possibly
    /// by a concurrent transaction), or another [`StoreError`] if the insert
    /// fails.
    fn mark_message_consumed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
