//! Outbox ledger: events pending publication.
//!
//! # Lifecycle of a row
//!
//! ```text
//!  business tx ──create_outbox_event──► unpublished ──claim_unpublished──► claimed
//!                                           ▲                                 │
//!                                           │ release_claim / lease expiry    │
//!                                           └─────────────────────────────────┤
//!                                                                             │ mark_published
//!                                                                             ▼
//!                                                                         published
//! ```
//!
//! - A row exists if and only if the business transaction that wrote it committed.
//! - `published` flips from `false` to `true` at most once and never reverts.
//! - Rows are never deleted by this crate; retention is an operational concern.
//! - Claims are leases, not state: a crashed poller's claim simply expires.

use crate::envelope::{DomainEvent, EnvelopeError};
use crate::store::{StoreError, TransactionalStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// A row of the outbox ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Row identity; doubles as the dedup key of every publish of this row
    pub id: Uuid,
    /// The business entity the event describes
    pub aggregate_id: String,
    /// Type tag, e.g. `event.created`
    pub event_type: String,
    /// Serialized payload (JSON text)
    pub event_data: String,
    /// Whether the row has been delivered to the broker
    pub published: bool,
    /// When the row was written
    pub created_at: DateTime<Utc>,
    /// When the row was marked published
    pub published_at: Option<DateTime<Utc>>,
}

/// Input to [`OutboxStore::create_outbox_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// The business entity the event describes
    pub aggregate_id: String,
    /// Type tag, e.g. `event.created`
    pub event_type: String,
    /// Serialized payload (JSON text)
    pub event_data: String,
}

impl NewOutboxEvent {
    /// Create a ledger row from raw parts.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        event_data: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            event_data: event_data.into(),
        }
    }

    /// Create a ledger row carrying a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the payload cannot be serialized.
    pub fn for_event(
        aggregate_id: impl Into<String>,
        event: &DomainEvent,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self::new(aggregate_id, event.event_type(), event.to_outbox_data()?))
    }
}

/// Storage operations on the outbox ledger.
///
/// The writer half ([`create_outbox_event`](Self::create_outbox_event)) runs
/// inside the caller's transaction. The poller half runs in its own short
/// statements.
pub trait OutboxStore: TransactionalStore {
    /// Insert a ledger row inside an open business transaction.
    ///
    /// Performs a single insert and never commits; the row becomes visible to
    /// pollers only once the caller commits `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails. The caller should abort the
    /// business write.
    fn create_outbox_event(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> impl Future<Output = Result<OutboxEvent, StoreError>> + Send;

    /// Read up to `limit` unpublished rows, oldest first, without claiming them.
    ///
    /// For inspecting the backlog; publishing goes through
    /// [`claim_unpublished`](Self::claim_unpublished).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn list_unpublished(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send;

    /// Claim up to `limit` unpublished rows, oldest first.
    ///
    /// Only rows with no claim or an expired claim are eligible. Claimed rows
    /// are invisible to other claimers until `lease` elapses or
    /// [`release_claim`](Self::release_claim) is called.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the claim fails.
    fn claim_unpublished(
        &self,
        limit: usize,
        lease: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send;

    /// Drop the claim on a row so the next claimer can pick it up immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn release_claim(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Mark a row published and clear its claim.
    ///
    /// Returns `true` if this call flipped the flag, `false` if the row was
    /// already published or does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_published(&self, id: Uuid) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Look up a single row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_outbox_event(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<OutboxEvent>, StoreError>> + Send;
}
