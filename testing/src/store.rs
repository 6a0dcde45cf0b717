//! In-memory implementation of the outbox and inbox ledgers.
//!
//! Writes made through an [`InMemoryTransaction`] are staged and only become
//! visible at commit. Uniqueness is checked twice: eagerly when the write is
//! staged, and again at commit against whatever other transactions committed
//! in between. That second check is what lets tests reproduce the race where
//! two consumers both see a message as unconsumed and only one commit wins.
//!
//! Alongside the two ledgers the store keeps untyped business records
//! (`collection -> key -> JSON`), so services can test their own writes in the
//! same transaction without a database. Counter increments on those records
//! are staged as deltas and added to the committed value, the way
//! `SET n = n + 1` behaves in SQL.

use chrono::{DateTime, Utc};
use outpost_core::catalog::{
    EventRecord, EventStore, Organizer, OrganizerStore, Ticket, TicketStore,
};
use outpost_core::clock::Clock;
use outpost_core::inbox::{CONSUMED_MESSAGE_CONSTRAINT, ConsumedMessage, InboxStore};
use outpost_core::outbox::{NewOutboxEvent, OutboxEvent, OutboxStore};
use outpost_core::store::{StoreError, StoreTransaction, TransactionalStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::{Future, ready};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    outbox: Vec<OutboxEvent>,
    claims: HashMap<Uuid, DateTime<Utc>>,
    consumed: Vec<ConsumedMessage>,
    records: HashMap<String, BTreeMap<String, Value>>,
    failing_commits: usize,
    unavailable: bool,
}

impl StoreState {
    fn is_consumed(&self, message_id: &str) -> bool {
        self.consumed.iter().any(|m| m.message_id == message_id)
    }

    fn has_record(&self, collection: &str, key: &str) -> bool {
        self.records
            .get(collection)
            .is_some_and(|rows| rows.contains_key(key))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Connection("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_constraint(collection: &str) -> String {
    format!("{collection}_pkey")
}

fn add_to_field(record: &mut Value, field: &str, delta: i64) -> i64 {
    let current = record.get(field).and_then(Value::as_i64).unwrap_or(0);
    let updated = current.saturating_add(delta);
    if let Some(object) = record.as_object_mut() {
        object.insert(field.to_string(), Value::from(updated));
    }
    updated
}

/// In-memory store implementing [`OutboxStore`] and [`InboxStore`].
///
/// Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store using `clock` for timestamps.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    /// The clock used for timestamps and claim leases.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Make the next `count` commits fail with a connection error.
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.state).failing_commits = count;
    }

    /// Simulate the store going down (or coming back).
    ///
    /// While unavailable, every operation fails with [`StoreError::Connection`].
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Snapshot of every committed outbox row, in insertion order.
    #[must_use]
    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        lock(&self.state).outbox.clone()
    }

    /// Snapshot of the committed inbox ledger.
    #[must_use]
    pub fn consumed_messages(&self) -> Vec<ConsumedMessage> {
        lock(&self.state).consumed.clone()
    }

    /// Committed business records of `collection`, ordered by key.
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<Value> {
        lock(&self.state)
            .records
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a claim is currently held on outbox row `id`.
    #[must_use]
    pub fn is_claimed(&self, id: Uuid) -> bool {
        let now = self.clock.now();
        lock(&self.state)
            .claims
            .get(&id)
            .is_some_and(|until| *until > now)
    }

    fn unpublished(state: &StoreState, now: DateTime<Utc>, honour_claims: bool) -> Vec<usize> {
        let mut indices: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.published)
            .filter(|(_, row)| {
                !honour_claims || state.claims.get(&row.id).is_none_or(|until| *until <= now)
            })
            .map(|(index, _)| index)
            .collect();
        indices.sort_by_key(|index| state.outbox[*index].created_at);
        indices
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryStore")
            .field("outbox", &state.outbox.len())
            .field("consumed", &state.consumed.len())
            .finish_non_exhaustive()
    }
}

/// Transaction over an [`InMemoryStore`].
///
/// Dropping it without committing discards the staged writes.
pub struct InMemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    outbox: Vec<OutboxEvent>,
    consumed: Vec<ConsumedMessage>,
    records: Vec<(String, String, Value)>,
    increments: Vec<(String, String, String, i64)>,
}

impl InMemoryTransaction {
    /// Stage a business record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UniqueViolation`] if `key` already exists in
    /// `collection`, committed or staged.
    pub fn insert_record(
        &mut self,
        collection: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let state = lock(&self.state);
        state.check_available()?;
        if state.has_record(collection, key) || self.has_staged_record(collection, key) {
            return Err(StoreError::UniqueViolation {
                constraint: record_constraint(collection),
            });
        }
        drop(state);
        self.records
            .push((collection.to_string(), key.to_string(), value));
        Ok(())
    }

    /// Look up a record as seen by this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the store is unavailable.
    pub fn find_record(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let staged = self
            .records
            .iter()
            .find(|(c, k, _)| c == collection && k == key)
            .map(|(_, _, value)| value.clone());
        let found = match staged {
            Some(value) => Some(value),
            None => {
                let state = lock(&self.state);
                state.check_available()?;
                state
                    .records
                    .get(collection)
                    .and_then(|rows| rows.get(key))
                    .cloned()
            },
        };
        Ok(found.map(|mut value| {
            for (c, k, field, delta) in &self.increments {
                if c == collection && k == key {
                    add_to_field(&mut value, field, *delta);
                }
            }
            value
        }))
    }

    /// Stage `field += 1` on a record and return the value this transaction
    /// now sees, or `None` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the store is unavailable.
    pub fn increment_field(
        &mut self,
        collection: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<i64>, StoreError> {
        let Some(mut value) = self.find_record(collection, key)? else {
            return Ok(None);
        };
        self.increments
            .push((collection.to_string(), key.to_string(), field.to_string(), 1));
        Ok(Some(add_to_field(&mut value, field, 1)))
    }

    fn has_staged_record(&self, collection: &str, key: &str) -> bool {
        self.records
            .iter()
            .any(|(c, k, _)| c == collection && k == key)
    }

    fn is_consumed(&self, message_id: &str) -> bool {
        self.consumed.iter().any(|m| m.message_id == message_id)
    }

    fn apply(self) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Connection("commit failed".to_string()));
        }

        if self.consumed.iter().any(|m| state.is_consumed(&m.message_id)) {
            return Err(StoreError::UniqueViolation {
                constraint: CONSUMED_MESSAGE_CONSTRAINT.to_string(),
            });
        }
        if let Some((collection, _, _)) = self
            .records
            .iter()
            .find(|(c, k, _)| state.has_record(c, k))
        {
            return Err(StoreError::UniqueViolation {
                constraint: record_constraint(collection),
            });
        }

        state.outbox.extend(self.outbox);
        state.consumed.extend(self.consumed);
        for (collection, key, value) in self.records {
            state.records.entry(collection).or_default().insert(key, value);
        }
        for (collection, key, field, delta) in self.increments {
            if let Some(value) = state
                .records
                .get_mut(&collection)
                .and_then(|rows| rows.get_mut(&key))
            {
                add_to_field(value, &field, delta);
            }
        }
        Ok(())
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send {
        ready(self.apply())
    }

    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send {
        drop(self);
        ready(Ok(()))
    }
}

impl TransactionalStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send {
        let result = lock(&self.state).check_available().map(|()| InMemoryTransaction {
            state: Arc::clone(&self.state),
            outbox: Vec::new(),
            consumed: Vec::new(),
            records: Vec::new(),
            increments: Vec::new(),
        });
        ready(result)
    }
}

impl OutboxStore for InMemoryStore {
    fn create_outbox_event(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> impl Future<Output = Result<OutboxEvent, StoreError>> + Send {
        let result = lock(&self.state).check_available().map(|()| {
            let row = OutboxEvent {
                id: Uuid::new_v4(),
                aggregate_id: event.aggregate_id,
                event_type: event.event_type,
                event_data: event.event_data,
                published: false,
                created_at: self.clock.now(),
                published_at: None,
            };
            tx.outbox.push(row.clone());
            row
        });
        ready(result)
    }

    fn list_unpublished(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send {
        let state = lock(&self.state);
        let result = state.check_available().map(|()| {
            Self::unpublished(&state, self.clock.now(), false)
                .into_iter()
                .take(limit)
                .map(|index| state.outbox[index].clone())
                .collect()
        });
        ready(result)
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        lease: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send {
        let now = self.clock.now();
        let result = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Database(e.to_string()))
            .and_then(|lease| {
                let mut state = lock(&self.state);
                state.check_available()?;
                let until = now + lease;
                let claimed: Vec<OutboxEvent> = Self::unpublished(&state, now, true)
                    .into_iter()
                    .take(limit)
                    .map(|index| state.outbox[index].clone())
                    .collect();
                for row in &claimed {
                    state.claims.insert(row.id, until);
                }
                Ok(claimed)
            });
        ready(result)
    }

    fn release_claim(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send {
        let mut state = lock(&self.state);
        let result = state.check_available().map(|()| {
            state.claims.remove(&id);
        });
        ready(result)
    }

    fn mark_published(&self, id: Uuid) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let result = state.check_available().map(|()| {
            state.claims.remove(&id);
            match state.outbox.iter_mut().find(|row| row.id == id) {
                Some(row) if !row.published => {
                    row.published = true;
                    row.published_at = Some(now);
                    true
                },
                _ => false,
            }
        });
        ready(result)
    }

    fn find_outbox_event(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<OutboxEvent>, StoreError>> + Send {
        let state = lock(&self.state);
        let result = state
            .check_available()
            .map(|()| state.outbox.iter().find(|row| row.id == id).cloned());
        ready(result)
    }
}

impl InboxStore for InMemoryStore {
    fn is_message_consumed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let state = lock(&self.state);
        let result = state
            .check_available()
            .map(|()| tx.is_consumed(message_id) || state.is_consumed(message_id));
        ready(result)
    }

    fn mark_message_consumed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let state = lock(&self.state);
        let result = state.check_available().and_then(|()| {
            if tx.is_consumed(message_id) || state.is_consumed(message_id) {
                return Err(StoreError::UniqueViolation {
                    constraint: CONSUMED_MESSAGE_CONSTRAINT.to_string(),
                });
            }
            tx.consumed.push(ConsumedMessage {
                message_id: message_id.to_string(),
                consumed_at: self.clock.now(),
            });
            Ok(())
        });
        ready(result)
    }
}

/// Collection holding [`EventRecord`]s, keyed by id.
pub const EVENTS: &str = "events";

/// Collection holding [`Ticket`]s, keyed by `<event_id>/<name>`.
pub const TICKETS: &str = "tickets";

/// Collection holding [`Organizer`]s, keyed by id.
pub const ORGANIZERS: &str = "organizers";

fn ticket_key(event_id: Uuid, name: &str) -> String {
    format!("{event_id}/{name}")
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Database(format!("Failed to encode record: {e}")))
}

impl EventStore for InMemoryStore {
    fn insert_event(
        &self,
        tx: &mut Self::Tx,
        event: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = encode(event)
            .and_then(|value| tx.insert_record(EVENTS, &event.id.to_string(), value));
        ready(result)
    }

    fn find_event(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send {
        let result = tx.find_record(EVENTS, &id.to_string()).and_then(|found| {
            found
                .map(|value| {
                    serde_json::from_value(value)
                        .map_err(|e| StoreError::Database(format!("Failed to decode event: {e}")))
                })
                .transpose()
        });
        ready(result)
    }
}

impl TicketStore for InMemoryStore {
    fn ticket_exists(
        &self,
        tx: &mut Self::Tx,
        event_id: Uuid,
        name: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = tx
            .find_record(TICKETS, &ticket_key(event_id, name))
            .map(|found| found.is_some());
        ready(result)
    }

    fn insert_ticket(
        &self,
        tx: &mut Self::Tx,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = encode(ticket).and_then(|value| {
            tx.insert_record(TICKETS, &ticket_key(ticket.event_id, &ticket.name), value)
        });
        ready(result)
    }
}

impl OrganizerStore for InMemoryStore {
    fn insert_organizer(
        &self,
        tx: &mut Self::Tx,
        organizer: &Organizer,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = encode(organizer)
            .and_then(|value| tx.insert_record(ORGANIZERS, &organizer.id.to_string(), value));
        ready(result)
    }

    fn find_organizer(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Organizer>, StoreError>> + Send {
        let result = tx.find_record(ORGANIZERS, &id.to_string()).and_then(|found| {
            found
                .map(|value| {
                    serde_json::from_value(value).map_err(|e| {
                        StoreError::Database(format!("Failed to decode organizer: {e}"))
                    })
                })
                .transpose()
        });
        ready(result)
    }

    fn increment_event_count(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send {
        ready(tx.increment_field(ORGANIZERS, &id.to_string(), "event_count"))
    }
}
