//! Event service write path.
//!
//! Every write here is paired with an outbox row in the same transaction, so
//! an event exists if and only if its announcement will eventually be
//! published.

use chrono::{DateTime, Utc};
use outpost_core::broker::{ExchangeSpec, Topology};
use outpost_core::catalog::{EVENT_STATUS_PUBLISHED, EventRecord, EventStore, Ticket};
use outpost_core::clock::Clock;
use outpost_core::envelope::{
    DomainEvent, EVENTS_EXCHANGE, EnvelopeError, EventDetails, TICKETS_EXCHANGE, TicketDraft,
    TicketType,
};
use outpost_core::outbox::{NewOutboxEvent, OutboxEvent, OutboxStore};
use outpost_core::store::{StoreError, StoreTransaction};
use outpost_runtime::metrics::OutboxMetrics;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Exchanges the event service publishes to, declared before the poller starts.
#[must_use]
pub fn publisher_topology() -> Topology {
    Topology::new()
        .exchange(ExchangeSpec::topic(EVENTS_EXCHANGE))
        .exchange(ExchangeSpec::topic(TICKETS_EXCHANGE))
}

/// Why a write was refused or failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request is invalid; nothing was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The referenced event does not exist
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    /// The payload could not be encoded for the outbox
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The store failed; the transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request to create an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Organizer who owns the event
    pub organizer_id: String,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// When the event starts
    pub start_date: DateTime<Utc>,
    /// When the event ends
    pub end_date: DateTime<Utc>,
    /// Ticket types announced with the event
    pub ticket_types: Vec<TicketType>,
}

impl NewEvent {
    fn validate(&self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if self.organizer_id.trim().is_empty() {
            return Err(ServiceError::Validation("organizer_id is required".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(ServiceError::Validation("title is required".to_string()));
        }
        if self.start_date < now {
            return Err(ServiceError::Validation("start date is in the past".to_string()));
        }
        if self.end_date < now {
            return Err(ServiceError::Validation("end date is in the past".to_string()));
        }
        if self.start_date >= self.end_date {
            return Err(ServiceError::Validation(
                "end date must be after the start date".to_string(),
            ));
        }
        Ok(())
    }
}

/// Creates events and ticket announcements through the outbox.
pub struct EventService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for EventService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: EventStore + OutboxStore> EventService<S> {
    /// Create a service over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Insert an event and its `event.created` outbox row in one transaction.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Validation`] for bad input, [`ServiceError::Store`] if
    /// either insert or the commit fails. In every error case neither row
    /// exists afterwards.
    pub async fn create_event(&self, new_event: NewEvent) -> Result<EventRecord, ServiceError> {
        let now = self.clock.now();
        new_event.validate(now)?;

        let record = EventRecord {
            id: Uuid::new_v4(),
            organizer_id: new_event.organizer_id,
            title: new_event.title,
            description: new_event.description,
            start_date: new_event.start_date,
            end_date: new_event.end_date,
            status: EVENT_STATUS_PUBLISHED.to_string(),
            created_at: now,
        };
        let announcement = DomainEvent::EventCreated(EventDetails {
            organizer_id: record.organizer_id.clone(),
            event_title: record.title.clone(),
            ticket_types: new_event.ticket_types,
        });
        let row = NewOutboxEvent::for_event(record.id.to_string(), &announcement)?;

        let mut tx = self.store.begin().await?;
        self.store.insert_event(&mut tx, &record).await?;
        let outbox = self.store.create_outbox_event(&mut tx, row).await?;
        tx.commit().await?;

        OutboxMetrics::record_written();
        tracing::info!(
            event_id = %record.id,
            outbox_id = %outbox.id,
            "Event created and outbox row stored"
        );
        Ok(record)
    }

    /// Announce a ticket type for an existing event.
    ///
    /// Only the `ticket.create` outbox row is written; the ticket service
    /// creates the ticket when the announcement reaches it. The draft is
    /// checked with the same rules the ticket service applies, so a draft
    /// accepted here is never dead-lettered for its content.
    ///
    /// # Errors
    ///
    /// [`ServiceError::EventNotFound`] if the event does not exist,
    /// [`ServiceError::Envelope`] for an invalid draft, [`ServiceError::Store`]
    /// on storage failure.
    pub async fn create_ticket_for_event(
        &self,
        event_id: Uuid,
        draft: TicketDraft,
    ) -> Result<OutboxEvent, ServiceError> {
        Ticket::from_draft(&event_id.to_string(), &draft, Uuid::nil(), self.clock.now())?;
        let row = NewOutboxEvent::for_event(
            event_id.to_string(),
            &DomainEvent::TicketCreatePending(draft),
        )?;

        let mut tx = self.store.begin().await?;
        if self.store.find_event(&mut tx, event_id).await?.is_none() {
            if let Err(e) = tx.rollback().await {
                tracing::debug!(event_id = %event_id, error = %e, "Rollback failed");
            }
            return Err(ServiceError::EventNotFound(event_id));
        }
        let outbox = self.store.create_outbox_event(&mut tx, row).await?;
        tx.commit().await?;

        OutboxMetrics::record_written();
        tracing::info!(
            event_id = %event_id,
            outbox_id = %outbox.id,
            "Ticket create outbox row stored"
        );
        Ok(outbox)
    }
}
