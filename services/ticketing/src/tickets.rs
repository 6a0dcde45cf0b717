//! Ticket service consumer.
//!
//! Listens for `ticket.created.pending` on the `tickets` exchange and creates
//! the announced ticket. Each message is applied through the inbox, and the
//! `(event_id, name)` pair is checked as well, so neither a redelivery nor a
//! second announcement of the same ticket creates a duplicate.

use outpost_core::broker::RetryTopology;
use outpost_core::catalog::{Ticket, TicketStore};
use outpost_core::clock::Clock;
use outpost_core::envelope::{DomainEvent, MessageEnvelope, TICKETS_EXCHANGE};
use outpost_core::handler::{HandleOutcome, HandlerError, IncomingMessage, MessageHandler};
use outpost_core::inbox::{InboxOutcome, InboxStore};
use outpost_runtime::{InboxDeduplicator, InboxEffect};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Queue the ticket service consumes.
pub const TICKET_QUEUE: &str = "ticket_events_queue";

/// Routing key of ticket creation requests.
pub const TICKET_CREATED_PENDING: &str = "ticket.created.pending";

/// The ticket queue with its retry and dead-letter companions.
#[must_use]
pub fn ticket_topology(retry_delay: Duration) -> RetryTopology {
    RetryTopology::for_queue(TICKETS_EXCHANGE, TICKET_QUEUE, &[TICKET_CREATED_PENDING], retry_delay)
}

/// Result of [`CreateTicket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketOutcome {
    /// The ticket was inserted
    Created(Ticket),
    /// A ticket with the same event and name already existed
    AlreadyExists,
}

/// Inserts a validated ticket unless its `(event_id, name)` is taken.
#[derive(Debug, Clone)]
pub struct CreateTicket {
    ticket: Ticket,
}

impl CreateTicket {
    /// Wrap a validated ticket.
    #[must_use]
    pub const fn new(ticket: Ticket) -> Self {
        Self { ticket }
    }
}

impl<S: TicketStore> InboxEffect<S> for CreateTicket {
    type Output = TicketOutcome;

    async fn apply(self, store: &S, tx: &mut S::Tx) -> Result<TicketOutcome, HandlerError> {
        let ticket = self.ticket;
        if store.ticket_exists(tx, ticket.event_id, &ticket.name).await? {
            tracing::info!(
                event_id = %ticket.event_id,
                name = %ticket.name,
                "Ticket already exists, skipping"
            );
            return Ok(TicketOutcome::AlreadyExists);
        }
        store.insert_ticket(tx, &ticket).await?;
        Ok(TicketOutcome::Created(ticket))
    }
}

/// [`MessageHandler`] for `ticket.created.pending`.
pub struct TicketCreateHandler<S> {
    inbox: InboxDeduplicator<S>,
    clock: Arc<dyn Clock>,
}

impl<S: TicketStore + InboxStore> TicketCreateHandler<S> {
    /// Create a handler writing through `store`.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inbox: InboxDeduplicator::new(store),
            clock,
        }
    }

    async fn create(&self, message: &IncomingMessage) -> Result<HandleOutcome, HandlerError> {
        let envelope = MessageEnvelope::from_slice(&message.body).inspect_err(|e| {
            tracing::error!(
                message_id = %message.message_id,
                error = %e,
                "Unparsable ticket message"
            );
        })?;

        let DomainEvent::TicketCreatePending(draft) = &envelope.event else {
            let action = envelope.event.action();
            tracing::error!(
                message_id = %message.message_id,
                action,
                "Unexpected action on ticket queue"
            );
            return Err(HandlerError::Permanent(format!("unexpected action '{action}'")));
        };

        let ticket = Ticket::from_draft(&envelope.event_id, draft, Uuid::new_v4(), self.clock.now())
            .inspect_err(|e| {
                tracing::error!(
                    message_id = %message.message_id,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Invalid ticket payload"
                );
            })?;

        match self.inbox.process(&message.message_id, CreateTicket::new(ticket)).await? {
            InboxOutcome::Applied(TicketOutcome::Created(ticket)) => {
                tracing::info!(
                    message_id = %message.message_id,
                    ticket_id = %ticket.id,
                    event_id = %ticket.event_id,
                    name = %ticket.name,
                    "Ticket created"
                );
                Ok(HandleOutcome::Applied)
            },
            InboxOutcome::Applied(TicketOutcome::AlreadyExists) | InboxOutcome::Duplicate => {
                Ok(HandleOutcome::Duplicate)
            },
        }
    }
}

impl<S: TicketStore + InboxStore + 'static> MessageHandler for TicketCreateHandler<S> {
    fn handle<'a>(
        &'a self,
        message: &'a IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<HandleOutcome, HandlerError>> + Send + 'a>> {
        Box::pin(self.create(message))
    }
}
