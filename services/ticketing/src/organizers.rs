//! User service consumer.
//!
//! Listens for event lifecycle messages on the `events` exchange. A `created`
//! event adds one to its organizer's event count; the increment runs through
//! the inbox, so a redelivered message is counted once. `updated` and
//! `deleted` are acknowledged without a write. Other known actions are logged
//! and acknowledged.
//!
//! An `organizer_id` that is not a UUID can never be counted and goes to the
//! dead queue. An organizer the service does not know is skipped.

use outpost_core::broker::RetryTopology;
use outpost_core::catalog::OrganizerStore;
use outpost_core::envelope::{
    DomainEvent, EVENTS_EXCHANGE, EnvelopeError, EventDetails, MessageEnvelope, event_types,
};
use outpost_core::handler::{HandleOutcome, HandlerError, IncomingMessage, MessageHandler};
use outpost_core::inbox::{InboxOutcome, InboxStore};
use outpost_runtime::{InboxDeduplicator, InboxEffect};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Queue the user service consumes.
pub const USER_EVENTS_QUEUE: &str = "user_events_queue";

/// Routing keys bound to [`USER_EVENTS_QUEUE`].
pub const EVENT_LIFECYCLE_KEYS: [&str; 3] = [
    event_types::EVENT_CREATED,
    event_types::EVENT_UPDATED,
    event_types::EVENT_DELETED,
];

/// The user events queue with its retry and dead-letter companions.
#[must_use]
pub fn organizer_topology(retry_delay: Duration) -> RetryTopology {
    RetryTopology::for_queue(
        EVENTS_EXCHANGE,
        USER_EVENTS_QUEUE,
        &EVENT_LIFECYCLE_KEYS,
        retry_delay,
    )
}

/// Result of [`CountOrganizerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOutcome {
    /// The organizer now has this many events
    Counted(i64),
    /// No organizer has the id
    UnknownOrganizer,
}

/// Adds one to an organizer's event count.
#[derive(Debug, Clone, Copy)]
pub struct CountOrganizerEvent {
    organizer_id: Uuid,
}

impl CountOrganizerEvent {
    /// Count one event for `organizer_id`.
    #[must_use]
    pub const fn new(organizer_id: Uuid) -> Self {
        Self { organizer_id }
    }
}

impl<S: OrganizerStore> InboxEffect<S> for CountOrganizerEvent {
    type Output = CountOutcome;

    async fn apply(self, store: &S, tx: &mut S::Tx) -> Result<CountOutcome, HandlerError> {
        Ok(store
            .increment_event_count(tx, self.organizer_id)
            .await?
            .map_or(CountOutcome::UnknownOrganizer, CountOutcome::Counted))
    }
}

/// [`MessageHandler`] for event lifecycle messages.
pub struct EventLifecycleHandler<S> {
    inbox: InboxDeduplicator<S>,
}

impl<S: OrganizerStore + InboxStore> EventLifecycleHandler<S> {
    /// Create a handler writing through `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            inbox: InboxDeduplicator::new(store),
        }
    }

    async fn dispatch(&self, message: &IncomingMessage) -> Result<HandleOutcome, HandlerError> {
        let envelope = MessageEnvelope::from_slice(&message.body).inspect_err(|e| {
            tracing::error!(
                message_id = %message.message_id,
                error = %e,
                "Unparsable event message"
            );
        })?;

        tracing::debug!(
            message_id = %message.message_id,
            event_id = %envelope.event_id,
            action = envelope.event.action(),
            routing_key = %message.routing_key,
            "Processing event message"
        );

        match &envelope.event {
            DomainEvent::EventCreated(details) => {
                self.created(message, &envelope.event_id, details).await
            },
            DomainEvent::EventUpdated(_) | DomainEvent::EventDeleted => {
                tracing::info!(
                    message_id = %message.message_id,
                    event_id = %envelope.event_id,
                    action = envelope.event.action(),
                    "Event change acknowledged"
                );
                Ok(HandleOutcome::Applied)
            },
            other => {
                tracing::warn!(
                    message_id = %message.message_id,
                    event_id = %envelope.event_id,
                    action = other.action(),
                    "Unknown event action"
                );
                Ok(HandleOutcome::Applied)
            },
        }
    }

    async fn created(
        &self,
        message: &IncomingMessage,
        event_id: &str,
        details: &EventDetails,
    ) -> Result<HandleOutcome, HandlerError> {
        let organizer_id = parse_organizer_id(&details.organizer_id).inspect_err(|e| {
            tracing::error!(
                message_id = %message.message_id,
                event_id,
                organizer_id = %details.organizer_id,
                error = %e,
                "Invalid organizer id"
            );
        })?;

        let effect = CountOrganizerEvent::new(organizer_id);
        match self.inbox.process(&message.message_id, effect).await? {
            InboxOutcome::Applied(CountOutcome::Counted(event_count)) => {
                tracing::info!(
                    message_id = %message.message_id,
                    event_id,
                    %organizer_id,
                    event_count,
                    "Organizer event count incremented"
                );
                Ok(HandleOutcome::Applied)
            },
            InboxOutcome::Applied(CountOutcome::UnknownOrganizer) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    event_id,
                    %organizer_id,
                    "Organizer not found, skipping event"
                );
                Ok(HandleOutcome::Applied)
            },
            InboxOutcome::Duplicate => Ok(HandleOutcome::Duplicate),
        }
    }
}

fn parse_organizer_id(raw: &str) -> Result<Uuid, EnvelopeError> {
    if raw.is_empty() {
        return Err(EnvelopeError::MissingField("organizer_id"));
    }
    Uuid::parse_str(raw).map_err(|e| EnvelopeError::InvalidField {
        field: "organizer_id",
        reason: e.to_string(),
    })
}

impl<S: OrganizerStore + InboxStore + 'static> MessageHandler for EventLifecycleHandler<S> {
    fn handle<'a>(
        &'a self,
        message: &'a IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<HandleOutcome, HandlerError>> + Send + 'a>> {
        Box::pin(self.dispatch(message))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use outpost_core::catalog::Organizer;
    use outpost_core::clock::Clock;
    use outpost_core::store::{StoreTransaction, TransactionalStore};
    use outpost_testing::{InMemoryStore, test_clock};
    use serde_json::{Value, json};

    const ORGANIZER: &str = "7d444840-9dc0-11d1-b245-5ffdce74fad2";

    async fn handler() -> (Arc<InMemoryStore>, EventLifecycleHandler<InMemoryStore>) {
        let clock = Arc::new(test_clock());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let mut tx = store.begin().await.unwrap();
        let organizer = Organizer::new(ORGANIZER.parse().unwrap(), clock.now());
        store.insert_organizer(&mut tx, &organizer).await.unwrap();
        tx.commit().await.unwrap();
        (store.clone(), EventLifecycleHandler::new(store))
    }

    async fn event_count(store: &InMemoryStore) -> i64 {
        let mut tx = store.begin().await.unwrap();
        let organizer = store.find_organizer(&mut tx, ORGANIZER.parse().unwrap()).await.unwrap();
        organizer.unwrap().event_count
    }

    fn message(message_id: &str, routing_key: &str, body: &Value) -> IncomingMessage {
        IncomingMessage {
            message_id: message_id.to_string(),
            exchange: EVENTS_EXCHANGE.to_string(),
            routing_key: routing_key.to_string(),
            body: serde_json::to_vec(body).unwrap(),
            redelivered: false,
        }
    }

    fn created(organizer_id: &str) -> Value {
        json!({
            "event_id": "e-1",
            "action": "created",
            "timestamp": "2025-01-01T00:00:00Z",
            "organizer_id": organizer_id,
            "event_title": "Launch",
        })
    }

    #[tokio::test]
    async fn created_events_are_counted_once_per_message() {
        let (store, handler) = handler().await;
        let delivery = message("m-1", "event.created", &created(ORGANIZER));

        let first = handler.handle(&delivery).await.unwrap();
        let redelivered = handler
            .handle(&IncomingMessage {
                redelivered: true,
                ..delivery.clone()
            })
            .await
            .unwrap();
        let second_event = handler
            .handle(&message("m-2", "event.created", &created(ORGANIZER)))
            .await
            .unwrap();

        assert_eq!(first, HandleOutcome::Applied);
        assert_eq!(redelivered, HandleOutcome::Duplicate);
        assert_eq!(second_event, HandleOutcome::Applied);
        assert_eq!(event_count(&store).await, 2);
        assert_eq!(store.consumed_messages().len(), 2);
    }

    #[tokio::test]
    async fn malformed_organizer_ids_are_permanent() {
        let (store, handler) = handler().await;

        for (n, organizer_id) in ["not-a-uuid", ""].into_iter().enumerate() {
            let delivery = message(&format!("m-{n}"), "event.created", &created(organizer_id));
            let err = handler.handle(&delivery).await.unwrap_err();
            assert!(err.is_permanent(), "{err:?}");
        }

        assert_eq!(event_count(&store).await, 0);
        assert!(store.consumed_messages().is_empty());
    }

    #[tokio::test]
    async fn unknown_organizers_are_skipped_and_recorded() {
        let (store, handler) = handler().await;
        let stranger = Uuid::new_v4().to_string();

        let outcome = handler
            .handle(&message("m-1", "event.created", &created(&stranger)))
            .await
            .unwrap();

        assert_eq!(outcome, HandleOutcome::Applied);
        assert_eq!(event_count(&store).await, 0);
        assert_eq!(store.consumed_messages().len(), 1);
    }

    #[tokio::test]
    async fn updates_and_deletions_are_acknowledged_without_writes() {
        let (store, handler) = handler().await;
        let updated = json!({
            "event_id": "e-1",
            "action": "updated",
            "timestamp": "2025-01-01T00:00:00Z",
            "updates": {"title": "Renamed"},
        });
        let deleted = json!({
            "event_id": "e-1",
            "action": "deleted",
            "timestamp": "2025-01-01T00:00:00Z",
        });
        let pending = json!({
            "event_id": "e-1",
            "action": "created.pending",
            "timestamp": "2025-01-01T00:00:00Z",
            "organizer_id": ORGANIZER,
        });

        for (n, (key, body)) in [
            ("event.updated", updated),
            ("event.deleted", deleted),
            ("event.created.pending", pending),
        ]
        .into_iter()
        .enumerate()
        {
            let outcome = handler.handle(&message(&format!("m-{n}"), key, &body)).await.unwrap();
            assert_eq!(outcome, HandleOutcome::Applied);
        }

        assert_eq!(event_count(&store).await, 0);
        assert!(store.consumed_messages().is_empty());
    }

    #[tokio::test]
    async fn store_outage_is_transient_and_retry_counts() {
        let (store, handler) = handler().await;
        let delivery = message("m-1", "event.created", &created(ORGANIZER));
        store.fail_next_commits(1);

        let err = handler.handle(&delivery).await.unwrap_err();

        assert!(matches!(err, HandlerError::Transient(_)));
        assert_eq!(event_count(&store).await, 0);
        assert_eq!(handler.handle(&delivery).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(event_count(&store).await, 1);
    }

    #[test]
    fn topology_binds_the_lifecycle_keys() {
        let topology = organizer_topology(Duration::from_secs(5));
        assert_eq!(topology.exchange, "events");
        assert_eq!(topology.queue, "user_events_queue");
        assert_eq!(
            topology.routing_keys,
            ["event.created", "event.updated", "event.deleted"]
        );
        assert_eq!(topology.retry_queue, "user_events_queue.retry");
        assert_eq!(topology.dead_queue, "user_events_queue.dead");
    }
}
