//! End-to-end delivery from the event service to the ticket and user
//! services, on in-memory infrastructure.

#![allow(clippy::unwrap_used)]

use chrono::Duration as ChronoDuration;
use outpost_core::broker::MessageBroker;
use outpost_core::catalog::{Organizer, OrganizerStore, Ticket};
use outpost_core::clock::Clock;
use outpost_core::envelope::{DomainEvent, MessageEnvelope, TicketDraft};
use outpost_core::outbox::OutboxStore;
use outpost_core::store::{StoreTransaction, TransactionalStore};
use outpost_runtime::{
    ConsumerConfig, MessageConsumer, MessagePublisher, OutboxPoller, PollerConfig, PublisherConfig,
    ServiceHandle, TickReport,
};
use outpost_testing::store::TICKETS;
use outpost_testing::{FixedClock, InMemoryBroker, InMemoryStore, SettlementKind, test_clock};
use std::sync::Arc;
use std::time::Duration;
use ticketing::organizers::USER_EVENTS_QUEUE;
use ticketing::tickets::TICKET_QUEUE;
use ticketing::{
    EventLifecycleHandler, EventService, NewEvent, TicketCreateHandler, organizer_topology,
    publisher_topology, ticket_topology,
};

const WAIT: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(5);

struct Harness {
    clock: Arc<FixedClock>,
    events_db: Arc<InMemoryStore>,
    tickets_db: Arc<InMemoryStore>,
    users_db: Arc<InMemoryStore>,
    broker: Arc<InMemoryBroker>,
    events: EventService<InMemoryStore>,
    poller: OutboxPoller<InMemoryStore>,
    publisher: MessagePublisher,
}

async fn harness() -> Harness {
    outpost_testing::init_test_tracing();
    let clock = Arc::new(test_clock());
    let events_db = Arc::new(InMemoryStore::new(clock.clone()));
    let tickets_db = Arc::new(InMemoryStore::new(clock.clone()));
    let users_db = Arc::new(InMemoryStore::new(clock.clone()));
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_topology(&publisher_topology()).await.unwrap();

    let publisher = MessagePublisher::new(broker.clone(), PublisherConfig::default());
    let poller = OutboxPoller::new(events_db.clone(), publisher.clone(), clock.clone())
        .with_config(PollerConfig::default().with_publish_attempts(3));

    Harness {
        events: EventService::new(events_db.clone(), clock.clone()),
        clock,
        events_db,
        tickets_db,
        users_db,
        broker,
        poller,
        publisher,
    }
}

impl Harness {
    async fn start_ticket_service(&self) -> ServiceHandle {
        let handler = TicketCreateHandler::new(self.tickets_db.clone(), self.clock.clone());
        let consumer = MessageConsumer::new(
            self.broker.clone(),
            Arc::new(handler),
            ticket_topology(RETRY_DELAY),
        )
        .with_config(ConsumerConfig::default().with_consumer_tag("ticket-service-consumer"));
        consumer.declare_topology().await.unwrap();
        consumer.spawn()
    }

    async fn start_user_service(&self) -> ServiceHandle {
        let consumer = MessageConsumer::new(
            self.broker.clone(),
            Arc::new(EventLifecycleHandler::new(self.users_db.clone())),
            organizer_topology(RETRY_DELAY),
        )
        .with_config(ConsumerConfig::default().with_consumer_tag("user-service-consumer"));
        consumer.declare_topology().await.unwrap();
        consumer.spawn()
    }

    async fn register_organizer(&self) -> Organizer {
        let organizer = Organizer::new(uuid::Uuid::new_v4(), self.clock.now());
        let mut tx = self.users_db.begin().await.unwrap();
        self.users_db.insert_organizer(&mut tx, &organizer).await.unwrap();
        tx.commit().await.unwrap();
        organizer
    }

    async fn event_count(&self, organizer: &Organizer) -> i64 {
        let mut tx = self.users_db.begin().await.unwrap();
        let stored = self.users_db.find_organizer(&mut tx, organizer.id).await.unwrap();
        stored.unwrap().event_count
    }

    fn new_event(&self) -> NewEvent {
        NewEvent {
            organizer_id: "org-1".to_string(),
            title: "Summer Festival".to_string(),
            description: String::new(),
            start_date: self.clock.now() + ChronoDuration::days(30),
            end_date: self.clock.now() + ChronoDuration::days(31),
            ticket_types: Vec::new(),
        }
    }

    fn tickets(&self) -> Vec<Ticket> {
        self.tickets_db
            .records(TICKETS)
            .into_iter()
            .map(|value| serde_json::from_value(value).unwrap())
            .collect()
    }
}

fn draft(name: &str) -> TicketDraft {
    TicketDraft {
        name: name.to_string(),
        description: "Standing".to_string(),
        price: "45".to_string(),
        total_quantity: 500,
        available: 500,
        ..TicketDraft::default()
    }
}

fn ticket_envelope(h: &Harness, event_id: &str, message_id: &str) -> MessageEnvelope {
    MessageEnvelope::new(
        event_id,
        DomainEvent::TicketCreatePending(draft("General")),
        h.clock.now(),
    )
    .with_message_id(message_id)
}

#[tokio::test(start_paused = true)]
async fn publish_succeeds_on_the_third_attempt() {
    let h = harness().await;
    let event = h.events.create_event(h.new_event()).await.unwrap();
    let row = h.events_db.outbox_events()[0].clone();
    assert_eq!(row.event_type, "event.created");

    h.broker.fail_next_publishes(2);
    let report = h.poller.tick().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(report.failed, 0);
    let stored = h.events_db.find_outbox_event(row.id).await.unwrap().unwrap();
    assert!(stored.published);
    assert!(stored.published_at.is_some());

    let published = h.broker.published_to("events");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "event.created");
    assert_eq!(published[0].message_id.as_deref(), Some(row.id.to_string().as_str()));
    let envelope = MessageEnvelope::from_slice(&published[0].payload).unwrap();
    assert_eq!(envelope.event_id, event.id.to_string());
}

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_create_one_ticket() {
    let h = harness().await;
    let service = h.start_ticket_service().await;
    let event_id = uuid::Uuid::new_v4().to_string();

    let envelope = ticket_envelope(&h, &event_id, "m-1");
    h.publisher.publish_envelope(&envelope, 1).await.unwrap();
    h.publisher.publish_envelope(&envelope, 1).await.unwrap();
    assert!(h.broker.wait_for_settlements(2, WAIT).await);

    let settlements = h.broker.settlements();
    assert!(settlements.iter().all(|s| s.kind == SettlementKind::Acked));
    assert!(settlements.iter().all(|s| s.message_id.as_deref() == Some("m-1")));
    assert_eq!(h.tickets().len(), 1);
    assert_eq!(h.tickets_db.consumed_messages().len(), 1);
    assert!(service.stop(WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn empty_tick_does_nothing() {
    let h = harness().await;

    let report = h.poller.tick().await.unwrap();

    assert_eq!(report, TickReport::default());
    assert!(report.is_idle());
    assert!(h.broker.published().is_empty());
    assert!(h.events_db.outbox_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unparsable_body_is_rejected_without_a_ledger_row() {
    let h = harness().await;
    let service = h.start_ticket_service().await;

    let garbage = outpost_core::broker::OutgoingMessage::json(
        "tickets",
        "ticket.created.pending",
        b"{definitely not json".to_vec(),
    )
    .with_message_id("m-bad");
    h.publisher.publish_raw(&garbage).await.unwrap();
    assert!(h.broker.wait_for_settlements(1, WAIT).await);

    let settlement = &h.broker.settlements()[0];
    assert_eq!(settlement.kind, SettlementKind::Rejected);
    assert_eq!(settlement.queue, TICKET_QUEUE);
    assert!(h.tickets_db.consumed_messages().is_empty());
    assert!(h.tickets().is_empty());
    assert_eq!(h.broker.queue_depth("ticket_events_queue.dead"), 1);
    assert_eq!(h.broker.queue_depth("ticket_events_queue.retry"), 0);
    assert!(service.stop(WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn ticket_announcement_flows_from_outbox_to_ticket() {
    let h = harness().await;
    let service = h.start_ticket_service().await;
    let event = h.events.create_event(h.new_event()).await.unwrap();
    let announcement = h
        .events
        .create_ticket_for_event(event.id, draft("General"))
        .await
        .unwrap();

    let report = h.poller.tick().await.unwrap();
    assert_eq!(report.published, 2);
    assert!(h.broker.wait_for_settlements(1, WAIT).await);

    let tickets = h.tickets();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].event_id, event.id);
    assert_eq!(tickets[0].name, "General");
    assert_eq!(tickets[0].price, "45.00");
    assert_eq!(
        h.tickets_db.consumed_messages()[0].message_id,
        announcement.id.to_string()
    );

    // A poller that crashed before marking the row publishes it again.
    let row = h.events_db.find_outbox_event(announcement.id).await.unwrap().unwrap();
    let replay = MessageEnvelope::from_outbox(&row, h.clock.now()).unwrap();
    h.publisher.publish_envelope(&replay, 1).await.unwrap();
    assert!(h.broker.wait_for_settlements(2, WAIT).await);
    assert_eq!(h.tickets().len(), 1);
    assert!(service.stop(WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn store_outage_is_retried_after_the_delay() {
    let h = harness().await;
    let service = h.start_ticket_service().await;
    let event_id = uuid::Uuid::new_v4().to_string();
    h.tickets_db.set_unavailable(true);

    h.publisher
        .publish_envelope(&ticket_envelope(&h, &event_id, "m-7"), 1)
        .await
        .unwrap();
    assert!(h.broker.wait_for_settlements(1, WAIT).await);
    assert_eq!(h.broker.settlements()[0].kind, SettlementKind::Rejected);
    assert_eq!(h.broker.queue_depth("ticket_events_queue.retry"), 1);

    h.tickets_db.set_unavailable(false);
    assert!(h.broker.wait_for_settlements(2, WAIT).await);

    assert_eq!(h.broker.settlements()[1].kind, SettlementKind::Acked);
    assert_eq!(h.broker.settlements()[1].message_id.as_deref(), Some("m-7"));
    assert_eq!(h.tickets().len(), 1);
    assert!(service.stop(WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn created_events_are_counted_once_for_their_organizer() {
    let h = harness().await;
    let service = h.start_user_service().await;
    let organizer = h.register_organizer().await;
    let event = h
        .events
        .create_event(NewEvent {
            organizer_id: organizer.id.to_string(),
            ..h.new_event()
        })
        .await
        .unwrap();

    assert_eq!(h.poller.tick().await.unwrap().published, 1);
    assert!(h.broker.wait_for_settlements(1, WAIT).await);
    assert_eq!(h.event_count(&organizer).await, 1);

    // The same outbox row published a second time is absorbed by the inbox.
    let row = h.events_db.outbox_events()[0].clone();
    assert_eq!(row.aggregate_id, event.id.to_string());
    let replay = MessageEnvelope::from_outbox(&row, h.clock.now()).unwrap();
    h.publisher.publish_envelope(&replay, 1).await.unwrap();
    assert!(h.broker.wait_for_settlements(2, WAIT).await);

    let settlements = h.broker.settlements();
    assert!(settlements.iter().all(|s| s.kind == SettlementKind::Acked));
    assert!(settlements.iter().all(|s| s.queue == USER_EVENTS_QUEUE));
    assert_eq!(h.event_count(&organizer).await, 1);
    assert_eq!(h.users_db.consumed_messages().len(), 1);
    assert!(service.stop(WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn malformed_organizer_id_is_dead_lettered() {
    let h = harness().await;
    let service = h.start_user_service().await;
    h.events.create_event(h.new_event()).await.unwrap();

    h.poller.tick().await.unwrap();
    assert!(h.broker.wait_for_settlements(1, WAIT).await);

    assert_eq!(h.broker.settlements()[0].kind, SettlementKind::Rejected);
    assert_eq!(h.broker.queue_depth("user_events_queue.dead"), 1);
    assert_eq!(h.broker.queue_depth("user_events_queue.retry"), 0);
    assert!(h.users_db.consumed_messages().is_empty());
    assert!(service.stop(WAIT).await);
}
