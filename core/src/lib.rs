//! # Outpost Core
//!
//! Core traits and types for reliable event delivery between services.
//!
//! A business write and the notification describing it must never disagree,
//! even across broker outages, crashes and redelivery. Outpost gets there with
//! two ledgers that share transactions with the writes they describe:
//!
//! ```text
//! business write ─┬─► outbox row        (same transaction)
//!                 └─► commit
//!                        │
//!        poller tick ◄───┘ ─► publisher ─► broker ─► consumer
//!                                                       │
//!                      inbox row + derived write ◄──────┘ (same transaction)
//!                                 │
//!                              commit ─► ack
//! ```
//!
//! ## Modules
//!
//! - [`store`]: transactions and the store error taxonomy
//! - [`outbox`]: the producer-side ledger
//! - [`inbox`]: the consumer-side dedup ledger
//! - [`envelope`]: the closed set of domain events and their wire format
//! - [`broker`]: the transport seam, topology declarations, topic matching
//! - [`handler`]: consumer-side handlers and failure classification
//! - [`catalog`]: event, ticket and organizer records and their stores
//! - [`clock`]: injectable time
//!
//! ## Guarantees
//!
//! - At-least-once delivery; effects are applied once thanks to the inbox.
//! - FIFO within one outbox scan; no ordering across unrelated aggregates.
//! - No exactly-once delivery and no distributed transactions.

pub mod broker;
pub mod catalog;
pub mod clock;
pub mod envelope;
pub mod handler;
pub mod inbox;
pub mod outbox;
pub mod store;

// Re-export commonly used types
pub use broker::{
    BrokerError, Confirmation, Delivery, DeliveryStream, MessageBroker, OutgoingMessage,
};
pub use catalog::{EventRecord, EventStore, Organizer, OrganizerStore, Ticket, TicketStore};
pub use clock::{Clock, SystemClock};
pub use envelope::{DomainEvent, EnvelopeError, MessageEnvelope};
pub use handler::{HandleOutcome, HandlerError, IncomingMessage, MessageHandler};
pub use inbox::{ConsumedMessage, InboxOutcome, InboxStore};
pub use outbox::{NewOutboxEvent, OutboxEvent, OutboxStore};
pub use store::{StoreError, StoreTransaction, TransactionalStore};
