//! # Ticketing services
//!
//! The services on either side of the Outpost pipeline:
//!
//! - **event service**: [`EventService`] writes events together with their
//!   outbox rows; the `event-service` binary runs the outbox poller that
//!   publishes them.
//! - **ticket service**: [`TicketCreateHandler`] turns
//!   `ticket.created.pending` messages into tickets through the inbox; the
//!   `ticket-service` binary runs the consumer that feeds it.
//! - **user service**: [`EventLifecycleHandler`] counts the events created
//!   for each organizer; the `user-service` binary runs its consumer.
//!
//! All binaries are configured from the environment, see [`Config`].

pub mod config;
pub mod events;
pub mod lifecycle;
pub mod organizers;
pub mod tickets;

pub use config::Config;
pub use events::{EventService, NewEvent, ServiceError, publisher_topology};
pub use lifecycle::{await_shutdown, shutdown_signal};
pub use organizers::{CountOrganizerEvent, CountOutcome, EventLifecycleHandler, organizer_topology};
pub use tickets::{CreateTicket, TicketCreateHandler, TicketOutcome, ticket_topology};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
