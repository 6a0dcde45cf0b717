//! Wire envelope and the closed set of domain events it can carry.
//!
//! Every message on the broker is a JSON object:
//!
//! ```json
//! {
//!   "event_id": "6f1c…",            // aggregate id
//!   "action": "created",            // variant tag
//!   "organizer_id": "…",            // variant-specific fields
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "message_id": "0d3e…"           // dedup key, optional on the wire
//! }
//! ```
//!
//! Each outbox `event_type` maps to exactly one [`DomainEvent`] variant and one
//! broker destination:
//!
//! | `event_type`            | variant               | exchange  | routing key              | `action`                 |
//! |-------------------------|-----------------------|-----------|--------------------------|--------------------------|
//! | `event.created`         | `EventCreated`        | `events`  | `event.created`          | `created`                |
//! | `event.created.pending` | `EventCreatedPending` | `events`  | `event.created.pending`  | `created.pending`        |
//! | `event.updated`         | `EventUpdated`        | `events`  | `event.updated`          | `updated`                |
//! | `event.deleted`         | `EventDeleted`        | `events`  | `event.deleted`          | `deleted`                |
//! | `ticket.create`         | `TicketCreatePending` | `tickets` | `ticket.created.pending` | `ticket.created.pending` |
//!
//! Anything that fails to parse into this set is an [`EnvelopeError`], which
//! consumers treat as a permanent failure.

use crate::outbox::OutboxEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Exchange carrying event lifecycle messages.
pub const EVENTS_EXCHANGE: &str = "events";

/// Exchange carrying ticket lifecycle messages.
pub const TICKETS_EXCHANGE: &str = "tickets";

/// Outbox `event_type` tags.
pub mod event_types {
    /// An event was created
    pub const EVENT_CREATED: &str = "event.created";
    /// An event was created and awaits ticket provisioning
    pub const EVENT_CREATED_PENDING: &str = "event.created.pending";
    /// An event was updated
    pub const EVENT_UPDATED: &str = "event.updated";
    /// An event was deleted
    pub const EVENT_DELETED: &str = "event.deleted";
    /// A ticket type should be created for an event
    pub const TICKET_CREATE: &str = "ticket.create";
}

/// Errors raised while turning bytes into a [`DomainEvent`].
///
/// All variants are permanent: redelivering the same bytes fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The outbox `event_type` or wire `action` has no variant
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The bytes are not a JSON object of the expected shape
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A required field is absent or empty
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but unusable
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Broker address of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Exchange name
    pub exchange: &'static str,
    /// Routing key
    pub routing_key: &'static str,
}

/// A ticket type announced together with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketType {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Decimal price as a string, e.g. `"49.90"`
    #[serde(default)]
    pub price: String,
    /// Number of tickets of this type
    #[serde(default)]
    pub total_quantity: i64,
}

/// Payload of `created` and `created.pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Organizer owning the event
    #[serde(default)]
    pub organizer_id: String,
    /// Event title
    #[serde(default)]
    pub event_title: String,
    /// Ticket types offered
    #[serde(default)]
    pub ticket_types: Vec<TicketType>,
}

/// Payload of `updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUpdate {
    /// Changed fields and their new values
    #[serde(default)]
    pub updates: Map<String, Value>,
}

/// Payload of `ticket.created.pending`.
///
/// Fields are kept loose here; the consuming service validates them and
/// reports each problem as a precise [`EnvelopeError`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketDraft {
    /// Ticket type name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Decimal price as a string
    pub price: String,
    /// Total number of tickets
    pub total_quantity: i64,
    /// Tickets currently available
    pub available: i64,
    /// Tickets reserved
    pub reserved: i64,
    /// Tickets sold
    pub sold: i64,
    /// Sale window start (RFC 3339)
    pub sale_start_date: Option<String>,
    /// Sale window end (RFC 3339)
    pub sale_end_date: Option<String>,
}

/// The closed set of events that travel through the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum DomainEvent {
    /// An event was created
    #[serde(rename = "created")]
    EventCreated(EventDetails),
    /// An event was created and awaits ticket provisioning
    #[serde(rename = "created.pending")]
    EventCreatedPending(EventDetails),
    /// An event was updated
    #[serde(rename = "updated")]
    EventUpdated(EventUpdate),
    /// An event was deleted
    #[serde(rename = "deleted")]
    EventDeleted,
    /// A ticket type should be created
    #[serde(rename = "ticket.created.pending")]
    TicketCreatePending(TicketDraft),
}

const ACTIONS: [&str; 5] = [
    "created",
    "created.pending",
    "updated",
    "deleted",
    "ticket.created.pending",
];

impl DomainEvent {
    /// Outbox `event_type` tag of this variant.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::EventCreated(_) => event_types::EVENT_CREATED,
            Self::EventCreatedPending(_) => event_types::EVENT_CREATED_PENDING,
            Self::EventUpdated(_) => event_types::EVENT_UPDATED,
            Self::EventDeleted => event_types::EVENT_DELETED,
            Self::TicketCreatePending(_) => event_types::TICKET_CREATE,
        }
    }

    /// Wire `action` tag of this variant.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::EventCreated(_) => "created",
            Self::EventCreatedPending(_) => "created.pending",
            Self::EventUpdated(_) => "updated",
            Self::EventDeleted => "deleted",
            Self::TicketCreatePending(_) => "ticket.created.pending",
        }
    }

    /// Where this variant is published.
    #[must_use]
    pub const fn destination(&self) -> Destination {
        match self {
            Self::EventCreated(_) => Destination {
                exchange: EVENTS_EXCHANGE,
                routing_key: "event.created",
            },
            Self::EventCreatedPending(_) => Destination {
                exchange: EVENTS_EXCHANGE,
                routing_key: "event.created.pending",
            },
            Self::EventUpdated(_) => Destination {
                exchange: EVENTS_EXCHANGE,
                routing_key: "event.updated",
            },
            Self::EventDeleted => Destination {
                exchange: EVENTS_EXCHANGE,
                routing_key: "event.deleted",
            },
            Self::TicketCreatePending(_) => Destination {
                exchange: TICKETS_EXCHANGE,
                routing_key: "ticket.created.pending",
            },
        }
    }

    /// Rebuild a domain event from an outbox row's `event_type` and `event_data`.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::UnknownEventType`] if `event_type` has no variant
    /// - [`EnvelopeError::Malformed`] if `event_data` does not fit the variant
    pub fn from_outbox(event_type: &str, event_data: &str) -> Result<Self, EnvelopeError> {
        fn parse<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, EnvelopeError> {
            serde_json::from_str(data).map_err(|e| EnvelopeError::Malformed(e.to_string()))
        }

        match event_type {
            event_types::EVENT_CREATED => Ok(Self::EventCreated(parse(event_data)?)),
            event_types::EVENT_CREATED_PENDING => {
                Ok(Self::EventCreatedPending(parse(event_data)?))
            }
            event_types::EVENT_UPDATED => Ok(Self::EventUpdated(parse(event_data)?)),
            event_types::EVENT_DELETED => Ok(Self::EventDeleted),
            event_types::TICKET_CREATE => Ok(Self::TicketCreatePending(parse(event_data)?)),
            other => Err(EnvelopeError::UnknownEventType(other.to_string())),
        }
    }

    /// Serialize the variant payload for the outbox `event_data` column.
    ///
    /// The payload carries no `action` tag; the row's `event_type` plays that role.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if serialization fails.
    pub fn to_outbox_data(&self) -> Result<String, EnvelopeError> {
        let result = match self {
            Self::EventCreated(details) | Self::EventCreatedPending(details) => {
                serde_json::to_string(details)
            }
            Self::EventUpdated(update) => serde_json::to_string(update),
            Self::EventDeleted => Ok("{}".to_string()),
            Self::TicketCreatePending(draft) => serde_json::to_string(draft),
        };
        result.map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// The JSON message exchanged between services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Aggregate id the event describes
    pub event_id: String,
    /// Variant tag (`action`) and variant-specific fields
    #[serde(flatten)]
    pub event: DomainEvent,
    /// When the envelope was built
    pub timestamp: DateTime<Utc>,
    /// Dedup key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl MessageEnvelope {
    /// Create an envelope without a message id.
    #[must_use]
    pub fn new(event_id: impl Into<String>, event: DomainEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.into(),
            event,
            timestamp,
            message_id: None,
        }
    }

    /// Attach a dedup key.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Build the envelope for an outbox row.
    ///
    /// The row id becomes the message id, so every publish of the same row
    /// carries the same dedup key.
    ///
    /// # Errors
    ///
    /// See [`DomainEvent::from_outbox`].
    pub fn from_outbox(row: &OutboxEvent, timestamp: DateTime<Utc>) -> Result<Self, EnvelopeError> {
        let event = DomainEvent::from_outbox(&row.event_type, &row.event_data)?;
        Ok(Self::new(row.aggregate_id.clone(), event, timestamp)
            .with_message_id(row.id.to_string()))
    }

    /// Where this envelope is published.
    #[must_use]
    pub const fn destination(&self) -> Destination {
        self.event.destination()
    }

    /// Parse an envelope received from the broker.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Malformed`] if the bytes are not a JSON object of the right shape
    /// - [`EnvelopeError::MissingField`] if `event_id` or `action` is absent
    /// - [`EnvelopeError::UnknownEventType`] if `action` is not recognised
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(EnvelopeError::Malformed("expected a JSON object".to_string()));
        };

        match object.get("event_id") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField("event_id")),
            Some(Value::String(id)) if id.is_empty() => {
                return Err(EnvelopeError::MissingField("event_id"));
            },
            Some(Value::String(_)) => {},
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    field: "event_id",
                    reason: "expected a string".to_string(),
                });
            },
        }

        match object.get("action") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField("action")),
            Some(Value::String(action)) if !ACTIONS.contains(&action.as_str()) => {
                return Err(EnvelopeError::UnknownEventType(action.clone()));
            },
            Some(Value::String(_)) => {},
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    field: "action",
                    reason: "expected a string".to_string(),
                });
            },
        }

        if !object.contains_key("timestamp") {
            return Err(EnvelopeError::MissingField("timestamp"));
        }

        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}
