//! Records written by the services on either side of the pipeline.
//!
//! The event service owns [`EventRecord`]s and announces them through the
//! outbox. The ticket service owns [`Ticket`]s, which it only ever creates
//! from a `ticket.created.pending` message, so [`Ticket::from_draft`] is where
//! an untrusted payload becomes a record. The user service keeps one
//! [`Organizer`] per account and counts the events announced for it.

use crate::envelope::{EnvelopeError, TicketDraft};
use crate::store::{StoreError, TransactionalStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// Status given to newly created events.
pub const EVENT_STATUS_PUBLISHED: &str = "PUBLISHED";

/// A stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event id; also the aggregate id of its outbox rows
    pub id: Uuid,
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
    /// Lifecycle status
    pub status: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A stored ticket type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub id: Uuid,
    /// Event the ticket belongs to
    pub event_id: Uuid,
    /// Ticket type name, unique per event
    pub name: String,
    /// Description
    pub description: String,
    /// Decimal price, normalised to two fractional digits
    pub price: String,
    /// Total number of tickets
    pub total_quantity: i64,
    /// Tickets currently available
    pub available: i64,
    /// Tickets reserved
    pub reserved: i64,
    /// Tickets sold
    pub sold: i64,
    /// Sale window start
    pub sale_start_date: Option<DateTime<Utc>>,
    /// Sale window end
    pub sale_end_date: Option<DateTime<Utc>>,
    /// Whether the ticket is on sale
    pub is_active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// An organizer account and the number of events announced for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    /// Account id; the `organizer_id` of its events
    pub id: Uuid,
    /// Events created for this organizer
    pub event_count: i64,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Organizer {
    /// A freshly registered organizer with no events.
    #[must_use]
    pub const fn new(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_count: 0,
            created_at,
        }
    }
}

impl Ticket {
    /// Validate a draft and turn it into a record.
    ///
    /// Counters the draft does not carry start at zero; the record is active.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::MissingField`] for an empty `event_id`, `name` or `price`
    /// - [`EnvelopeError::InvalidField`] for a non-UUID `event_id`, a price that
    ///   is not a decimal, `total_quantity <= 0`, negative counters, or sale
    ///   dates that are not RFC 3339
    pub fn from_draft(
        event_id: &str,
        draft: &TicketDraft,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        if event_id.is_empty() {
            return Err(EnvelopeError::MissingField("event_id"));
        }
        let event_id = Uuid::parse_str(event_id).map_err(|e| EnvelopeError::InvalidField {
            field: "event_id",
            reason: e.to_string(),
        })?;

        if draft.name.trim().is_empty() {
            return Err(EnvelopeError::MissingField("name"));
        }
        let price = parse_price(&draft.price)?;

        if draft.total_quantity <= 0 {
            return Err(EnvelopeError::InvalidField {
                field: "total_quantity",
                reason: format!("must be positive, got {}", draft.total_quantity),
            });
        }
        for (field, value) in [
            ("available", draft.available),
            ("reserved", draft.reserved),
            ("sold", draft.sold),
        ] {
            if value < 0 {
                return Err(EnvelopeError::InvalidField {
                    field,
                    reason: format!("must not be negative, got {value}"),
                });
            }
        }

        Ok(Self {
            id,
            event_id,
            name: draft.name.clone(),
            description: draft.description.clone(),
            price,
            total_quantity: draft.total_quantity,
            available: draft.available,
            reserved: draft.reserved,
            sold: draft.sold,
            sale_start_date: parse_sale_date("sale_start_date", draft.sale_start_date.as_deref())?,
            sale_end_date: parse_sale_date("sale_end_date", draft.sale_end_date.as_deref())?,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Check that `raw` is a decimal number and normalise it to two fractional digits.
///
/// Accepts an optional sign, an integer part and an optional fraction of at
/// most two digits (`"10"`, `"10.5"`, `"-0.25"`).
///
/// # Errors
///
/// [`EnvelopeError::MissingField`] if empty, [`EnvelopeError::InvalidField`]
/// otherwise.
pub fn parse_price(raw: &str) -> Result<String, EnvelopeError> {
    let invalid = |reason: &str| EnvelopeError::InvalidField {
        field: "price",
        reason: format!("{reason}: {raw:?}"),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvelopeError::MissingField("price"));
    }

    let (sign, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if fraction.len() > 2 {
        return Err(invalid("more than two fractional digits"));
    }

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    Ok(format!("{sign}{whole}.{fraction:0<2}"))
}

fn parse_sale_date(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|date| Some(date.with_timezone(&Utc)))
            .map_err(|e| EnvelopeError::InvalidField {
                field,
                reason: e.to_string(),
            }),
    }
}

/// Event records, written inside the caller's transaction.
pub trait EventStore: TransactionalStore {
    /// Insert a new event.
    ///
    /// # Errors
    ///
    /// [`StoreError::UniqueViolation`] if the id is taken, or the backend's
    /// failure.
    fn insert_event(
        &self,
        tx: &mut Self::Tx,
        event: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load an event by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn find_event(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send;
}

/// Ticket records, written inside the caller's transaction.
pub trait TicketStore: TransactionalStore {
    /// Whether a ticket named `name` already exists for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn ticket_exists(
        &self,
        tx: &mut Self::Tx,
        event_id: Uuid,
        name: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Insert a ticket.
    ///
    /// # Errors
    ///
    /// [`StoreError::UniqueViolation`] if `(event_id, name)` is taken, or the
    /// backend's failure.
    fn insert_ticket(
        &self,
        tx: &mut Self::Tx,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Organizer accounts, written inside the caller's transaction.
pub trait OrganizerStore: TransactionalStore {
    /// Register an organizer.
    ///
    /// # Errors
    ///
    /// [`StoreError::UniqueViolation`] if the id is taken, or the backend's
    /// failure.
    fn insert_organizer(
        &self,
        tx: &mut Self::Tx,
        organizer: &Organizer,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load an organizer by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn find_organizer(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Organizer>, StoreError>> + Send;

    /// Add one to the organizer's event count and return the new count.
    ///
    /// The increment is applied relative to the committed value, so two
    /// transactions incrementing the same organizer both count. Returns `None`
    /// if no organizer has this id.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn increment_event_count(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;
}
