//! `events`, `tickets` and `organizers` tables.

use crate::{PgTransaction, PostgresStore, map_sqlx_error};
use outpost_core::catalog::{
    EventRecord, EventStore, Organizer, OrganizerStore, Ticket, TicketStore,
};
use outpost_core::store::StoreError;
use sqlx::Row;
use std::future::Future;
use uuid::Uuid;

impl EventStore for PostgresStore {
    fn insert_event(
        &self,
        tx: &mut PgTransaction,
        event: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            sqlx::query(
                "INSERT INTO events (id, organizer_id, title, description, start_date, end_date, status, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(event.id)
            .bind(&event.organizer_id)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.start_date)
            .bind(event.end_date)
            .bind(&event.status)
            .bind(event.created_at)
            .execute(tx.conn())
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        }
    }

    fn find_event(
        &self,
        tx: &mut PgTransaction,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send {
        async move {
            let row = sqlx::query(
                "SELECT id, organizer_id, title, description, start_date, end_date, status, created_at
                 FROM events WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(tx.conn())
            .await
            .map_err(map_sqlx_error)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let decode =
                |e: sqlx::Error| StoreError::Database(format!("Failed to decode event row: {e}"));
            Ok(Some(EventRecord {
                id: row.try_get("id").map_err(decode)?,
                organizer_id: row.try_get("organizer_id").map_err(decode)?,
                title: row.try_get("title").map_err(decode)?,
                description: row.try_get("description").map_err(decode)?,
                start_date: row.try_get("start_date").map_err(decode)?,
                end_date: row.try_get("end_date").map_err(decode)?,
                status: row.try_get("status").map_err(decode)?,
                created_at: row.try_get("created_at").map_err(decode)?,
            }))
        }
    }
}

impl TicketStore for PostgresStore {
    fn ticket_exists(
        &self,
        tx: &mut PgTransaction,
        event_id: Uuid,
        name: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM tickets WHERE event_id = $1 AND name = $2)",
            )
            .bind(event_id)
            .bind(name)
            .fetch_one(tx.conn())
            .await
            .map_err(map_sqlx_error)
        }
    }

    fn insert_ticket(
        &self,
        tx: &mut PgTransaction,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            sqlx::query(
                "INSERT INTO tickets (
                     id, event_id, name, description, price, total_quantity, available,
                     reserved, sold, sale_start_date, sale_end_date, is_active, created_at, updated_at
                 )
                 VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(ticket.id)
            .bind(ticket.event_id)
            .bind(&ticket.name)
            .bind(&ticket.description)
            .bind(&ticket.price)
            .bind(ticket.total_quantity)
            .bind(ticket.available)
            .bind(ticket.reserved)
            .bind(ticket.sold)
            .bind(ticket.sale_start_date)
            .bind(ticket.sale_end_date)
            .bind(ticket.is_active)
            .bind(ticket.created_at)
            .bind(ticket.updated_at)
            .execute(tx.conn())
            .await
            .map_err(map_sqlx_error)?;

            tracing::debug!(
                ticket_id = %ticket.id,
                event_id = %ticket.event_id,
                name = %ticket.name,
                "Ticket inserted"
            );
            Ok(())
        }
    }
}

impl OrganizerStore for PostgresStore {
    fn insert_organizer(
        &self,
        tx: &mut PgTransaction,
        organizer: &Organizer,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            sqlx::query("INSERT INTO organizers (id, event_count, created_at) VALUES ($1, $2, $3)")
                .bind(organizer.id)
                .bind(organizer.event_count)
                .bind(organizer.created_at)
                .execute(tx.conn())
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        }
    }

    fn find_organizer(
        &self,
        tx: &mut PgTransaction,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Organizer>, StoreError>> + Send {
        async move {
            let row =
                sqlx::query("SELECT id, event_count, created_at FROM organizers WHERE id = $1")
                    .bind(id)
                    .fetch_optional(tx.conn())
                    .await
                    .map_err(map_sqlx_error)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let decode = |e: sqlx::Error| {
                StoreError::Database(format!("Failed to decode organizer row: {e}"))
            };
            Ok(Some(Organizer {
                id: row.try_get("id").map_err(decode)?,
                event_count: row.try_get("event_count").map_err(decode)?,
                created_at: row.try_get("created_at").map_err(decode)?,
            }))
        }
    }

    fn increment_event_count(
        &self,
        tx: &mut PgTransaction,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send {
        async move {
            sqlx::query_scalar::<_, i64>(
                "UPDATE organizers SET event_count = event_count + 1 WHERE id = $1
                 RETURNING event_count",
            )
            .bind(id)
            .fetch_optional(tx.conn())
            .await
            .map_err(map_sqlx_error)
        }
    }
}
