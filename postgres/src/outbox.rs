//! `outbox_events` ledger.

use crate::{PgTransaction, PostgresStore, map_sqlx_error, to_i64};
use outpost_core::outbox::{NewOutboxEvent, OutboxEvent, OutboxStore};
use outpost_core::store::StoreError;
use sqlx::Row;
use sqlx::postgres::PgRow;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

const COLUMNS: &str = "id, seq, aggregate_id, event_type, event_data, published, created_at, published_at";

fn row_to_event(row: &PgRow) -> Result<(i64, OutboxEvent), StoreError> {
    let decode = |e: sqlx::Error| StoreError::Database(format!("Failed to decode outbox row: {e}"));
    Ok((
        row.try_get("seq").map_err(decode)?,
        OutboxEvent {
            id: row.try_get("id").map_err(decode)?,
            aggregate_id: row.try_get("aggregate_id").map_err(decode)?,
            event_type: row.try_get("event_type").map_err(decode)?,
            event_data: row.try_get("event_data").map_err(decode)?,
            published: row.try_get("published").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            published_at: row.try_get("published_at").map_err(decode)?,
        },
    ))
}

fn rows_in_creation_order(rows: &[PgRow]) -> Result<Vec<OutboxEvent>, StoreError> {
    let mut events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
    events.sort_by_key(|(seq, event)| (event.created_at, *seq));
    Ok(events.into_iter().map(|(_, event)| event).collect())
}

impl OutboxStore for PostgresStore {
    fn create_outbox_event(
        &self,
        tx: &mut PgTransaction,
        event: NewOutboxEvent,
    ) -> impl Future<Output = Result<OutboxEvent, StoreError>> + Send {
        async move {
            let sql = format!(
                "INSERT INTO outbox_events (id, aggregate_id, event_type, event_data, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING {COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(&event.aggregate_id)
                .bind(&event.event_type)
                .bind(&event.event_data)
                .bind(self.now())
                .fetch_one(tx.conn())
                .await
                .map_err(map_sqlx_error)?;

            let (_, created) = row_to_event(&row)?;
            tracing::debug!(
                outbox_id = %created.id,
                aggregate_id = %created.aggregate_id,
                event_type = %created.event_type,
                "Outbox row written"
            );
            Ok(created)
        }
    }

    fn list_unpublished(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send {
        async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events
                 WHERE published = FALSE
                 ORDER BY created_at ASC, seq ASC
                 LIMIT $1"
            );
            let rows = sqlx::query(&sql)
                .bind(to_i64(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            rows_in_creation_order(&rows)
        }
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        lease: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send {
        async move {
            let lease = chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Database(format!("Invalid claim lease: {e}")))?;
            let now = self.now();

            // RETURNING order is unspecified; rows are re-sorted below.
            let sql = format!(
                "UPDATE outbox_events SET claimed_until = $2
                 WHERE id IN (
                     SELECT id FROM outbox_events
                     WHERE published = FALSE
                       AND (claimed_until IS NULL OR claimed_until <= $3)
                     ORDER BY created_at ASC, seq ASC
                     LIMIT $1
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING {COLUMNS}"
            );
            let rows = sqlx::query(&sql)
                .bind(to_i64(limit))
                .bind(now + lease)
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            rows_in_creation_order(&rows)
        }
    }

    fn release_claim(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            sqlx::query(
                "UPDATE outbox_events SET claimed_until = NULL
                 WHERE id = $1 AND published = FALSE",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        }
    }

    fn mark_published(&self, id: Uuid) -> impl Future<Output = Result<bool, StoreError>> + Send {
        async move {
            let result = sqlx::query(
                "UPDATE outbox_events
                 SET published = TRUE, published_at = $2, claimed_until = NULL
                 WHERE id = $1 AND published = FALSE",
            )
            .bind(id)
            .bind(self.now())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() == 1)
        }
    }

    fn find_outbox_event(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<OutboxEvent>, StoreError>> + Send {
        async move {
            let sql = format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref()
                .map(|row| row_to_event(row).map(|(_, event)| event))
                .transpose()
        }
    }
}
