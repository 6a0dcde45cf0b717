//! `consumed_messages` ledger.

use crate::{PgTransaction, PostgresStore, map_sqlx_error};
use outpost_core::inbox::InboxStore;
use outpost_core::store::StoreError;
use std::future::Future;
use uuid::Uuid;

impl InboxStore for PostgresStore {
    fn is_message_consumed(
        &self,
        tx: &mut PgTransaction,
        message_id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM consumed_messages WHERE message_id = $1)",
            )
            .bind(message_id)
            .fetch_one(tx.conn())
            .await
            .map_err(map_sqlx_error)
        }
    }

    fn mark_message_consumed(
        &self,
        tx: &mut PgTransaction,
        message_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            // A concurrent insert of the same id blocks here until the other
            // transaction finishes, then fails with the unique violation.
            sqlx::query(
                "INSERT INTO consumed_messages (id, message_id, consumed_at) VALUES ($1, $2, $3)",
            )
            .bind(Uuid::new_v4())
            .bind(message_id)
            .bind(self.now())
            .execute(tx.conn())
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        }
    }
}
