//! Inbox deduplication: apply a message's effect at most once.
//!
//! [`InboxDeduplicator::process`] runs the consumer-side protocol:
//!
//! 1. begin a transaction
//! 2. if the message id is already in the inbox, commit the no-op and report
//!    [`InboxOutcome::Duplicate`]
//! 3. apply the effect inside the transaction
//! 4. record the message id inside the same transaction
//! 5. commit
//!
//! Any failure before the commit drops the transaction, undoing the effect
//! together with the ledger row, so the whole protocol can be repeated verbatim
//! on redelivery. A violation of [`CONSUMED_MESSAGE_CONSTRAINT`] means a
//! concurrent consumer won the race on the same message: the effect is rolled
//! back and the message is reported as a duplicate. A violation of any other
//! constraint is a conflict between distinct messages on a business key and
//! is returned as [`HandlerError::Transient`], so the loser is retried and
//! meets the winner's committed row.

use crate::metrics::InboxMetrics;
use outpost_core::handler::HandlerError;
use outpost_core::inbox::{CONSUMED_MESSAGE_CONSTRAINT, InboxOutcome, InboxStore};
use outpost_core::store::{StoreError, StoreTransaction, TransactionalStore};
use std::future::Future;
use std::sync::Arc;

/// A business write guarded by the inbox.
///
/// Implementations should also guard against duplicates on their own domain
/// keys (for example "a ticket with this event and name already exists") as a
/// second line of defence.
pub trait InboxEffect<S: TransactionalStore>: Send {
    /// Value produced by a successful application.
    type Output: Send;

    /// Perform the write inside `tx`.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Permanent`] for inputs that can never be applied,
    /// [`HandlerError::Transient`] for storage failures.
    fn apply(
        self,
        store: &S,
        tx: &mut S::Tx,
    ) -> impl Future<Output = Result<Self::Output, HandlerError>> + Send;
}

/// Runs effects through the inbox ledger of `S`.
#[derive(Debug)]
pub struct InboxDeduplicator<S> {
    store: Arc<S>,
}

impl<S> Clone for InboxDeduplicator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: InboxStore> InboxDeduplicator<S> {
    /// Create a deduplicator over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply `effect` unless `message_id` was already consumed.
    ///
    /// # Errors
    ///
    /// Returns the effect's error, or [`HandlerError::Transient`] if the store
    /// fails. In both cases nothing was written.
    pub async fn process<E>(
        &self,
        message_id: &str,
        effect: E,
    ) -> Result<InboxOutcome<E::Output>, HandlerError>
    where
        E: InboxEffect<S>,
    {
        let mut tx = self.store.begin().await?;

        if self.store.is_message_consumed(&mut tx, message_id).await? {
            if let Err(e) = tx.commit().await {
                tracing::debug!(message_id, error = %e, "Commit of duplicate check failed");
            }
            return Ok(duplicate(message_id));
        }

        let output = match effect.apply(&self.store, &mut tx).await {
            Ok(output) => output,
            Err(e) => {
                rollback(tx, message_id).await;
                return Err(e);
            },
        };

        match self.store.mark_message_consumed(&mut tx, message_id).await {
            Ok(()) => {},
            Err(e) if e.violates(CONSUMED_MESSAGE_CONSTRAINT) => {
                rollback(tx, message_id).await;
                return Ok(duplicate(message_id));
            },
            Err(e) => {
                rollback(tx, message_id).await;
                return Err(e.into());
            },
        }

        match tx.commit().await {
            Ok(()) => {
                tracing::debug!(message_id, "Message effect committed");
                Ok(InboxOutcome::Applied(output))
            },
            Err(e) if e.violates(CONSUMED_MESSAGE_CONSTRAINT) => Ok(duplicate(message_id)),
            Err(e) => Err(commit_failed(message_id, &e)),
        }
    }
}

fn duplicate<T>(message_id: &str) -> InboxOutcome<T> {
    InboxMetrics::record_duplicate();
    tracing::debug!(message_id, "Duplicate message absorbed");
    InboxOutcome::Duplicate
}

fn commit_failed(message_id: &str, error: &StoreError) -> HandlerError {
    tracing::warn!(message_id, error = %error, "Inbox commit failed, effect rolled back");
    HandlerError::Transient(error.to_string())
}

async fn rollback<T: StoreTransaction>(tx: T, message_id: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(message_id, error = %e, "Rollback failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use outpost_testing::{InMemoryStore, InMemoryTransaction, test_clock};
    use serde_json::json;

    struct InsertRecord {
        key: String,
        yield_first: bool,
        yield_after_staging: bool,
        fail: Option<HandlerError>,
    }

    impl InsertRecord {
        fn new(key: &str) -> Self {
            Self {
                key: key.to_string(),
                yield_first: false,
                yield_after_staging: false,
                fail: None,
            }
        }
    }

    impl InboxEffect<InMemoryStore> for InsertRecord {
        type Output = String;

        async fn apply(
            self,
            _store: &InMemoryStore,
            tx: &mut InMemoryTransaction,
        ) -> Result<String, HandlerError> {
            if self.yield_first {
                tokio::task::yield_now().await;
            }
            tx.insert_record("effects", &self.key, json!({"key": self.key}))?;
            if self.yield_after_staging {
                tokio::task::yield_now().await;
            }
            match self.fail {
                Some(e) => Err(e),
                None => Ok(self.key),
            }
        }
    }

    fn dedup() -> (Arc<InMemoryStore>, InboxDeduplicator<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(Arc::new(test_clock())));
        (store.clone(), InboxDeduplicator::new(store))
    }

    #[tokio::test]
    async fn second_delivery_is_absorbed() {
        let (store, dedup) = dedup();

        let first = dedup.process("m-1", InsertRecord::new("a")).await.unwrap();
        let second = dedup.process("m-1", InsertRecord::new("b")).await.unwrap();

        assert_eq!(first, InboxOutcome::Applied("a".to_string()));
        assert!(second.is_duplicate());
        assert_eq!(store.records("effects").len(), 1);
        assert_eq!(store.consumed_messages().len(), 1);
    }

    #[tokio::test]
    async fn failed_effect_leaves_no_ledger_row() {
        let (store, dedup) = dedup();
        let mut effect = InsertRecord::new("a");
        effect.fail = Some(HandlerError::Permanent("bad input".to_string()));

        let err = dedup.process("m-1", effect).await.unwrap_err();

        assert!(err.is_permanent());
        assert!(store.records("effects").is_empty());
        assert!(store.consumed_messages().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_is_transient_and_repeatable() {
        let (store, dedup) = dedup();
        store.fail_next_commits(1);

        let err = dedup.process("m-1", InsertRecord::new("a")).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(store.records("effects").is_empty());
        assert!(store.consumed_messages().is_empty());

        let retried = dedup.process("m-1", InsertRecord::new("a")).await.unwrap();
        assert_eq!(retried, InboxOutcome::Applied("a".to_string()));
        assert_eq!(store.records("effects").len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_is_transient() {
        let (store, dedup) = dedup();
        store.set_unavailable(true);

        let err = dedup.process("m-1", InsertRecord::new("a")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Transient(_)));
    }

    #[tokio::test]
    async fn distinct_messages_racing_on_one_business_key_are_not_duplicates() {
        let (store, dedup) = dedup();
        // both stage the record before either commits
        let mut first = InsertRecord::new("same-key");
        first.yield_after_staging = true;
        let mut second = InsertRecord::new("same-key");
        second.yield_after_staging = true;

        let (a, b) = tokio::join!(dedup.process("m-1", first), dedup.process("m-2", second));

        assert_eq!(a.unwrap(), InboxOutcome::Applied("same-key".to_string()));
        let err = b.unwrap_err();
        assert!(matches!(err, HandlerError::Transient(_)), "{err:?}");
        assert_eq!(store.records("effects").len(), 1);
        let consumed: Vec<_> = store
            .consumed_messages()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(consumed, ["m-1"]);

        // the retried delivery sees the committed row and is recorded
        let retried = dedup.process("m-2", InsertRecord::new("other-key")).await.unwrap();
        assert_eq!(retried, InboxOutcome::Applied("other-key".to_string()));
        assert_eq!(store.consumed_messages().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() {
        let (store, dedup) = dedup();
        let mut first = InsertRecord::new("a");
        first.yield_first = true;
        let mut second = InsertRecord::new("b");
        second.yield_first = true;

        let (a, b) = tokio::join!(dedup.process("m-1", first), dedup.process("m-1", second));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 1);
        assert_eq!(store.records("effects").len(), 1);
        assert_eq!(store.consumed_messages().len(), 1);
    }
}
