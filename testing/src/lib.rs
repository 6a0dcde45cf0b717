//! # Outpost Testing
//!
//! Deterministic fakes for exercising the delivery pipeline without
//! PostgreSQL or RabbitMQ.
//!
//! - [`InMemoryStore`]: outbox and inbox ledgers with real transaction
//!   semantics (staged writes, rollback on drop, uniqueness checked at commit)
//! - [`InMemoryBroker`]: topic exchanges, durable queues, prefetch, manual
//!   acknowledgment, message TTL and dead-lettering, with fault injection
//! - [`FixedClock`]: a clock that only moves when told to
//!
//! ## Example
//!
//! ```ignore
//! use outpost_testing::{InMemoryBroker, InMemoryStore, test_clock};
//!
//! #[tokio::test]
//! async fn publishes_pending_rows() {
//!     let clock = Arc::new(test_clock());
//!     let store = Arc::new(InMemoryStore::new(clock.clone()));
//!     let broker = Arc::new(InMemoryBroker::new());
//!     // ... write rows, run a poller tick, inspect broker.published()
//! }
//! ```

pub mod broker;
pub mod store;

use chrono::{DateTime, Utc};
use outpost_core::clock::Clock;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};

    /// Clock that stands still until [`advance`](Self::advance) or
    /// [`set`](Self::set) moves it.
    ///
    /// Lease expiry in the outbox and `consumed_at` stamps in the inbox are
    /// driven from it, so tests can step past a claim lease without sleeping.
    ///
    /// ```
    /// use outpost_testing::mocks::FixedClock;
    /// use outpost_core::clock::Clock;
    ///
    /// let clock = FixedClock::new(chrono::Utc::now());
    /// let start = clock.now();
    /// clock.advance(chrono::Duration::seconds(61));
    /// assert_eq!((clock.now() - start).num_seconds(), 61);
    /// ```
    #[derive(Debug)]
    pub struct FixedClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Clock frozen at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Clock frozen at 2025-01-01T00:00:00Z.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp_nanos(1_735_689_600_000_000_000))
    }
}

/// Install a `tracing` subscriber for test output.
///
/// Honours `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outpost=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub use broker::{InMemoryBroker, PublishFault, Settlement, SettlementKind};
pub use mocks::{FixedClock, test_clock};
pub use store::{InMemoryStore, InMemoryTransaction};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn fixed_clock_moves_only_when_told() {
        let clock = test_clock();
        let start = clock.now();
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }
}
