//! Time source abstraction.
//!
//! Ledger timestamps (`created_at`, `published_at`, `consumed_at`) and envelope
//! timestamps are all read through a [`Clock`] so tests can pin time.

use chrono::{DateTime, Utc};

/// Source of "now" for ledgers and envelopes.
///
/// ```
/// use outpost_core::clock::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let before = chrono::Utc::now();
/// assert!(clock.now() >= before);
/// ```
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
