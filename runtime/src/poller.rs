//! Outbox poller: publishes committed outbox rows on a fixed interval.
//!
//! Each tick claims a batch of the oldest unpublished rows, turns each into a
//! [`MessageEnvelope`], publishes it with bounded retry and marks it published.
//!
//! - A row whose publish attempts are exhausted is logged, released, and left
//!   unpublished; the next tick picks it up again.
//! - A row that cannot be turned into an envelope (unknown type, undecodable
//!   payload) is skipped but never deleted. It keeps its claim, so it is
//!   retried once per lease rather than on every tick.
//! - An empty tick is silent.
//!
//! Claims make it safe to run several pollers against one ledger: a row is
//! invisible to other claimers until it is published, released, or its lease
//! expires.
//!
//! # Example
//!
//! ```rust,ignore
//! let poller = OutboxPoller::new(store, publisher, Arc::new(SystemClock))
//!     .with_config(PollerConfig::default().with_interval(Duration::from_secs(5)));
//!
//! let handle = poller.start();
//! // ...
//! handle.stop(Duration::from_secs(30)).await;
//! ```

use crate::lifecycle::{ServiceHandle, wait_for_stop};
use crate::metrics::OutboxMetrics;
use crate::publisher::MessagePublisher;
use outpost_core::clock::Clock;
use outpost_core::envelope::{EnvelopeError, MessageEnvelope};
use outpost_core::outbox::{OutboxEvent, OutboxStore};
use outpost_core::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Poller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between ticks (default: 5s)
    pub interval: Duration,
    /// Rows claimed per tick (default: 100)
    pub batch_size: usize,
    /// How long a claim hides a row from other pollers (default: 60s)
    pub claim_lease: Duration,
    /// Publish calls per row per tick (default: 3)
    pub publish_attempts: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
            publish_attempts: 3,
        }
    }
}

impl PollerConfig {
    /// Set the tick interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Set the publish attempts per row.
    #[must_use]
    pub const fn with_publish_attempts(mut self, attempts: usize) -> Self {
        self.publish_attempts = attempts;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rows claimed
    pub claimed: usize,
    /// Rows published and marked
    pub published: usize,
    /// Rows left unpublished after exhausting publish attempts
    pub failed: usize,
    /// Rows that could not be turned into an envelope
    pub skipped: usize,
}

impl TickReport {
    /// Whether the tick found nothing to do.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

enum RowOutcome {
    Published,
    Failed,
    Skipped,
}

/// Background publisher for an [`OutboxStore`].
pub struct OutboxPoller<S> {
    store: Arc<S>,
    publisher: MessagePublisher,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
}

impl<S: OutboxStore + 'static> OutboxPoller<S> {
    /// Create a poller with default settings.
    #[must_use]
    pub fn new(store: Arc<S>, publisher: MessagePublisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            publisher,
            clock,
            config: PollerConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    /// The active settings.
    #[must_use]
    pub const fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Unpublished rows waiting for the poller, counted up to one batch.
    ///
    /// Claims are ignored, so rows another poller is publishing right now
    /// are included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rows cannot be read.
    pub async fn backlog(&self) -> Result<usize, StoreError> {
        let rows = self.store.list_unpublished(self.config.batch_size).await?;
        Ok(rows.len())
    }

    /// Run one poll cycle.
    ///
    /// Publish failures never surface here; they are logged and the rows stay
    /// unpublished.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the batch could not be claimed.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let rows = self
            .store
            .claim_unpublished(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = TickReport {
            claimed: rows.len(),
            ..TickReport::default()
        };
        if rows.is_empty() {
            tracing::trace!("No unpublished outbox events");
            return Ok(report);
        }

        tracing::debug!(count = rows.len(), "Publishing outbox events");
        for row in &rows {
            match self.publish_row(row).await {
                RowOutcome::Published => report.published += 1,
                RowOutcome::Failed => report.failed += 1,
                RowOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn publish_row(&self, row: &OutboxEvent) -> RowOutcome {
        let envelope = match MessageEnvelope::from_outbox(row, self.clock.now()) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnknownEventType(event_type)) => {
                tracing::warn!(
                    outbox_id = %row.id,
                    event_type = %event_type,
                    "Unknown outbox event type, skipping"
                );
                OutboxMetrics::record_skipped(&row.event_type);
                return RowOutcome::Skipped;
            },
            Err(e) => {
                tracing::error!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    error = %e,
                    "Outbox payload cannot be decoded, skipping"
                );
                OutboxMetrics::record_skipped(&row.event_type);
                return RowOutcome::Skipped;
            },
        };

        if let Err(e) = self
            .publisher
            .publish_envelope(&envelope, self.config.publish_attempts)
            .await
        {
            tracing::error!(
                outbox_id = %row.id,
                event_type = %row.event_type,
                attempts = self.config.publish_attempts,
                error = %e,
                "Failed to publish outbox event, leaving unpublished"
            );
            OutboxMetrics::record_publish_failed();
            if let Err(e) = self.store.release_claim(row.id).await {
                tracing::warn!(outbox_id = %row.id, error = %e, "Failed to release outbox claim");
            }
            return RowOutcome::Failed;
        }

        match self.store.mark_published(row.id).await {
            Ok(flipped) => {
                if flipped {
                    OutboxMetrics::record_published();
                }
                tracing::debug!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    "Outbox event published"
                );
                RowOutcome::Published
            },
            Err(e) => {
                // Published but not marked: the row goes out again once its claim expires.
                tracing::error!(
                    outbox_id = %row.id,
                    error = %e,
                    "Failed to mark outbox event published"
                );
                RowOutcome::Failed
            },
        }
    }

    /// Tick on the configured interval until `shutdown` turns `true`.
    ///
    /// The first tick runs immediately. A tick in progress when the stop
    /// signal arrives is finished before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "Outbox poller started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = wait_for_stop(&mut shutdown) => break,
                _ = interval.tick() => match self.tick().await {
                    Ok(report) if !report.is_idle() => tracing::info!(
                        claimed = report.claimed,
                        published = report.published,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Outbox tick complete"
                    ),
                    Ok(_) => {},
                    Err(e) => tracing::error!(error = %e, "Outbox poll failed"),
                },
            }
        }

        tracing::info!("Outbox poller stopped");
    }

    /// Spawn [`run`](Self::run) on the Tokio runtime.
    #[must_use]
    pub fn start(self) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        ServiceHandle::new("outbox-poller", shutdown_tx, join)
    }
}
