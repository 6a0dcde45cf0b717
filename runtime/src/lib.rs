//! # Outpost Runtime
//!
//! The moving parts of reliable delivery, built on the traits in
//! `outpost_core`.
//!
//! ## Core Components
//!
//! - **Outbox Poller**: claims unpublished outbox rows, publishes them, marks them
//! - **Publisher**: persistent JSON publishes with confirms and bounded retry
//! - **Consumer**: manual ack, prefetch, and broker-side delayed retry through a
//!   TTL queue plus a dead queue for permanent failures
//! - **Inbox Deduplicator**: applies each message's effect at most once
//!
//! ## Example
//!
//! ```ignore
//! use outpost_runtime::{MessageConsumer, MessagePublisher, OutboxPoller, PublisherConfig};
//!
//! let publisher = MessagePublisher::new(broker.clone(), PublisherConfig::default());
//! let poller = OutboxPoller::new(store.clone(), publisher, clock).start();
//!
//! let consumer = MessageConsumer::new(broker, handler, retry_topology).spawn();
//!
//! shutdown_signal().await;
//! consumer.stop(Duration::from_secs(30)).await;
//! poller.stop(Duration::from_secs(30)).await;
//! ```

/// Message consumer with manual acknowledgment and delayed retry
pub mod consumer;

/// Inbox deduplication
pub mod inbox;

/// Background service start/stop plumbing
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox poller
pub mod poller;

/// Confirmed publisher
pub mod publisher;

/// Retry logic with backoff
pub mod retry;

pub use consumer::{ConsumerConfig, Disposition, MessageConsumer, derive_message_id};
pub use inbox::{InboxDeduplicator, InboxEffect};
pub use lifecycle::{ServiceHandle, wait_for_stop};
pub use metrics::{MetricsError, MetricsServer};
pub use poller::{OutboxPoller, PollerConfig, TickReport};
pub use publisher::{MessagePublisher, PublishError, PublisherConfig};
pub use retry::{Backoff, RetryPolicy};
