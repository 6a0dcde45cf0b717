//! Message publisher with publisher confirms and bounded retry.
//!
//! Every message is published persistent, as JSON, with its message id set
//! both as the AMQP property and as a `message-id` header. The broker's answer
//! decides the outcome:
//!
//! | confirmation | result |
//! |--------------|--------|
//! | ack | `Ok` |
//! | nack | `Err(PublishError::Nacked)` (retryable) |
//! | timeout | `Ok`, with a warning and `publisher.confirm.timeout` |
//! | confirms off | `Ok` (fire-and-forget) |
//!
//! A confirmation timeout is treated as success: the message was handed to
//! the broker, and missing confirmation does not imply loss. The inbox on the
//! consumer side absorbs the occasional duplicate this produces.

use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_while};
use outpost_core::broker::{
    BrokerError, Confirmation, MESSAGE_ID_HEADER, MessageBroker, OutgoingMessage,
};
use outpost_core::envelope::MessageEnvelope;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a publish did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The message could not be encoded
    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    /// The broker could not be reached or refused the message
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker explicitly rejected the message
    #[error("Broker rejected publish to '{exchange}' with key '{routing_key}'")]
    Nacked {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
    },
}

impl PublishError {
    /// Whether publishing the same message again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Publisher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// How long to wait for a broker confirmation (default: 10s)
    pub confirm_timeout: Duration,
    /// Backoff between attempts of [`MessagePublisher::publish_with_retry`]
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl PublisherConfig {
    /// Set the confirmation wait bound.
    #[must_use]
    pub const fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Set the retry backoff.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Publishes messages through a [`MessageBroker`].
///
/// Cheap to clone; clones share the broker connection.
#[derive(Clone)]
pub struct MessagePublisher {
    broker: Arc<dyn MessageBroker>,
    config: PublisherConfig,
}

impl MessagePublisher {
    /// Create a publisher.
    ///
    /// Logs a warning when the broker runs without publisher confirms.
    #[must_use]
    pub fn new(broker: Arc<dyn MessageBroker>, config: PublisherConfig) -> Self {
        if !broker.confirms_enabled() {
            tracing::warn!("Publisher confirms unavailable, publishing fire-and-forget");
        }
        Self { broker, config }
    }

    /// Whether the broker connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Whether publishes wait for broker confirmation.
    #[must_use]
    pub fn confirms_enabled(&self) -> bool {
        self.broker.confirms_enabled()
    }

    /// Serialize `message` as JSON and publish it once.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if serialization fails, the broker is
    /// unreachable, or the broker nacks the message.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        message_id: Option<&str>,
    ) -> Result<(), PublishError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let outgoing = encode(exchange, routing_key, message, message_id)?;
        self.publish_raw(&outgoing).await
    }

    /// Publish like [`publish`](Self::publish), retrying retryable failures
    /// up to `max_attempts` calls in total with the configured backoff.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, or a serialization error
    /// immediately.
    pub async fn publish_with_retry<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        message_id: Option<&str>,
        max_attempts: usize,
    ) -> Result<(), PublishError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let outgoing = encode(exchange, routing_key, message, message_id)?;
        let policy = self.config.retry.clone().with_max_attempts(max_attempts);
        retry_while(&policy, || self.publish_raw(&outgoing), PublishError::is_retryable)
            .await
    }

    /// Publish an envelope to its destination, keyed by its message id.
    ///
    /// # Errors
    ///
    /// See [`publish_with_retry`](Self::publish_with_retry).
    pub async fn publish_envelope(
        &self,
        envelope: &MessageEnvelope,
        max_attempts: usize,
    ) -> Result<(), PublishError> {
        let destination = envelope.destination();
        self.publish_with_retry(
            destination.exchange,
            destination.routing_key,
            envelope,
            envelope.message_id.as_deref(),
            max_attempts,
        )
        .await
    }

    /// Publish a pre-encoded message once.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Broker`] if the broker is unreachable and
    /// [`PublishError::Nacked`] if it rejects the message.
    pub async fn publish_raw(&self, message: &OutgoingMessage) -> Result<(), PublishError> {
        let confirmation = self
            .broker
            .publish(message, self.config.confirm_timeout)
            .await?;

        match confirmation {
            Confirmation::Acked => {
                tracing::debug!(
                    exchange = %message.exchange,
                    routing_key = %message.routing_key,
                    message_id = message.message_id.as_deref(),
                    "Message published"
                );
                Ok(())
            },
            Confirmation::NotRequested => Ok(()),
            Confirmation::TimedOut => {
                tracing::warn!(
                    exchange = %message.exchange,
                    routing_key = %message.routing_key,
                    message_id = message.message_id.as_deref(),
                    timeout_ms =
                        u64::try_from(self.config.confirm_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Publish confirmation timed out, assuming delivered"
                );
                PublisherMetrics::record_confirm_timeout();
                Ok(())
            },
            Confirmation::Nacked => {
                PublisherMetrics::record_nacked();
                Err(PublishError::Nacked {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                })
            },
        }
    }
}

impl std::fmt::Debug for MessagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePublisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn encode<T>(
    exchange: &str,
    routing_key: &str,
    message: &T,
    message_id: Option<&str>,
) -> Result<OutgoingMessage, PublishError>
where
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| PublishError::Serialization(e.to_string()))?;
    let outgoing = OutgoingMessage::json(exchange, routing_key, payload);
    Ok(match message_id {
        Some(id) => outgoing.with_message_id(id).with_header(MESSAGE_ID_HEADER, id),
        None => outgoing,
    })
}
