//! Consumer-side message handling.
//!
//! A [`MessageHandler`] turns one delivery into one effect. Its result decides
//! what the consumer does with the delivery:
//!
//! | result | consumer action |
//! |--------|-----------------|
//! | `Ok(_)` | ack |
//! | `Err(HandlerError::Transient(_))` | park on the retry queue, nack without requeue |
//! | `Err(HandlerError::Permanent(_))` | park on the dead queue, nack without requeue |

use crate::envelope::EnvelopeError;
use crate::store::StoreError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Why a handler could not apply a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Redelivering the same message will fail the same way
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// A dependency was unavailable; redelivery may succeed
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    /// Whether the message should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(error: EnvelopeError) -> Self {
        Self::Permanent(error.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        Self::Transient(error.to_string())
    }
}

/// How a handler disposed of a message it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The effect was applied
    Applied,
    /// The message had already been applied; nothing changed
    Duplicate,
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Dedup key, taken from the transport or derived from the body
    pub message_id: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Body bytes; JSON object bodies carry `message_id` as a field
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// Processes deliveries for a consumer.
///
/// Handlers must be idempotent: the same message may arrive more than once.
pub trait MessageHandler: Send + Sync {
    /// Apply one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Permanent`] for messages that can never be
    /// applied and [`HandlerError::Transient`] for failures worth retrying.
    fn handle<'a>(
        &'a self,
        message: &'a IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<HandleOutcome, HandlerError>> + Send + 'a>>;
}
