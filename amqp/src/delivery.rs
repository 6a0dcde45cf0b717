//! [`Delivery`] over a lapin delivery.

use crate::convert::header;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use outpost_core::broker::{BrokerError, Delivery, MESSAGE_ID_HEADER};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

/// One message received with manual acknowledgment.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
    message_id: Option<String>,
    settled: AtomicBool,
}

impl AmqpDelivery {
    pub(crate) fn new(inner: lapin::message::Delivery) -> Self {
        let message_id = inner
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty())
            .or_else(|| header(&inner.properties, MESSAGE_ID_HEADER));
        Self {
            inner,
            message_id,
            settled: AtomicBool::new(false),
        }
    }

    /// The broker's delivery tag.
    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn claim_settlement(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Acknowledgement(format!(
                "delivery {} already settled",
                self.inner.delivery_tag
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AmqpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDelivery")
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("routing_key", &self.inner.routing_key.as_str())
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn exchange(&self) -> &str {
        self.inner.exchange.as_str()
    }

    fn routing_key(&self) -> &str {
        self.inner.routing_key.as_str()
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.claim_settlement()?;
            self.inner
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::Acknowledgement(e.to_string()))
        })
    }

    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.claim_settlement()?;
            self.inner
                .acker
                .nack(BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                })
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::Acknowledgement(e.to_string()))
        })
    }
}
