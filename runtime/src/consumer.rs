//! Message consumer with manual acknowledgment and broker-side delayed retry.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! declare topology
//! loop {
//!     subscribe (prefetch = N):
//!         for each delivery, up to N at once:
//!             resolve message id
//!             handle (bounded by handler_timeout)
//!             Ok         -> ack
//!             Transient  -> republish to <exchange>.retry, nack(requeue = false)
//!             Permanent  -> republish to <exchange>.dead,  nack(requeue = false)
//!             republish failed -> nack(requeue = true)
//!     stream ended -> wait reconnect_delay, resubscribe
//! }
//! ```
//!
//! The consumer never sleeps on a failing message. A transient failure parks
//! the message on the retry queue, whose TTL dead-letters it back to the main
//! exchange under its original routing key once the delay has passed.
//!
//! # Message ids
//!
//! The dedup key comes from, in order: the transport `message_id` property,
//! the `message-id` header, a `message_id` field in a JSON body, or a UUID v5
//! derived from the body bytes. JSON object bodies without a `message_id` field
//! get the resolved id injected before the handler sees them, and the id is
//! carried along when the message is parked so every redelivery uses the same
//! key.
//!
//! # Shutdown
//!
//! When the stop flag is set the consumer stops pulling deliveries, lets the
//! in-flight ones settle, and returns. A delivery abandoned by an abrupt exit
//! stays unacknowledged and is redelivered by the broker.

use crate::lifecycle::{ServiceHandle, wait_for_stop};
use crate::metrics::ConsumerMetrics;
use crate::publisher::{MessagePublisher, PublisherConfig};
use futures::StreamExt;
use outpost_core::broker::{
    BrokerError, Delivery, DeliveryStream, MESSAGE_ID_HEADER, MessageBroker, OutgoingMessage,
    RetryTopology,
};
use outpost_core::handler::{HandlerError, IncomingMessage, MessageHandler};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries in flight (default: 1)
    pub prefetch: u16,
    /// Bound on one handler call (default: 30s)
    pub handler_timeout: Duration,
    /// Pause before resubscribing after the stream ends (default: 5s)
    pub reconnect_delay: Duration,
    /// Wait bound for confirmations of parked messages (default: 10s)
    pub confirm_timeout: Duration,
    /// Consumer tag announced to the broker
    pub consumer_tag: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            handler_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(10),
            consumer_tag: "outpost-consumer".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Set the prefetch window.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the handler timeout.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the resubscribe delay.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the confirmation wait bound for parked messages.
    #[must_use]
    pub const fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Set the consumer tag.
    #[must_use]
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and acknowledged
    Acked,
    /// Parked on the retry queue
    Retried,
    /// Parked on the dead queue
    Dropped,
    /// Could not be parked; handed back to the broker
    Requeued,
}

impl Disposition {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Retried => "retried",
            Self::Dropped => "dropped",
            Self::Requeued => "requeued",
        }
    }
}

/// Derive a stable message id from a body.
///
/// The same bytes always yield the same id, so a redelivered message without
/// an explicit id is still recognised as a duplicate.
#[must_use]
pub fn derive_message_id(body: &[u8]) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, body).to_string()
}

/// Resolve the dedup key of a delivery and build the handler's view of it.
#[must_use]
pub fn incoming_message(delivery: &dyn Delivery) -> IncomingMessage {
    let body = delivery.body();
    let mut json = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    let message_id = delivery
        .message_id()
        .map(str::to_string)
        .or_else(|| {
            json.as_ref()
                .and_then(|map| map.get("message_id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| derive_message_id(body));

    let body = match json.as_mut() {
        Some(map) if !map.contains_key("message_id") => {
            map.insert("message_id".to_string(), Value::String(message_id.clone()));
            serde_json::to_vec(map).unwrap_or_else(|_| body.to_vec())
        },
        _ => body.to_vec(),
    };

    IncomingMessage {
        message_id,
        exchange: delivery.exchange().to_string(),
        routing_key: delivery.routing_key().to_string(),
        body,
        redelivered: delivery.redelivered(),
    }
}

/// State shared by every in-flight delivery task.
struct Dispatch {
    handler: Arc<dyn MessageHandler>,
    publisher: MessagePublisher,
    retry: RetryTopology,
    handler_timeout: Duration,
}

impl Dispatch {
    async fn process(&self, delivery: Box<dyn Delivery>) -> Disposition {
        let message = incoming_message(delivery.as_ref());

        let started = Instant::now();
        let result = tokio::time::timeout(self.handler_timeout, self.handler.handle(&message))
            .await
            .unwrap_or_else(|_| {
                Err(HandlerError::Transient(format!(
                    "handler timed out after {}ms",
                    self.handler_timeout.as_millis()
                )))
            });
        ConsumerMetrics::record_handler_duration(started.elapsed());

        let disposition = match result {
            Ok(outcome) => {
                match delivery.ack().await {
                    Ok(()) => tracing::debug!(
                        message_id = %message.message_id,
                        routing_key = %message.routing_key,
                        ?outcome,
                        "Message acknowledged"
                    ),
                    // The broker redelivers it; the inbox absorbs the repeat.
                    Err(e) => tracing::error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to acknowledge delivery"
                    ),
                }
                Disposition::Acked
            },
            Err(HandlerError::Transient(reason)) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    routing_key = %message.routing_key,
                    redelivered = message.redelivered,
                    retry_delay_ms =
                        u64::try_from(self.retry.retry_delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %reason,
                    "Transient handler failure, scheduling retry"
                );
                self.park(delivery.as_ref(), &message, Disposition::Retried)
                    .await
            },
            Err(HandlerError::Permanent(reason)) => {
                tracing::error!(
                    message_id = %message.message_id,
                    routing_key = %message.routing_key,
                    reason = %reason,
                    "Permanent handler failure, dropping message"
                );
                self.park(delivery.as_ref(), &message, Disposition::Dropped)
                    .await
            },
        };

        ConsumerMetrics::record_delivery(disposition.as_str());
        disposition
    }

    /// Republish the original body to the retry or dead exchange, then nack.
    async fn park(
        &self,
        delivery: &dyn Delivery,
        message: &IncomingMessage,
        target: Disposition,
    ) -> Disposition {
        let exchange = if target == Disposition::Retried {
            &self.retry.retry_exchange
        } else {
            &self.retry.dead_exchange
        };
        let parked = OutgoingMessage::json(
            exchange.as_str(),
            delivery.routing_key(),
            delivery.body().to_vec(),
        )
        .with_message_id(&message.message_id)
        .with_header(MESSAGE_ID_HEADER, &message.message_id);

        let (requeue, disposition) = match self.publisher.publish_raw(&parked).await {
            Ok(()) => (false, target),
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    exchange = %exchange,
                    error = %e,
                    "Failed to park delivery, requeueing"
                );
                (true, Disposition::Requeued)
            },
        };

        if let Err(e) = delivery.nack(requeue).await {
            tracing::error!(
                message_id = %message.message_id,
                requeue,
                error = %e,
                "Failed to reject delivery"
            );
        }
        disposition
    }
}

/// Consumes one queue, dispatching deliveries to a [`MessageHandler`].
pub struct MessageConsumer {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    retry: RetryTopology,
    config: ConsumerConfig,
}

impl MessageConsumer {
    /// Create a consumer for `retry.queue` with default settings.
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn MessageHandler>,
        retry: RetryTopology,
    ) -> Self {
        Self {
            broker,
            handler,
            retry,
            config: ConsumerConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// The consumed queue and its retry companions.
    #[must_use]
    pub const fn retry_topology(&self) -> &RetryTopology {
        &self.retry
    }

    /// Declare the main, retry and dead exchanges and queues.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if a declaration fails.
    pub async fn declare_topology(&self) -> Result<(), BrokerError> {
        self.broker
            .declare_topology(&self.retry.topology())
            .await?;
        tracing::info!(
            exchange = %self.retry.exchange,
            queue = %self.retry.queue,
            retry_queue = %self.retry.retry_queue,
            dead_queue = %self.retry.dead_queue,
            "Consumer topology declared"
        );
        Ok(())
    }

    /// Consume until `shutdown` turns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the topology cannot be declared. Failures
    /// after that are logged and answered by resubscribing.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        self.declare_topology().await?;

        let publisher = MessagePublisher::new(
            Arc::clone(&self.broker),
            PublisherConfig::default().with_confirm_timeout(self.config.confirm_timeout),
        );
        let dispatch = Arc::new(Dispatch {
            handler: Arc::clone(&self.handler),
            publisher,
            retry: self.retry.clone(),
            handler_timeout: self.config.handler_timeout,
        });

        tracing::info!(
            queue = %self.retry.queue,
            consumer_tag = %self.config.consumer_tag,
            prefetch = self.config.prefetch,
            "Consumer started"
        );

        loop {
            match self
                .broker
                .consume(&self.retry.queue, &self.config.consumer_tag, self.config.prefetch)
                .await
            {
                Ok(stream) => {
                    if self.drain(stream, &dispatch, &mut shutdown).await {
                        break;
                    }
                    tracing::warn!(
                        queue = %self.retry.queue,
                        delay_secs = self.config.reconnect_delay.as_secs(),
                        "Delivery stream ended, resubscribing"
                    );
                },
                Err(e) => tracing::error!(
                    queue = %self.retry.queue,
                    error = %e,
                    delay_secs = self.config.reconnect_delay.as_secs(),
                    "Failed to subscribe, retrying"
                ),
            }

            tokio::select! {
                () = wait_for_stop(&mut shutdown) => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {},
            }
        }

        tracing::info!(queue = %self.retry.queue, "Consumer stopped");
        Ok(())
    }

    /// Process deliveries until the stream ends or the stop flag is set.
    ///
    /// Returns `true` if stopped by the flag. In-flight deliveries are always
    /// settled before returning.
    async fn drain(
        &self,
        mut stream: DeliveryStream,
        dispatch: &Arc<Dispatch>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let window = usize::from(self.config.prefetch.max(1));
        let mut in_flight = JoinSet::new();

        let stopped = loop {
            tokio::select! {
                biased;

                () = wait_for_stop(shutdown) => break true,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                },

                next = stream.next(), if in_flight.len() < window => match next {
                    Some(Ok(delivery)) => {
                        let dispatch = Arc::clone(dispatch);
                        in_flight.spawn(async move { dispatch.process(delivery).await });
                    },
                    Some(Err(e)) => {
                        tracing::warn!(
                            queue = %self.retry.queue,
                            error = %e,
                            "Delivery stream error"
                        );
                        break false;
                    },
                    None => break false,
                },
            }
        };

        // Stop pulling; let what is in hand settle.
        drop(stream);
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        stopped
    }

    /// Spawn [`run`](Self::run) on the Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = self.retry.queue.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = self.run(shutdown_rx).await {
                tracing::error!(queue = %queue, error = %e, "Consumer failed to start");
            }
        });
        ServiceHandle::new("message-consumer", shutdown_tx, join)
    }
}

fn log_join(joined: Result<Disposition, tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Delivery task panicked");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use outpost_core::handler::HandleOutcome;
    use outpost_testing::{InMemoryBroker, PublishFault, SettlementKind};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "ticket_events_queue";
    const KEY: &str = "ticket.created.pending";
    const WAIT: Duration = Duration::from_secs(60);

    type HandleFuture<'a> =
        Pin<Box<dyn std::future::Future<Output = Result<HandleOutcome, HandlerError>> + Send + 'a>>;

    /// Replies with a scripted result per call; records what it saw.
    struct Scripted {
        script: Mutex<Vec<Result<HandleOutcome, HandlerError>>>,
        seen: Mutex<Vec<IncomingMessage>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<HandleOutcome, HandlerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl MessageHandler for Scripted {
        fn handle<'a>(
            &'a self,
            message: &'a IncomingMessage,
        ) -> HandleFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(message.clone());
            let mut script = self.script.lock().unwrap();
            let next = if script.is_empty() {
                Ok(HandleOutcome::Applied)
            } else {
                script.remove(0)
            };
            Box::pin(async move { next })
        }
    }

    struct Slow;

    impl MessageHandler for Slow {
        fn handle<'a>(
            &'a self,
            _message: &'a IncomingMessage,
        ) -> HandleFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(HandleOutcome::Applied)
            })
        }
    }

    fn retry() -> RetryTopology {
        RetryTopology::for_queue("tickets", QUEUE, &[KEY], Duration::from_secs(5))
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_handler_timeout(Duration::from_secs(30))
            .with_reconnect_delay(Duration::from_secs(1))
    }

    async fn publish(broker: &InMemoryBroker, body: &[u8], message_id: Option<&str>) {
        let mut message = OutgoingMessage::json("tickets", KEY, body.to_vec());
        if let Some(id) = message_id {
            message = message.with_message_id(id);
        }
        broker.publish(&message, Duration::from_secs(1)).await.unwrap();
    }

    async fn start(
        broker: &Arc<InMemoryBroker>,
        handler: Arc<dyn MessageHandler>,
    ) -> ServiceHandle {
        let consumer = MessageConsumer::new(broker.clone(), handler, retry()).with_config(config());
        consumer.declare_topology().await.unwrap();
        consumer.spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_acknowledged() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![]);
        let handle = start(&broker, handler.clone()).await;

        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);

        assert_eq!(broker.settlements()[0].kind, SettlementKind::Acked);
        assert_eq!(broker.queue_depth(QUEUE), 0);
        assert_eq!(handler.seen.lock().unwrap()[0].message_id, "m-1");
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_comes_back_after_the_retry_delay() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![Err(HandlerError::Transient("db busy".to_string()))]);
        let handle = start(&broker, handler.clone()).await;

        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);
        assert_eq!(broker.settlements()[0].kind, SettlementKind::Rejected);
        assert_eq!(broker.published_to("tickets.retry").len(), 1);

        // expires out of the retry queue and is handled again
        assert!(broker.wait_for_settlements(2, WAIT).await);
        assert_eq!(broker.settlements()[1].kind, SettlementKind::Acked);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen[1].message_id, "m-1");
        assert_eq!(seen[1].routing_key, KEY);
        assert_eq!(broker.queue_depth("ticket_events_queue.dead"), 0);
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_parked_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![Err(HandlerError::Permanent("bad".to_string()))]);
        let handle = start(&broker, handler.clone()).await;

        publish(&broker, b"not json", Some("m-1")).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);

        assert_eq!(broker.settlements()[0].kind, SettlementKind::Rejected);
        assert_eq!(broker.queue_depth("ticket_events_queue.dead"), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_parking_requeues_the_delivery() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![Err(HandlerError::Transient("db busy".to_string()))]);
        let handle = start(&broker, handler.clone()).await;

        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        broker.push_publish_fault(PublishFault::Error);
        assert!(broker.wait_for_settlements(2, WAIT).await);

        let settlements = broker.settlements();
        assert_eq!(settlements[0].kind, SettlementKind::Requeued);
        assert_eq!(settlements[1].kind, SettlementKind::Acked);
        assert!(handler.seen.lock().unwrap()[1].redelivered);
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_counts_as_transient() {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = start(&broker, Arc::new(Slow)).await;

        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);

        assert_eq!(broker.settlements()[0].kind, SettlementKind::Rejected);
        assert_eq!(broker.published_to("tickets.retry").len(), 1);
        handle.signal();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_message_id_is_derived_and_injected() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![]);
        let handle = start(&broker, handler.clone()).await;

        let body = br#"{"event_id":"e-1"}"#;
        publish(&broker, body, None).await;
        publish(&broker, body, None).await;
        assert!(broker.wait_for_settlements(2, WAIT).await);

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen[0].message_id, derive_message_id(body));
        assert_eq!(seen[0].message_id, seen[1].message_id);
        let injected: Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(injected["message_id"], seen[0].message_id.as_str());
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn body_message_id_is_used_when_transport_has_none() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![]);
        let handle = start(&broker, handler.clone()).await;

        publish(&broker, br#"{"event_id":"e-1","message_id":"m-body"}"#, None).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);

        assert_eq!(handler.seen.lock().unwrap()[0].message_id, "m-body");
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_the_stream_ends() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![]);
        let handle = start(&broker, handler.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.disconnect_consumers();
        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        assert!(broker.wait_for_settlements(1, WAIT).await);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(handle.stop(WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_stops_pulling_deliveries() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Scripted::new(vec![]);
        let handle = start(&broker, handler.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.stop(WAIT).await);
        publish(&broker, br#"{"event_id":"e-1"}"#, Some("m-1")).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue_depth(QUEUE), 1);
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_message_id(b"abc"), derive_message_id(b"abc"));
        assert_ne!(derive_message_id(b"abc"), derive_message_id(b"abd"));
    }
}
