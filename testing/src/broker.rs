//! In-memory [`MessageBroker`] with AMQP-like routing.
//!
//! Models what the delivery pipeline depends on and nothing more:
//!
//! - topic, direct and fanout exchanges plus the default (`""`) exchange
//! - queues with `x-message-ttl` and `x-dead-letter-exchange` behaviour
//! - manual acknowledgment bounded by a per-consumer prefetch window
//! - requeue on `nack(true)` and on dropping an unsettled delivery
//!
//! Faults are scripted: [`PublishFault`]s are consumed one per publish,
//! [`InMemoryBroker::set_connected`] toggles the connection, and
//! [`InMemoryBroker::disconnect_consumers`] ends every open delivery stream so
//! consumers have to resubscribe.

use outpost_core::broker::{
    BrokerError, Confirmation, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    MESSAGE_ID_HEADER, MessageBroker, OutgoingMessage, QueueSpec, Topology, topic_matches,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Scripted outcome for the next publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFault {
    /// The publish fails before the broker accepts the message
    Error,
    /// The broker rejects the message; nothing is routed
    Nack,
    /// The message is routed but no confirmation arrives
    Timeout,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    /// `ack`
    Acked,
    /// `nack` with requeue
    Requeued,
    /// `nack` without requeue
    Rejected,
}

/// A recorded acknowledgment decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Queue the delivery came from
    pub queue: String,
    /// Message id property of the delivery
    pub message_id: Option<String>,
    /// What the consumer decided
    pub kind: SettlementKind,
}

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Exchange it was last routed through
    pub exchange: String,
    /// Routing key it was last routed with
    pub routing_key: String,
    /// Message id property
    pub message_id: Option<String>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
    /// Body bytes
    pub body: Vec<u8>,
    /// Whether it has been delivered before
    pub redelivered: bool,
    seq: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<BrokerMessage>,
}

struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<outpost_core::broker::BindingSpec>,
    published: Vec<OutgoingMessage>,
    settlements: Vec<Settlement>,
    publish_faults: VecDeque<PublishFault>,
    confirms: bool,
    connected: bool,
    consumer_epoch: u64,
    next_seq: u64,
}

enum Take {
    Message(BrokerMessage),
    Empty,
    Closed,
}

struct Inner {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(self: &Arc<Self>, message: &OutgoingMessage) -> Result<Confirmation, BrokerError> {
        let mut state = self.lock();
        let publish_error = |reason: String| BrokerError::Publish {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            reason,
        };

        if !state.connected {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        if !message.exchange.is_empty() && !state.exchanges.contains_key(&message.exchange) {
            return Err(publish_error(format!(
                "NOT_FOUND - no exchange '{}'",
                message.exchange
            )));
        }

        let fault = state.publish_faults.pop_front();
        match fault {
            Some(PublishFault::Error) => return Err(publish_error("channel closed".to_string())),
            Some(PublishFault::Nack) => return Ok(Confirmation::Nacked),
            Some(PublishFault::Timeout) | None => {},
        }

        state.published.push(message.clone());
        let stored = BrokerMessage {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            message_id: message.message_id.clone(),
            headers: message.headers.clone(),
            body: message.payload.clone(),
            redelivered: false,
            seq: 0,
        };
        self.route(&mut state, &message.exchange, &message.routing_key, stored);
        let confirms = state.confirms;
        drop(state);
        self.arrivals.notify_waiters();

        Ok(match fault {
            Some(_) => Confirmation::TimedOut,
            None if confirms => Confirmation::Acked,
            None => Confirmation::NotRequested,
        })
    }

    fn route(
        self: &Arc<Self>,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) {
        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
                return;
            };
            let mut targets = Vec::new();
            for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
                let hit = match kind {
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                };
                if hit && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "Unroutable message dropped");
        }
        for queue in targets {
            self.enqueue(state, &queue, message.clone());
        }
    }

    fn enqueue(self: &Arc<Self>, state: &mut BrokerState, queue: &str, mut message: BrokerMessage) {
        state.next_seq += 1;
        message.seq = state.next_seq;
        let seq = message.seq;
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };
        target.ready.push_back(message);

        if let Some(ttl) = target.spec.message_ttl {
            let inner = Arc::clone(self);
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire(&queue, seq);
            });
        }
    }

    fn expire(self: &Arc<Self>, queue: &str, seq: u64) {
        let mut state = self.lock();
        let Some(source) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = source.ready.iter().position(|m| m.seq == seq) else {
            return;
        };
        let Some(message) = source.ready.remove(position) else {
            return;
        };
        let spec = source.spec.clone();
        tracing::trace!(queue, "Message expired");
        self.dead_letter(&mut state, &spec, message);
        drop(state);
        self.arrivals.notify_waiters();
    }

    fn dead_letter(
        self: &Arc<Self>,
        state: &mut BrokerState,
        spec: &QueueSpec,
        mut message: BrokerMessage,
    ) {
        let Some(exchange) = spec.dead_letter_exchange.clone() else {
            tracing::debug!(queue = %spec.name, "Message discarded (no dead-letter exchange)");
            return;
        };
        let routing_key = spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());
        message.exchange.clone_from(&exchange);
        message.routing_key.clone_from(&routing_key);
        message.redelivered = false;
        self.route(state, &exchange, &routing_key, message);
    }

    fn take_next(&self, queue: &str, epoch: u64) -> Take {
        let mut state = self.lock();
        if !state.connected || state.consumer_epoch != epoch {
            return Take::Closed;
        }
        match state.queues.get_mut(queue) {
            None => Take::Closed,
            Some(source) => source.ready.pop_front().map_or(Take::Empty, Take::Message),
        }
    }

    fn settle(self: &Arc<Self>, queue: &str, mut message: BrokerMessage, kind: SettlementKind) {
        let mut state = self.lock();
        state.settlements.push(Settlement {
            queue: queue.to_string(),
            message_id: message.message_id.clone(),
            kind,
        });
        self.release(&mut state, queue, &mut message, kind);
        drop(state);
        self.arrivals.notify_waiters();
    }

    fn release(
        self: &Arc<Self>,
        state: &mut BrokerState,
        queue: &str,
        message: &mut BrokerMessage,
        kind: SettlementKind,
    ) {
        match kind {
            SettlementKind::Acked => {},
            SettlementKind::Requeued => {
                if let Some(source) = state.queues.get_mut(queue) {
                    message.redelivered = true;
                    source.ready.push_front(message.clone());
                }
            },
            SettlementKind::Rejected => {
                if let Some(spec) = state.queues.get(queue).map(|q| q.spec.clone()) {
                    self.dead_letter(state, &spec, message.clone());
                }
            },
        }
    }
}

/// In-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A connected broker with publisher confirms enabled and nothing declared.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    bindings: Vec::new(),
                    published: Vec::new(),
                    settlements: Vec::new(),
                    publish_faults: VecDeque::new(),
                    confirms: true,
                    connected: true,
                    consumer_epoch: 0,
                    next_seq: 0,
                }),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Queue a scripted outcome for an upcoming publish.
    pub fn push_publish_fault(&self, fault: PublishFault) {
        self.inner.lock().publish_faults.push_back(fault);
    }

    /// Make the next `count` publishes fail outright.
    pub fn fail_next_publishes(&self, count: usize) {
        let mut state = self.inner.lock();
        for _ in 0..count {
            state.publish_faults.push_back(PublishFault::Error);
        }
    }

    /// Turn publisher confirms on or off.
    pub fn set_confirms(&self, enabled: bool) {
        self.inner.lock().confirms = enabled;
    }

    /// Open or close the connection. Closing also ends every consumer stream.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.inner.lock();
        state.connected = connected;
        if !connected {
            state.consumer_epoch += 1;
        }
        drop(state);
        self.inner.arrivals.notify_waiters();
    }

    /// End every open delivery stream, as a dropped channel would.
    pub fn disconnect_consumers(&self) {
        self.inner.lock().consumer_epoch += 1;
        self.inner.arrivals.notify_waiters();
    }

    /// Every message the broker accepted, in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.inner.lock().published.clone()
    }

    /// Accepted messages addressed to `exchange`.
    #[must_use]
    pub fn published_to(&self, exchange: &str) -> Vec<OutgoingMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Every settlement, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.lock().settlements.clone()
    }

    /// Messages ready for delivery on `queue`.
    #[must_use]
    pub fn queue_messages(&self, queue: &str) -> Vec<BrokerMessage> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages ready for delivery on `queue`.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// The declaration of `queue`, if declared.
    #[must_use]
    pub fn declared_queue(&self, queue: &str) -> Option<QueueSpec> {
        self.inner.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Wait until at least `count` settlements have been recorded.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.settlements.len() >= count)
            .await
    }

    /// Wait until `queue` holds exactly `depth` ready messages.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_queue_depth(&self, queue: &str, depth: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state.queues.get(queue).map_or(0, |q| q.ready.len()) == depth
        })
        .await
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        condition: impl Fn(&BrokerState) -> bool,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let done = condition(&self.inner.lock());
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        if !state.connected {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }

        for exchange in &topology.exchanges {
            match state.exchanges.get(&exchange.name) {
                Some(existing) if existing != exchange => {
                    return Err(BrokerError::Topology(format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        exchange.name
                    )));
                },
                Some(_) => {},
                None => {
                    state.exchanges.insert(exchange.name.clone(), exchange.clone());
                },
            }
        }

        for queue in &topology.queues {
            match state.queues.get(&queue.name) {
                Some(existing) if existing.spec != *queue => {
                    return Err(BrokerError::Topology(format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        queue.name
                    )));
                },
                Some(_) => {},
                None => {
                    state.queues.insert(
                        queue.name.clone(),
                        QueueState {
                            spec: queue.clone(),
                            ready: VecDeque::new(),
                        },
                    );
                },
            }
        }

        for binding in &topology.bindings {
            if !state.exchanges.contains_key(&binding.exchange)
                || !state.queues.contains_key(&binding.queue)
            {
                return Err(BrokerError::Topology(format!(
                    "NOT_FOUND - cannot bind '{}' to '{}'",
                    binding.queue, binding.exchange
                )));
            }
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }
        Ok(())
    }

    fn open_stream(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let epoch = {
            let state = self.inner.lock();
            if !state.connected {
                return Err(BrokerError::Connection("connection closed".to_string()));
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: format!("NOT_FOUND - no queue '{queue}'"),
                });
            }
            state.consumer_epoch
        };
        tracing::debug!(queue, consumer_tag, prefetch, "Consumer attached");

        let limit = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            usize::from(prefetch)
        };
        let window = Arc::new(Semaphore::new(limit));
        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                let Ok(permit) = Arc::clone(&window).acquire_owned().await else {
                    break;
                };
                let next = loop {
                    let notified = inner.arrivals.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    match inner.take_next(&queue, epoch) {
                        Take::Message(message) => break Some(message),
                        Take::Closed => break None,
                        Take::Empty => notified.await,
                    }
                };
                let Some(message) = next else {
                    break;
                };
                let delivery: Box<dyn Delivery> = Box::new(InMemoryDelivery {
                    inner: Arc::clone(&inner),
                    queue: queue.clone(),
                    message,
                    permit: Mutex::new(Some(permit)),
                });
                yield Ok::<_, BrokerError>(delivery);
            }
        };
        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connected", &state.connected)
            .finish_non_exhaustive()
    }
}

impl MessageBroker for InMemoryBroker {
    fn publish(
        &self,
        message: &OutgoingMessage,
        _confirm_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Confirmation, BrokerError>> + Send + '_>> {
        Box::pin(ready(self.inner.publish(message)))
    }

    fn declare_topology(
        &self,
        topology: &Topology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(ready(self.declare(topology)))
    }

    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        Box::pin(ready(self.open_stream(queue, consumer_tag, prefetch)))
    }

    fn confirms_enabled(&self) -> bool {
        self.inner.lock().confirms
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

struct InMemoryDelivery {
    inner: Arc<Inner>,
    queue: String,
    message: BrokerMessage,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl InMemoryDelivery {
    fn take_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn settle(&self, kind: SettlementKind) -> Result<(), BrokerError> {
        let Some(permit) = self.take_permit() else {
            return Err(BrokerError::Acknowledgement(
                "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            ));
        };
        self.inner.settle(&self.queue, self.message.clone(), kind);
        drop(permit);
        Ok(())
    }
}

impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn message_id(&self) -> Option<&str> {
        self.message
            .message_id
            .as_deref()
            .or_else(|| self.message.headers.get(MESSAGE_ID_HEADER).map(String::as_str))
    }

    fn exchange(&self) -> &str {
        &self.message.exchange
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(ready(self.settle(SettlementKind::Acked)))
    }

    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let kind = if requeue {
            SettlementKind::Requeued
        } else {
            SettlementKind::Rejected
        };
        Box::pin(ready(self.settle(kind)))
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        // Unsettled at drop: the broker takes the message back.
        if let Some(permit) = self.take_permit() {
            let mut state = self.inner.lock();
            let mut message = self.message.clone();
            self.inner
                .release(&mut state, &self.queue, &mut message, SettlementKind::Requeued);
            drop(state);
            drop(permit);
            self.inner.arrivals.notify_waiters();
        }
    }
}
