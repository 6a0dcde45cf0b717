//! Message broker abstraction.
//!
//! The [`MessageBroker`] trait is the seam between the engines in
//! `outpost-runtime` and a concrete transport (AMQP via `outpost-amqp`, or the
//! in-memory broker from `outpost-testing`). It models the subset of AMQP 0-9-1
//! the delivery pipeline relies on:
//!
//! - durable topic exchanges and queues, declared idempotently from a [`Topology`]
//! - persistent publishing with optional publisher confirmation
//! - manual-acknowledgment consumption bounded by a prefetch limit
//! - per-queue message TTL and dead-letter routing
//!
//! # Delayed retry topology
//!
//! ```text
//! publish ─► [tickets] ─► (ticket_events_queue) ─► consumer
//!               ▲                                     ├─ transient ─► [tickets.retry] ─► (ticket_events_queue.retry)
//!               │                                     │                                          │
//!               └───────── TTL expiry, original key ──┼──────────────────────────────────────────┘
//!                                                     └─ permanent ─► [tickets.dead] ─► (ticket_events_queue.dead)
//! ```

use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the broker transport (the `TransientBrokerError` class).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not establish or lost the connection
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Channel-level failure
    #[error("Broker channel error: {0}")]
    Channel(String),

    /// Exchange, queue or binding declaration failed
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// Publishing failed before the broker accepted the message
    #[error("Publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    Publish {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// Underlying reason
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed
    #[error("Delivery acknowledgement failed: {0}")]
    Acknowledgement(String),

    /// Starting or running a consumer failed
    #[error("Consume from '{queue}' failed: {reason}")]
    Consume {
        /// Queue being consumed
        queue: String,
        /// Underlying reason
        reason: String,
    },
}

/// Header carrying the message id when the transport property is unset.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Target exchange (`""` addresses the default exchange)
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message id property
    pub message_id: Option<String>,
    /// Encoded body
    pub payload: Vec<u8>,
    /// Content type property
    pub content_type: String,
    /// Ask the broker to store the message on disk
    pub persistent: bool,
    /// Application headers
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// A persistent JSON message.
    #[must_use]
    pub fn json(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message_id: None,
            payload,
            content_type: "application/json".to_string(),
            persistent: true,
            headers: BTreeMap::new(),
        }
    }

    /// Set the message id property.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Add an application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// What the broker said about a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker confirmed the message
    Acked,
    /// The broker explicitly rejected the message
    Nacked,
    /// No confirmation arrived within the wait bound
    TimedOut,
    /// Confirm mode is off; the message was sent fire-and-forget
    NotRequested,
}

/// A message received from a queue, awaiting acknowledgment.
///
/// Exactly one of [`ack`](Self::ack) or [`nack`](Self::nack) should be called.
/// A delivery that is dropped unsettled stays unacknowledged on the broker and
/// is redelivered once the consumer's channel closes.
pub trait Delivery: Send + Sync {
    /// Raw body bytes.
    fn body(&self) -> &[u8];

    /// Message id from the transport property, or the `message-id` header.
    fn message_id(&self) -> Option<&str>;

    /// Exchange the message was published to.
    fn exchange(&self) -> &str;

    /// Routing key the message was published with.
    fn routing_key(&self) -> &str;

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledge: remove the message from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the channel rejects the ack.
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Negative-acknowledge. With `requeue` the broker puts the message back on
    /// the queue; without it the message is dropped or dead-lettered by the
    /// queue's own arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the channel rejects the nack.
    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// Stream of deliveries from one queue.
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<Box<dyn Delivery>, BrokerError>> + Send>>;

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Dot-separated routing keys with `*` and `#` wildcards
    Topic,
    /// Exact routing key match
    Direct,
    /// Every bound queue
    Fanout,
}

/// An exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Routing semantics
    pub kind: ExchangeKind,
    /// Survive broker restarts
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// A queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survive broker restarts
    pub durable: bool,
    /// Messages expire after this long (`x-message-ttl`)
    pub message_ttl: Option<Duration>,
    /// Expired or rejected messages go here (`x-dead-letter-exchange`)
    pub dead_letter_exchange: Option<String>,
    /// Override routing key for dead-lettered messages (`x-dead-letter-routing-key`)
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// A durable queue with no arguments.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Expire messages after `ttl`.
    #[must_use]
    pub const fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Dead-letter expired and rejected messages to `exchange`.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Dead-letter with a fixed routing key instead of the original one.
    #[must_use]
    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Binding key (may contain wildcards on topic exchanges)
    pub routing_key: String,
}

/// A set of declarations applied together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Exchanges, declared first
    pub exchanges: Vec<ExchangeSpec>,
    /// Queues, declared second
    pub queues: Vec<QueueSpec>,
    /// Bindings, declared last
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// An empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange.
    #[must_use]
    pub fn exchange(mut self, exchange: ExchangeSpec) -> Self {
        if !self.exchanges.iter().any(|e| e.name == exchange.name) {
            self.exchanges.push(exchange);
        }
        self
    }

    /// Add a queue.
    #[must_use]
    pub fn queue(mut self, queue: QueueSpec) -> Self {
        if !self.queues.iter().any(|q| q.name == queue.name) {
            self.queues.push(queue);
        }
        self
    }

    /// Bind `queue` to `exchange` with `routing_key`.
    #[must_use]
    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        let binding = BindingSpec {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Append every declaration of `other`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let mut merged = self;
        for exchange in other.exchanges {
            merged = merged.exchange(exchange);
        }
        for queue in other.queues {
            merged = merged.queue(queue);
        }
        for binding in other.bindings {
            merged = merged.bind(binding.queue, binding.exchange, binding.routing_key);
        }
        merged
    }
}

/// A consumed queue together with its delayed-retry and parking-lot companions.
///
/// For exchange `tickets` and queue `ticket_events_queue`:
///
/// | role | exchange | queue |
/// |------|----------|-------|
/// | main | `tickets` | `ticket_events_queue` |
/// | retry | `tickets.retry` | `ticket_events_queue.retry` (TTL, dead-letters to `tickets`) |
/// | parking lot | `tickets.dead` | `ticket_events_queue.dead` |
///
/// The retry queue has no consumers. Its only egress is expiry, which
/// dead-letters the message back to the main exchange under its original
/// routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    /// Main exchange
    pub exchange: String,
    /// Consumed queue
    pub queue: String,
    /// Keys the consumed queue is bound with
    pub routing_keys: Vec<String>,
    /// Exchange transient failures are republished to
    pub retry_exchange: String,
    /// Queue holding messages until their retry delay expires
    pub retry_queue: String,
    /// Exchange permanent failures are republished to
    pub dead_exchange: String,
    /// Queue parking permanent failures for inspection
    pub dead_queue: String,
    /// How long a message waits before it is redelivered
    pub retry_delay: Duration,
}

impl RetryTopology {
    /// Derive the companion names for `queue` bound to `exchange`.
    #[must_use]
    pub fn for_queue(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_keys: &[&str],
        retry_delay: Duration,
    ) -> Self {
        let exchange = exchange.into();
        let queue = queue.into();
        Self {
            retry_exchange: format!("{exchange}.retry"),
            retry_queue: format!("{queue}.retry"),
            dead_exchange: format!("{exchange}.dead"),
            dead_queue: format!("{queue}.dead"),
            routing_keys: routing_keys.iter().map(|k| (*k).to_string()).collect(),
            exchange,
            queue,
            retry_delay,
        }
    }

    /// All declarations needed before consuming.
    #[must_use]
    pub fn topology(&self) -> Topology {
        let mut topology = Topology::new()
            .exchange(ExchangeSpec::topic(&self.exchange))
            .exchange(ExchangeSpec::topic(&self.retry_exchange))
            .exchange(ExchangeSpec::topic(&self.dead_exchange))
            .queue(QueueSpec::durable(&self.queue))
            .queue(
                QueueSpec::durable(&self.retry_queue)
                    .with_message_ttl(self.retry_delay)
                    .with_dead_letter_exchange(&self.exchange),
            )
            .queue(QueueSpec::durable(&self.dead_queue))
            .bind(&self.dead_queue, &self.dead_exchange, "#");

        for key in &self.routing_keys {
            topology = topology
                .bind(&self.queue, &self.exchange, key)
                .bind(&self.retry_queue, &self.retry_exchange, key);
        }
        topology
    }
}

/// Transport operations the delivery pipeline needs.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so the publisher, poller and consumer can share one `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Publish a message, waiting up to `confirm_timeout` for a confirmation
    /// when confirm mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publish`] or [`BrokerError::Connection`] if the
    /// message could not be handed to the broker. A negative confirmation is
    /// not an error at this level; it is reported as [`Confirmation::Nacked`].
    fn publish(
        &self,
        message: &OutgoingMessage,
        confirm_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Confirmation, BrokerError>> + Send + '_>>;

    /// Declare exchanges, queues and bindings. Declaring what already exists
    /// with identical arguments is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if a declaration conflicts with an
    /// existing one or refers to something undeclared.
    fn declare_topology(
        &self,
        topology: &Topology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Start consuming `queue` with manual acknowledgment and at most
    /// `prefetch` unacknowledged deliveries in flight.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consume`] if the queue cannot be consumed.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;

    /// Whether publisher confirmation is active.
    fn confirms_enabled(&self) -> bool;

    /// Whether the underlying connection is open.
    fn is_connected(&self) -> bool;
}

/// Match an AMQP topic binding key against a routing key.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn retry_topology_derives_companion_names() {
        let retry = RetryTopology::for_queue(
            "tickets",
            "ticket_events_queue",
            &["ticket.created.pending"],
            Duration::from_secs(5),
        );

        assert_eq!(retry.retry_exchange, "tickets.retry");
        assert_eq!(retry.retry_queue, "ticket_events_queue.retry");
        assert_eq!(retry.dead_exchange, "tickets.dead");
        assert_eq!(retry.dead_queue, "ticket_events_queue.dead");
    }

    #[test]
    fn retry_queue_expires_back_to_main_exchange() {
        let topology = RetryTopology::for_queue(
            "tickets",
            "ticket_events_queue",
            &["ticket.created.pending"],
            Duration::from_secs(5),
        )
        .topology();

        let retry_queue = topology
            .queues
            .iter()
            .find(|q| q.name == "ticket_events_queue.retry")
            .cloned();
        assert_eq!(
            retry_queue,
            Some(
                QueueSpec::durable("ticket_events_queue.retry")
                    .with_message_ttl(Duration::from_secs(5))
                    .with_dead_letter_exchange("tickets")
            )
        );

        let main_queue = topology.queues.iter().find(|q| q.name == "ticket_events_queue");
        assert_eq!(main_queue.and_then(|q| q.dead_letter_exchange.clone()), None);

        assert!(topology.bindings.contains(&BindingSpec {
            queue: "ticket_events_queue".to_string(),
            exchange: "tickets".to_string(),
            routing_key: "ticket.created.pending".to_string(),
        }));
        assert!(topology.bindings.contains(&BindingSpec {
            queue: "ticket_events_queue.dead".to_string(),
            exchange: "tickets.dead".to_string(),
            routing_key: "#".to_string(),
        }));
    }

    #[test]
    fn topology_merge_deduplicates() {
        let a = Topology::new()
            .exchange(ExchangeSpec::topic("events"))
            .queue(QueueSpec::durable("q"))
            .bind("q", "events", "event.*");
        let merged = a.clone().merge(a);

        assert_eq!(merged.exchanges.len(), 1);
        assert_eq!(merged.queues.len(), 1);
        assert_eq!(merged.bindings.len(), 1);
    }

    #[test]
    fn outgoing_json_message_is_persistent() {
        let message = OutgoingMessage::json("events", "event.created", b"{}".to_vec())
            .with_message_id("m-1")
            .with_header(MESSAGE_ID_HEADER, "m-1");

        assert!(message.persistent);
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.message_id.as_deref(), Some("m-1"));
        assert_eq!(message.headers.get("message-id").map(String::as_str), Some("m-1"));
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("event.created", "event.created"));
        assert!(!topic_matches("event.created", "event.created.pending"));
        assert!(topic_matches("event.*", "event.created"));
        assert!(!topic_matches("event.*", "event.created.pending"));
        assert!(topic_matches("event.#", "event.created.pending"));
        assert!(topic_matches("event.#", "event"));
        assert!(topic_matches("#", "ticket.created.pending"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("*.created.*", "ticket.created.pending"));
        assert!(!topic_matches("*.created", "created"));
        assert!(topic_matches("#.pending", "ticket.created.pending"));
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #[test]
        fn exact_key_matches_itself(words in prop::collection::vec(word(), 1..5)) {
            let key = words.join(".");
            prop_assert!(topic_matches(&key, &key));
        }

        #[test]
        fn hash_matches_everything(words in prop::collection::vec(word(), 0..5)) {
            let key = words.join(".");
            prop_assert!(topic_matches("#", &key));
        }

        #[test]
        fn star_matches_only_single_words(words in prop::collection::vec(word(), 1..5)) {
            let key = words.join(".");
            prop_assert_eq!(topic_matches("*", &key), words.len() == 1);
        }

        #[test]
        fn prefix_hash_matches_any_suffix(
            prefix in word(),
            rest in prop::collection::vec(word(), 0..4),
        ) {
            let mut words = vec![prefix.clone()];
            words.extend(rest);
            let key = words.join(".");
            let pattern = format!("{prefix}.#");
            prop_assert!(topic_matches(&pattern, &key));
        }
    }
}
