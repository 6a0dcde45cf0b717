//! Mapping between Outpost's broker types and lapin's wire types.

use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use outpost_core::broker::{ExchangeKind, OutgoingMessage, QueueSpec};

/// Delivery mode for messages the broker writes to disk.
const PERSISTENT: u8 = 2;

pub(crate) fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// `x-message-ttl`, `x-dead-letter-exchange` and `x-dead-letter-routing-key`.
pub(crate) fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(ttl) = queue.message_ttl {
        let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
        arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(millis));
    }
    if let Some(exchange) = &queue.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &queue.dead_letter_routing_key {
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    arguments
}

pub(crate) fn properties(message: &OutgoingMessage) -> BasicProperties {
    let content_type = ShortString::from(message.content_type.as_str());
    let mut properties = BasicProperties::default().with_content_type(content_type);
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(ShortString::from(id.as_str()));
    }
    if !message.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &message.headers {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        properties = properties.with_headers(headers);
    }
    properties
}

/// A string-valued header, if present.
pub(crate) fn header(properties: &BasicProperties, key: &str) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(&ShortString::from(key))? {
        AMQPValue::LongString(value) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        },
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::broker::MESSAGE_ID_HEADER;
    use std::time::Duration;

    #[test]
    fn retry_queue_arguments() {
        let queue = QueueSpec::durable("q.retry")
            .with_message_ttl(Duration::from_secs(5))
            .with_dead_letter_exchange("tickets");
        let arguments = queue_arguments(&queue);
        let get = |key: &str| arguments.inner().get(&ShortString::from(key)).cloned();

        assert_eq!(get("x-message-ttl"), Some(AMQPValue::LongUInt(5000)));
        assert_eq!(
            get("x-dead-letter-exchange"),
            Some(AMQPValue::LongString(LongString::from("tickets")))
        );
        assert!(get("x-dead-letter-routing-key").is_none());
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(queue_arguments(&QueueSpec::durable("q")).inner().is_empty());
    }

    #[test]
    fn properties_carry_id_mode_and_headers() {
        let message = OutgoingMessage::json("events", "event.created", b"{}".to_vec())
            .with_message_id("m-1")
            .with_header(MESSAGE_ID_HEADER, "m-1");
        let properties = properties(&message);

        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(
            properties.message_id().as_ref().map(ShortString::as_str),
            Some("m-1")
        );
        assert_eq!(
            properties.content_type().as_ref().map(ShortString::as_str),
            Some("application/json")
        );
        assert_eq!(header(&properties, MESSAGE_ID_HEADER).as_deref(), Some("m-1"));
        assert_eq!(header(&properties, "absent"), None);
    }

    #[test]
    fn exchange_kinds_map_one_to_one() {
        assert!(matches!(exchange_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic));
        assert!(matches!(exchange_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct));
        assert!(matches!(exchange_kind(ExchangeKind::Fanout), lapin::ExchangeKind::Fanout));
    }
}
