// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Deliveries, Messages and Properties
//!
//! This module carries the data handed to consumers: `DeliveryInfo` is the
//! owned snapshot of one AMQP delivery, `Properties` mirrors the basic
//! message properties with field-wise merging, and `Message` pairs both with
//! the raw payload and the consumer's serializer, decoding the body on
//! demand.

use crate::errors::HandlerError;
use crate::serializer::{Body, Serializer};
use lapin::protocol::basic::AMQPProperties;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Delivery mode for messages that survive a broker restart
const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Delivery mode for transient messages
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Message properties, mirrored field-wise from the AMQP basic properties.
///
/// Every field is optional so that property sets can be layered: the
/// publisher builds its fixed merge order out of [`Properties::merge`],
/// where the override's populated fields win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, stringified on the wire
    pub expiration: Option<u64>,
    pub timestamp: Option<u64>,
    /// The AMQP `type` property
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: Option<bool>,
    pub headers: Option<BTreeMap<ShortString, AMQPValue>>,
}

impl Properties {
    /// Overlays `overrides` on top of `self`: populated override fields win,
    /// header maps are merged entry-wise with override entries winning.
    pub fn merge(mut self, overrides: &Properties) -> Properties {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field.clone();
                })*
            };
        }
        overlay!(
            content_type,
            message_id,
            correlation_id,
            reply_to,
            expiration,
            timestamp,
            kind,
            user_id,
            app_id,
            priority,
            persistent
        );

        if let Some(extra) = &overrides.headers {
            let headers = self.headers.get_or_insert_with(BTreeMap::new);
            for (key, value) in extra {
                headers.insert(key.clone(), value.clone());
            }
        }

        self
    }

    /// Builds the owned mirror of received AMQP properties.
    pub fn from_amqp(props: &AMQPProperties) -> Properties {
        Properties {
            content_type: props.content_type().as_ref().map(|v| v.to_string()),
            message_id: props.message_id().as_ref().map(|v| v.to_string()),
            correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
            reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
            expiration: props
                .expiration()
                .as_ref()
                .and_then(|v| v.as_str().parse().ok()),
            timestamp: *props.timestamp(),
            kind: props.kind().as_ref().map(|v| v.to_string()),
            user_id: props.user_id().as_ref().map(|v| v.to_string()),
            app_id: props.app_id().as_ref().map(|v| v.to_string()),
            priority: *props.priority(),
            persistent: props.delivery_mode().map(|m| m == DELIVERY_MODE_PERSISTENT),
            headers: props.headers().as_ref().map(|t| t.inner().clone()),
        }
    }

    /// Renders the properties for the wire.
    pub fn to_amqp(&self) -> BasicProperties {
        let mut props = BasicProperties::default();

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(message_id) = &self.message_id {
            props = props.with_message_id(ShortString::from(message_id.clone()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(expiration) = self.expiration {
            props = props.with_expiration(ShortString::from(expiration.to_string()));
        }
        if let Some(timestamp) = self.timestamp {
            props = props.with_timestamp(timestamp);
        }
        if let Some(kind) = &self.kind {
            props = props.with_kind(ShortString::from(kind.clone()));
        }
        if let Some(user_id) = &self.user_id {
            props = props.with_user_id(ShortString::from(user_id.clone()));
        }
        if let Some(app_id) = &self.app_id {
            props = props.with_app_id(ShortString::from(app_id.clone()));
        }
        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }
        if let Some(persistent) = self.persistent {
            props = props.with_delivery_mode(if persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            });
        }
        if let Some(headers) = &self.headers {
            props = props.with_headers(FieldTable::from(headers.clone()));
        }

        props
    }
}

/// Owned snapshot of one received delivery, detached from the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Name of the consumer the delivery was dispatched to
    pub consumer: String,
    /// Queue the delivery was consumed from
    pub queue: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Monotonic per-channel identifier assigned by the broker
    pub delivery_tag: u64,
    /// Whether the broker redelivered this message
    pub redelivered: bool,
}

/// One received message: delivery metadata, properties, raw payload and the
/// consumer's serializer. The body is decoded on demand; decode failure is a
/// handler-level error.
pub struct Message {
    info: DeliveryInfo,
    properties: Properties,
    payload: Vec<u8>,
    serializer: Arc<dyn Serializer>,
}

impl Message {
    pub fn new(
        info: DeliveryInfo,
        properties: Properties,
        payload: Vec<u8>,
        serializer: Arc<dyn Serializer>,
    ) -> Message {
        Message {
            info,
            properties,
            payload,
            serializer,
        }
    }

    /// The delivery metadata.
    pub fn delivery(&self) -> &DeliveryInfo {
        &self.info
    }

    /// The message properties as received.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the payload with the consumer's serializer.
    pub fn body(&self) -> Result<Body, HandlerError> {
        self.serializer.decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use lapin::types::LongString;
    use serde_json::json;

    #[test]
    fn merge_prefers_override_fields() {
        let base = Properties {
            persistent: Some(true),
            content_type: Some("application/json".to_owned()),
            app_id: Some("base".to_owned()),
            ..Properties::default()
        };
        let overrides = Properties {
            app_id: Some("override".to_owned()),
            message_id: Some("m-1".to_owned()),
            ..Properties::default()
        };

        let merged = base.merge(&overrides);
        assert_eq!(merged.app_id.as_deref(), Some("override"));
        assert_eq!(merged.message_id.as_deref(), Some("m-1"));
        assert_eq!(merged.persistent, Some(true));
        assert_eq!(merged.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn merge_combines_headers() {
        let mut base_headers = BTreeMap::new();
        base_headers.insert(
            ShortString::from("a"),
            AMQPValue::LongString(LongString::from("1")),
        );
        base_headers.insert(
            ShortString::from("b"),
            AMQPValue::LongString(LongString::from("2")),
        );
        let mut override_headers = BTreeMap::new();
        override_headers.insert(
            ShortString::from("b"),
            AMQPValue::LongString(LongString::from("3")),
        );

        let merged = Properties {
            headers: Some(base_headers),
            ..Properties::default()
        }
        .merge(&Properties {
            headers: Some(override_headers),
            ..Properties::default()
        });

        let headers = merged.headers.unwrap();
        assert_eq!(
            headers.get(&ShortString::from("a")),
            Some(&AMQPValue::LongString(LongString::from("1")))
        );
        assert_eq!(
            headers.get(&ShortString::from("b")),
            Some(&AMQPValue::LongString(LongString::from("3")))
        );
    }

    #[test]
    fn amqp_round_trip_preserves_fields() {
        let props = Properties {
            content_type: Some("application/json".to_owned()),
            message_id: Some("m-1".to_owned()),
            expiration: Some(500),
            timestamp: Some(1_700_000_000),
            persistent: Some(true),
            priority: Some(4),
            ..Properties::default()
        };

        let round_tripped = Properties::from_amqp(&props.to_amqp());
        assert_eq!(round_tripped, props);
    }

    #[test]
    fn message_body_decodes_with_serializer() {
        let message = Message::new(
            DeliveryInfo {
                consumer: "orders".to_owned(),
                queue: "orders".to_owned(),
                exchange: "warren".to_owned(),
                routing_key: "a.b".to_owned(),
                delivery_tag: 1,
                redelivered: false,
            },
            Properties::default(),
            br#"{"x":1}"#.to_vec(),
            Arc::new(JsonSerializer),
        );

        assert_eq!(message.body().unwrap(), Body::Json(json!({"x": 1})));
    }

    #[test]
    fn message_body_decode_failure_is_handler_error() {
        let message = Message::new(
            DeliveryInfo {
                consumer: "orders".to_owned(),
                queue: "orders".to_owned(),
                exchange: "warren".to_owned(),
                routing_key: "a.b".to_owned(),
                delivery_tag: 1,
                redelivered: false,
            },
            Properties::default(),
            b"not json".to_vec(),
            Arc::new(JsonSerializer),
        );

        assert!(matches!(
            message.body().unwrap_err(),
            HandlerError::Decode(_)
        ));
    }
}
