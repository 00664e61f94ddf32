// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages to the main topic exchange with a fixed property-merge
//! order, optional publisher confirms, and OpenTelemetry context propagation
//! in the headers. `publish_wait` targets the wait exchange matching the
//! message expiration instead, which delays delivery by the expiration TTL
//! through the broker's dead-letter mechanics.

use crate::channel::ChannelBroker;
use crate::config::Config;
use crate::errors::WorkerError;
use crate::message::Properties;
use crate::otel;
use crate::serializer::{Body, Serializer};
use lapin::options::BasicPublishOptions;
use lapin::Connection;
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Per-call publishing options.
#[derive(Default, Clone)]
pub struct PublishOptions {
    /// Overrides the configured default serializer for this call
    pub serializer: Option<Arc<dyn Serializer>>,
}

enum Target {
    Main,
    Wait,
}

/// Publishes messages on its own channel; safe to call from any task.
pub struct Publisher {
    connection: Arc<Connection>,
    config: Arc<Config>,
    channel: Mutex<ChannelBroker>,
}

impl Publisher {
    pub(crate) fn new(connection: Arc<Connection>, config: Arc<Config>) -> Publisher {
        let channel = ChannelBroker::new(connection.clone(), config.clone());
        Publisher {
            connection,
            config,
            channel: Mutex::new(channel),
        }
    }

    /// Publishes a message to the main exchange.
    pub async fn publish(
        &self,
        routing_key: &str,
        body: &Body,
        properties: Properties,
        options: PublishOptions,
    ) -> Result<(), WorkerError> {
        self.publish_to(Target::Main, routing_key, body, properties, options)
            .await
    }

    /// Serializes a value as JSON and publishes it to the main exchange.
    pub async fn publish_json<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
        properties: Properties,
    ) -> Result<(), WorkerError> {
        let value =
            serde_json::to_value(payload).map_err(|err| WorkerError::Publish(err.to_string()))?;
        self.publish(
            routing_key,
            &Body::Json(value),
            properties,
            PublishOptions::default(),
        )
        .await
    }

    /// Publishes a message for delayed delivery: the target is the wait
    /// exchange matching the stringified `expiration` property (declared on
    /// demand), or the default fanout wait exchange when no expiration is
    /// set. The message re-enters the main exchange with its original
    /// routing key once the TTL elapses.
    pub async fn publish_wait(
        &self,
        routing_key: &str,
        body: &Body,
        properties: Properties,
        options: PublishOptions,
    ) -> Result<(), WorkerError> {
        self.publish_to(Target::Wait, routing_key, body, properties, options)
            .await
    }

    async fn publish_to(
        &self,
        target: Target,
        routing_key: &str,
        body: &Body,
        properties: Properties,
        options: PublishOptions,
    ) -> Result<(), WorkerError> {
        if !self.connection.status().connected() {
            return Err(WorkerError::Publish(
                "publish attempted without an open connection".to_owned(),
            ));
        }

        let serializer = options
            .serializer
            .unwrap_or_else(|| self.config.serializers.default_serializer());
        let payload = serializer.encode(body)?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let mut merged = merged_properties(&self.config, serializer.as_ref(), properties, timestamp);
        otel::inject_context(&Context::current(), &mut merged);

        let mut holder = self.channel.lock().await;
        let exchange = match target {
            Target::Main => self.config.exchange.clone(),
            Target::Wait => holder.wait_exchange_for(merged.expiration).await?,
        };
        let channel = holder.channel().await?;
        // The lock guards channel state only; the publish and confirm ride
        // the owned channel so concurrent publishers are not serialised.
        drop(holder);

        debug!(exchange, routing_key, "publishing message");
        let confirm = match channel
            .basic_publish(
                &exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                merged.to_amqp(),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(WorkerError::Publish(err.to_string()));
            }
        };

        if self.config.force_publisher_confirms {
            match tokio::time::timeout(self.config.confirm_timeout, confirm).await {
                Err(_) => {
                    return Err(WorkerError::Publish(
                        "publisher confirm timed out".to_owned(),
                    ))
                }
                Ok(Err(err)) => return Err(WorkerError::Publish(err.to_string())),
                Ok(Ok(confirmation)) => {
                    if let lapin::publisher_confirm::Confirmation::Nack(_) = confirmation {
                        return Err(WorkerError::Publish(
                            "broker negatively confirmed the publish".to_owned(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Applies the fixed merge order: `{persistent: true}` → caller properties →
/// process-wide global properties → non-overridable timestamp and content
/// type from the serializer. `message_id` defaults to a fresh UUIDv4.
fn merged_properties(
    config: &Config,
    serializer: &dyn Serializer,
    caller: Properties,
    timestamp: u64,
) -> Properties {
    let base = Properties {
        persistent: Some(true),
        ..Properties::default()
    };
    let fixed = Properties {
        timestamp: Some(timestamp),
        content_type: Some(serializer.content_type().to_owned()),
        ..Properties::default()
    };

    let mut merged = base
        .merge(&caller)
        .merge(&config.global_properties.resolve())
        .merge(&fixed);

    if merged.message_id.is_none() {
        merged.message_id = Some(Uuid::new_v4().to_string());
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalProperties;
    use crate::serializer::JsonSerializer;

    #[test]
    fn persistent_defaults_on_and_caller_may_override() {
        let config = Config::new();
        let merged = merged_properties(&config, &JsonSerializer, Properties::default(), 10);
        assert_eq!(merged.persistent, Some(true));

        let transient = merged_properties(
            &config,
            &JsonSerializer,
            Properties {
                persistent: Some(false),
                ..Properties::default()
            },
            10,
        );
        assert_eq!(transient.persistent, Some(false));
    }

    #[test]
    fn global_properties_override_caller_properties() {
        let config = Config::new().global_properties(GlobalProperties::Static(Properties {
            app_id: Some("global".to_owned()),
            ..Properties::default()
        }));

        let merged = merged_properties(
            &config,
            &JsonSerializer,
            Properties {
                app_id: Some("caller".to_owned()),
                ..Properties::default()
            },
            10,
        );
        assert_eq!(merged.app_id.as_deref(), Some("global"));
    }

    #[test]
    fn dynamic_global_properties_resolve_per_call() {
        let config = Config::new().global_properties(GlobalProperties::Dynamic(Arc::new(|| {
            Properties {
                app_id: Some("dynamic".to_owned()),
                ..Properties::default()
            }
        })));

        let merged = merged_properties(&config, &JsonSerializer, Properties::default(), 10);
        assert_eq!(merged.app_id.as_deref(), Some("dynamic"));
    }

    #[test]
    fn timestamp_and_content_type_are_not_overridable() {
        let config = Config::new();
        let merged = merged_properties(
            &config,
            &JsonSerializer,
            Properties {
                timestamp: Some(1),
                content_type: Some("text/plain".to_owned()),
                ..Properties::default()
            },
            42,
        );
        assert_eq!(merged.timestamp, Some(42));
        assert_eq!(merged.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn message_id_defaults_to_a_fresh_uuid() {
        let config = Config::new();
        let merged = merged_properties(&config, &JsonSerializer, Properties::default(), 10);
        let id = merged.message_id.expect("message id");
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);

        let explicit = merged_properties(
            &config,
            &JsonSerializer,
            Properties {
                message_id: Some("m-1".to_owned()),
                ..Properties::default()
            },
            10,
        );
        assert_eq!(explicit.message_id.as_deref(), Some("m-1"));
    }
}
