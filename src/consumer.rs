// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Consumer Descriptors and Handlers
//!
//! A consumer is registered once, before the worker runs, as an immutable
//! descriptor: the queue it consumes from, the routing-key patterns bound to
//! the main exchange, an optional serializer override, queue-declaration
//! arguments, an optional group tag, and a factory closure producing a fresh
//! handler instance per delivery. The factory is where applications pre-fill
//! handler state — a publisher handle, database pools — captured at
//! registration time.

use crate::errors::HandlerError;
use crate::message::Message;
use crate::serializer::Serializer;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use async_trait::async_trait;
use std::sync::Arc;

/// Processes one received message.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Produces a fresh handler instance for each delivery.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Immutable descriptor for one registered consumer.
#[derive(Clone)]
pub struct ConsumerDef {
    pub(crate) name: String,
    pub(crate) queue: String,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) serializer: Option<Arc<dyn Serializer>>,
    pub(crate) queue_arguments: FieldTable,
    pub(crate) group: Option<String>,
    pub(crate) factory: HandlerFactory,
}

impl ConsumerDef {
    /// Creates a descriptor for a consumer on the given queue.
    ///
    /// The name identifies the consumer in logs and in consumer-group
    /// membership lists; the factory is invoked once per delivery.
    pub fn new(name: &str, queue: &str, factory: HandlerFactory) -> ConsumerDef {
        ConsumerDef {
            name: name.to_owned(),
            queue: queue.to_owned(),
            routing_keys: vec![],
            serializer: None,
            queue_arguments: FieldTable::default(),
            group: None,
            factory,
        }
    }

    /// Adds a routing-key pattern (AMQP topic syntax) bound to the main
    /// exchange for this consumer's queue.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Replaces the routing-key patterns wholesale.
    pub fn routing_keys(mut self, keys: Vec<String>) -> Self {
        self.routing_keys = keys;
        self
    }

    /// Overrides the serializer used to decode this consumer's payloads.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Adds a queue-declaration argument, passed through verbatim (quorum
    /// queues, per-queue DLX, TTL…).
    pub fn queue_argument(mut self, key: &str, value: AMQPValue) -> Self {
        let mut inner = self.queue_arguments.inner().clone();
        inner.insert(ShortString::from(key), value);
        self.queue_arguments = FieldTable::from(inner);
        self
    }

    /// Tags this consumer as a member of a consumer group.
    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Builder for the process-wide consumer list, finished into an immutable
/// descriptor slice before the worker runs.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: Vec<ConsumerDef>,
}

impl ConsumerRegistry {
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry::default()
    }

    /// Registers a consumer descriptor.
    pub fn register(mut self, consumer: ConsumerDef) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Finishes registration, yielding the immutable descriptor list.
    pub fn finish(self) -> Vec<ConsumerDef> {
        self.consumers
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
