// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Warren
//!
//! A long-running worker framework for RabbitMQ. Consumers are registered as
//! descriptors (queue, routing keys, handler factory), the [`worker::Worker`]
//! binds them to namespaced queues on an AMQP topic exchange and dispatches
//! deliveries to fresh handler instances on a bounded work pool. Every
//! acknowledgement is serialised through the [`waiter::Waiter`], the single
//! loop that also observes process signals, so ack traffic and shutdown share
//! one decision point.
//!
//! Delayed delivery is built on broker-native primitives: messages published
//! through [`publisher::Publisher::publish_wait`] sit in a wait queue whose
//! declaration carries `x-dead-letter-exchange`, and re-enter the main
//! exchange with their original routing key once their per-message TTL
//! expires.

mod otel;

pub mod ack;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod management;
pub mod message;
pub mod publisher;
pub mod reporter;
pub mod serializer;
pub mod tracer;
pub mod waiter;
pub mod worker;
