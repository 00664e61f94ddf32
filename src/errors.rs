// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Error Types for the Worker Framework
//!
//! This module provides the error taxonomy for the framework. The
//! `WorkerError` enum covers configuration, connection, declaration,
//! publishing and acknowledgement failures; `HandlerError` is the separate
//! type for failures raised by user handlers, which are contained by the
//! worker and never propagate out of the dispatch loop.

use thiserror::Error;

/// Represents errors that can occur during broker operations.
///
/// Only `Configuration` and an unrecoverable `Connection` are allowed to
/// terminate the process; every other variant is contained and reported at
/// its call-site.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkerError {
    /// Invalid or incomplete configuration, fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    Connection,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    Channel,

    /// A queue or exchange was re-declared with incompatible arguments (AMQP 406)
    #[error("incompatible declaration for `{name}`: {detail}")]
    Precondition { name: String, detail: String },

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchange(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueue(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueue(String, String),

    /// Error unbinding a queue from an exchange
    #[error("failure to unbind queue `{0}` from exchange `{1}`")]
    UnbindQueue(String, String),

    /// Error subscribing a consumer to a queue
    #[error("failure to start consumer `{0}`")]
    Subscribe(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    Publish(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    Ack,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    Nack,

    /// Error rejecting a message
    #[error("failure to reject message")]
    Reject,

    /// Error talking to the HTTP management API
    #[error("management api error: {0}")]
    Management(String),
}

impl WorkerError {
    /// Maps an adapter error onto the taxonomy, recognising AMQP 406
    /// precondition-failed close frames so callers surface them with
    /// diagnostic context instead of retrying.
    pub(crate) fn from_declare(name: &str, err: lapin::Error, fallback: WorkerError) -> Self {
        if let lapin::Error::ProtocolError(ref amqp) = err {
            if amqp.get_id() == 406 {
                return WorkerError::Precondition {
                    name: name.to_owned(),
                    detail: amqp.get_message().to_string(),
                };
            }
        }
        fallback
    }
}

/// Represents a failure raised while handling a single delivery.
///
/// Handler errors trigger the error-acknowledgement chain and the reporter
/// fan-out; they are never allowed to lose the message or escape the worker.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload could not be decoded with the consumer's serializer
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// The handler refused the message
    #[error("{0}")]
    Failed(String),

    /// Any other failure raised by user code
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

impl HandlerError {
    /// Shorthand for refusing a message with a plain description.
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}
