// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Error Reporters
//!
//! Reporters are consulted for logging and telemetry only: every reporter
//! receives every handler failure, a failing reporter is contained, and the
//! fan-out runs after the nack action has already been enqueued, so no
//! reporter can affect whether a message is acknowledged.

use crate::errors::{HandlerError, WorkerError};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// Receives handler failures for logging or forwarding to an external
/// error tracker.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(
        &self,
        message: &Message,
        consumer: &str,
        error: &HandlerError,
    ) -> Result<(), WorkerError>;
}

/// Reporter that writes failures to the structured log.
pub struct LogReporter;

#[async_trait]
impl ErrorReporter for LogReporter {
    async fn report(
        &self,
        message: &Message,
        consumer: &str,
        error: &HandlerError,
    ) -> Result<(), WorkerError> {
        error!(
            consumer,
            queue = message.delivery().queue,
            routing_key = message.delivery().routing_key,
            delivery_tag = message.delivery().delivery_tag,
            redelivered = message.delivery().redelivered,
            error = error.to_string(),
            "message handler failed"
        );
        Ok(())
    }
}

/// Fans a failure out to every reporter, containing individual reporter
/// failures.
pub(crate) async fn fan_out(
    reporters: &[Arc<dyn ErrorReporter>],
    message: &Message,
    consumer: &str,
    error: &HandlerError,
) {
    for reporter in reporters {
        if let Err(report_err) = reporter.report(message, consumer, error).await {
            error!(
                consumer,
                error = report_err.to_string(),
                "error reporter failed"
            );
        }
    }
}
