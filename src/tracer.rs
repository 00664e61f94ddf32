// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Handler Middleware
//!
//! A tracer is a handler decorator: it takes a boxed handler and returns a
//! boxed handler. Tracers are composed left-to-right at subscription time,
//! so the first registered tracer observes the call outermost.

use crate::consumer::Handler;
use crate::errors::HandlerError;
use crate::message::Message;
use crate::otel;
use async_trait::async_trait;
use opentelemetry::global;
use opentelemetry::trace::{Span, Status};
use std::borrow::Cow;
use std::sync::Arc;

/// Wraps a handler with cross-cutting behaviour.
pub trait Tracer: Send + Sync {
    fn wrap(&self, consumer: &str, handler: Box<dyn Handler>) -> Box<dyn Handler>;
}

/// Composes the tracer chain around a handler, left-to-right.
pub(crate) fn compose(
    tracers: &[Arc<dyn Tracer>],
    consumer: &str,
    handler: Box<dyn Handler>,
) -> Box<dyn Handler> {
    tracers
        .iter()
        .rev()
        .fold(handler, |inner, tracer| tracer.wrap(consumer, inner))
}

/// Passthrough tracer.
pub struct NullTracer;

impl Tracer for NullTracer {
    fn wrap(&self, _consumer: &str, handler: Box<dyn Handler>) -> Box<dyn Handler> {
        handler
    }
}

/// Tracer that opens an OpenTelemetry consumer span per delivery, parented
/// on the context propagated through the message headers, and records the
/// handler outcome on it.
pub struct OpenTelemetryTracer;

impl Tracer for OpenTelemetryTracer {
    fn wrap(&self, consumer: &str, handler: Box<dyn Handler>) -> Box<dyn Handler> {
        Box::new(TracedHandler {
            consumer: consumer.to_owned(),
            inner: handler,
        })
    }
}

struct TracedHandler {
    consumer: String,
    inner: Box<dyn Handler>,
}

#[async_trait]
impl Handler for TracedHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let tracer = global::tracer("warren.consumer");
        let (_ctx, mut span) = otel::consumer_span(message.properties(), &tracer, &self.consumer);

        let result = self.inner.handle(message).await;
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryInfo, Properties};
    use crate::serializer::JsonSerializer;
    use std::sync::Mutex;

    struct Labelling {
        label: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Tracer for Labelling {
        fn wrap(&self, _consumer: &str, handler: Box<dyn Handler>) -> Box<dyn Handler> {
            Box::new(LabelledHandler {
                label: self.label,
                trace: self.trace.clone(),
                inner: handler,
            })
        }
    }

    struct LabelledHandler {
        label: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
        inner: Box<dyn Handler>,
    }

    #[async_trait]
    impl Handler for LabelledHandler {
        async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
            self.trace.lock().unwrap().push(self.label);
            self.inner.handle(message).await
        }
    }

    struct Terminal {
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for Terminal {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            self.trace.lock().unwrap().push("handler");
            Ok(())
        }
    }

    fn message() -> Message {
        Message::new(
            DeliveryInfo {
                consumer: "orders".to_owned(),
                queue: "orders".to_owned(),
                exchange: "warren".to_owned(),
                routing_key: "a.b".to_owned(),
                delivery_tag: 1,
                redelivered: false,
            },
            Properties::default(),
            b"{}".to_vec(),
            Arc::new(JsonSerializer),
        )
    }

    #[tokio::test]
    async fn tracers_compose_left_to_right() {
        let trace = Arc::new(Mutex::new(vec![]));
        let tracers: Vec<Arc<dyn Tracer>> = vec![
            Arc::new(Labelling {
                label: "outer",
                trace: trace.clone(),
            }),
            Arc::new(Labelling {
                label: "inner",
                trace: trace.clone(),
            }),
        ];

        let handler = compose(
            &tracers,
            "orders",
            Box::new(Terminal {
                trace: trace.clone(),
            }),
        );
        handler.handle(&message()).await.unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["outer", "inner", "handler"]);
    }
}
