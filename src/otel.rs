// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Utilities for propagating trace context through AMQP message headers:
//! injection into outgoing publishes, extraction from received deliveries,
//! and consumer span creation for message processing.

use crate::message::Properties;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// An adapter for injecting and extracting OpenTelemetry context from AMQP
/// message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = ShortString::from(key.to_lowercase());
        self.headers.insert(name, AMQPValue::LongString(value.into()));
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, error = err.to_string(), "skipping non-utf8 trace header");
                    None
                }
            },
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Injects the current trace context into the headers of an outgoing
/// message.
pub(crate) fn inject_context(ctx: &Context, properties: &mut Properties) {
    let headers = properties.headers.get_or_insert_with(BTreeMap::new);
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Creates a consumer span for processing one delivery, parented on the
/// context propagated through the message headers.
pub(crate) fn consumer_span(
    properties: &Properties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = properties.headers.clone().unwrap_or_default();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
