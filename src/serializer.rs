// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Message Body Serialization
//!
//! This module encodes and decodes message bodies. JSON is the wire default;
//! the identity serializer passes opaque byte payloads through untouched.
//! Each serializer declares the content type it stamps on published messages
//! and whether its payload is binary.

use crate::errors::{HandlerError, WorkerError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for opaque byte payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// A message body, either structured JSON or opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Body {
    /// Returns the JSON value, or a decode error when the body is binary.
    pub fn as_json(&self) -> Result<&Value, HandlerError> {
        match self {
            Body::Json(value) => Ok(value),
            Body::Bytes(_) => Err(HandlerError::Decode(
                "binary payload has no json representation".to_owned(),
            )),
        }
    }

    /// Returns the raw bytes of a binary body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            Body::Json(_) => None,
        }
    }
}

/// Encodes and decodes message bodies for one content type.
pub trait Serializer: Send + Sync {
    /// The content type stamped on messages encoded by this serializer.
    fn content_type(&self) -> &str;

    /// Whether the encoded payload is binary rather than text.
    fn binary(&self) -> bool;

    /// Encodes a body for publishing. Failures surface as publish errors.
    fn encode(&self, body: &Body) -> Result<Vec<u8>, WorkerError>;

    /// Decodes a received payload. Failures are handler-level errors.
    fn decode(&self, payload: &[u8]) -> Result<Body, HandlerError>;
}

/// JSON serializer, the framework default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn binary(&self) -> bool {
        false
    }

    fn encode(&self, body: &Body) -> Result<Vec<u8>, WorkerError> {
        match body {
            Body::Json(value) => {
                serde_json::to_vec(value).map_err(|err| WorkerError::Publish(err.to_string()))
            }
            Body::Bytes(_) => Err(WorkerError::Publish(
                "json serializer cannot encode an opaque byte payload".to_owned(),
            )),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Body, HandlerError> {
        let value: Value = serde_json::from_slice(payload)?;
        Ok(Body::Json(value))
    }
}

/// Identity serializer for opaque byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentitySerializer;

impl Serializer for IdentitySerializer {
    fn content_type(&self) -> &str {
        OCTET_STREAM_CONTENT_TYPE
    }

    fn binary(&self) -> bool {
        true
    }

    fn encode(&self, body: &Body) -> Result<Vec<u8>, WorkerError> {
        match body {
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Json(value) => {
                serde_json::to_vec(value).map_err(|err| WorkerError::Publish(err.to_string()))
            }
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Body, HandlerError> {
        Ok(Body::Bytes(payload.to_vec()))
    }
}

/// Registry of serializers keyed by content type, with a process default.
#[derive(Clone)]
pub struct SerializerRegistry {
    default: Arc<dyn Serializer>,
    by_content_type: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// Creates a registry with JSON as the default and the identity
    /// serializer registered for opaque payloads.
    pub fn new() -> Self {
        let mut registry = SerializerRegistry {
            default: Arc::new(JsonSerializer),
            by_content_type: HashMap::new(),
        };
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(IdentitySerializer));
        registry
    }

    /// Registers a serializer under its declared content type.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.by_content_type
            .insert(serializer.content_type().to_owned(), serializer);
    }

    /// Replaces the process default serializer.
    pub fn set_default(&mut self, serializer: Arc<dyn Serializer>) {
        self.register(serializer.clone());
        self.default = serializer;
    }

    /// The process default serializer.
    pub fn default_serializer(&self) -> Arc<dyn Serializer> {
        self.default.clone()
    }

    /// Looks a serializer up by content type, falling back to the default.
    pub fn for_content_type(&self, content_type: Option<&str>) -> Arc<dyn Serializer> {
        content_type
            .and_then(|ct| self.by_content_type.get(ct).cloned())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer;
        let body = Body::Json(json!({"x": 1}));
        let encoded = serializer.encode(&body).unwrap();
        assert_eq!(serializer.decode(&encoded).unwrap(), body);
        assert_eq!(serializer.content_type(), "application/json");
        assert!(!serializer.binary());
    }

    #[test]
    fn json_decode_failure_is_handler_error() {
        let err = JsonSerializer.decode(b"{not json").unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[test]
    fn identity_passes_bytes_through() {
        let serializer = IdentitySerializer;
        let body = serializer.decode(&[0xde, 0xad]).unwrap();
        assert_eq!(body, Body::Bytes(vec![0xde, 0xad]));
        assert_eq!(serializer.encode(&body).unwrap(), vec![0xde, 0xad]);
        assert!(serializer.binary());
    }

    #[test]
    fn registry_resolves_by_content_type() {
        let registry = SerializerRegistry::new();
        let identity = registry.for_content_type(Some(OCTET_STREAM_CONTENT_TYPE));
        assert!(identity.binary());
        let fallback = registry.for_content_type(Some("text/unknown"));
        assert_eq!(fallback.content_type(), JSON_CONTENT_TYPE);
        assert_eq!(
            registry.for_content_type(None).content_type(),
            JSON_CONTENT_TYPE
        );
    }
}
