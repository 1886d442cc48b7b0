//! Immutable message envelope.

use std::collections::HashMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BusError, Result};

/// Content type of every payload on the bus.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode for persistent messages.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A serialized domain event plus the metadata needed to route it.
///
/// Outgoing envelopes are only built inside the crate, from a registered
/// route, so every published message is JSON and persistent. Fields are
/// read-only after construction.
///
/// `headers` carry string metadata next to the body (trace context when the
/// `otel` feature is on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    routing_key: String,
    payload_type: String,
    payload: Vec<u8>,
    content_type: String,
    persistent: bool,
    message_id: String,
    timestamp: i64,
    headers: HashMap<String, String>,
}

impl Envelope {
    /// Serialize `payload` to JSON and wrap it for publishing.
    pub(crate) fn encode<T: Serialize>(
        routing_key: impl Into<String>,
        payload_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self {
            routing_key: routing_key.into(),
            payload_type: payload_type.into(),
            payload: body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
            headers: HashMap::new(),
        })
    }

    /// Attach headers to an outgoing envelope.
    #[cfg_attr(not(feature = "otel"), allow(dead_code))]
    pub(crate) fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Rebuild an envelope from the parts of a received broker message.
    pub(crate) fn received(
        routing_key: String,
        payload_type: String,
        payload: Vec<u8>,
        content_type: String,
        persistent: bool,
        message_id: String,
        timestamp: i64,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            routing_key,
            payload_type,
            payload,
            content_type,
            persistent,
            message_id,
            timestamp,
            headers,
        }
    }

    /// Deserialize the payload. An empty body is an error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.payload.is_empty() {
            return Err(BusError::Serialization("empty message body".to_string()));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Unix timestamp (seconds) of creation.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
