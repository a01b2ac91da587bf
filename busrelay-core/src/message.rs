//! The relay message model
//!
//! A `Message` is created at ingress (socket line, queue item, bus delivery)
//! and destroyed after successful delivery plus ack, or after an
//! irrecoverable rejection. It is immutable once created; the builder-style
//! constructors below are the only way to attach metadata.

use serde::{Deserialize, Serialize};

/// An opaque relay payload with optional delivery metadata.
///
/// The payload is never inspected by the pipeline; routing key, persistence
/// flag and time-to-live are passed through to the bus transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub persistent: bool,
    /// Time-to-live in milliseconds, forwarded to the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Message kind used for same-kind batching (e.g. "metric").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            routing_key: None,
            persistent: false,
            ttl_ms: None,
            kind: None,
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    #[must_use]
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Aggregate several same-kind messages into one composite message.
    ///
    /// Payloads are joined with newlines; routing key, persistence and TTL
    /// are taken from the first constituent. Callers are expected to group
    /// by `kind` before aggregating.
    #[must_use]
    pub fn batch(parts: Vec<Message>) -> Message {
        debug_assert!(!parts.is_empty());
        let first = &parts[0];
        let mut composite = Message {
            payload: String::new(),
            routing_key: first.routing_key.clone(),
            persistent: first.persistent,
            ttl_ms: first.ttl_ms,
            kind: first.kind.clone(),
        };
        let mut payloads: Vec<&str> = Vec::with_capacity(parts.len());
        for part in &parts {
            payloads.push(part.payload.as_str());
        }
        composite.payload = payloads.join("\n");
        composite
    }

    /// Serialize into the spill envelope stored in the retry table.
    pub fn to_envelope(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::Error::Serialization(format!("Failed to encode message: {e}")))
    }

    /// Decode a spill envelope read back from the retry table.
    pub fn from_envelope(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::Error::Serialization(format!("Failed to decode message: {e}")))
    }
}
