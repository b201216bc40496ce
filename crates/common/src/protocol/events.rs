// Server-pushed real-time events carried over the check-in event stream.
//
// Frames are UTF-8 JSON records with a `type` discriminator. Only
// `viewer_count` is interpreted; every other record is passed through
// untouched so listeners can inspect it themselves.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Discriminator of the viewer presence record.
pub const VIEWER_COUNT_TYPE: &str = "viewer_count";

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Number of clients currently watching the dashboard, with the record
    /// it was read from.
    ViewerCount { count: u64, raw: Value },
    /// Any record whose discriminator is missing or not recognized.
    Unrecognized(Value),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("event frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("event frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("malformed `{kind}` event: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownEvent {
    ViewerCount { count: u64 },
}

impl InboundEvent {
    /// A presence record as the server sends it.
    pub fn viewer_count(count: u64) -> Self {
        Self::ViewerCount { count, raw: json!({ "type": VIEWER_COUNT_TYPE, "count": count }) }
    }

    /// The viewer count carried by a presence record.
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::ViewerCount { count, .. } => Some(*count),
            Self::Unrecognized(_) => None,
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Decode a binary frame. The payload must still be UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(std::str::from_utf8(bytes)?)
    }

    /// Classify an already-parsed record.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        if value.get("type").and_then(Value::as_str) != Some(VIEWER_COUNT_TYPE) {
            return Ok(Self::Unrecognized(value));
        }

        match KnownEvent::deserialize(&value) {
            Ok(KnownEvent::ViewerCount { count }) => Ok(Self::ViewerCount { count, raw: value }),
            Err(source) => Err(DecodeError::Malformed { kind: VIEWER_COUNT_TYPE, source }),
        }
    }

    /// The `type` discriminator, if the record carries one.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::ViewerCount { .. } => Some(VIEWER_COUNT_TYPE),
            Self::Unrecognized(value) => value.get("type").and_then(Value::as_str),
        }
    }

    /// The `action` field of a data-change broadcast (`{"action": .., "data": ..}`).
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::ViewerCount { .. } => None,
            Self::Unrecognized(value) => value.get("action").and_then(Value::as_str),
        }
    }

    /// The full event object as it appeared on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Self::ViewerCount { raw, .. } | Self::Unrecognized(raw) => raw.clone(),
        }
    }
}

impl Serialize for InboundEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
