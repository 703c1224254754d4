//! Broker event type and its wire format.
//!
//! Events travel as JSON objects with the keys `operation`, `input_repr`,
//! `result_repr`, `timestamp` (RFC 3339), `requester` and an optional
//! `origin`. There is no schema version field: changing the shape of this
//! struct is a breaking change for every consumer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::EventDecodeError;
use crate::operation::OperationKind;
use crate::result::{OperationResult, Origin};

/// A completed (or cache-served) operation, as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub operation: OperationKind,
    pub input_repr: String,
    pub result_repr: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl Event {
    /// Build the event describing `result`, stamped with the current time.
    pub fn from_result(result: &OperationResult, requester: impl Into<String>) -> Self {
        Self {
            operation: result.operation.kind(),
            input_repr: result.operation.input_repr(),
            result_repr: result.value.encode(),
            timestamp: OffsetDateTime::now_utc(),
            requester: requester.into(),
            origin: Some(result.origin),
        }
    }

    /// Validate the structure of an already decoded message.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, EventDecodeError> {
        serde_json::from_value(Value::Object(map)).map_err(EventDecodeError::Structure)
    }

    /// Decode raw message bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventDecodeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(EventDecodeError::Json)?;
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(EventDecodeError::NotAnObject),
        }
    }

    /// Encode with sorted keys.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_stable(self)
    }
}

/// Serialize `value` to JSON with object keys sorted at every level.
///
/// Identical payloads always produce identical bytes regardless of field
/// declaration order or map backing.
pub fn encode_stable<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&sort_keys(value))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
