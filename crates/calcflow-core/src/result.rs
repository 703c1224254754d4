use num_bigint::BigUint;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::ValueDecodeError;
use crate::operation::{Operation, OperationKind, format_float};

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cache,
    Computed,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Cache => f.write_str("cache"),
            Origin::Computed => f.write_str("computed"),
        }
    }
}

/// The value produced by an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    /// Exact integer (fibonacci, factorial)
    Integer(BigUint),
    /// Floating point (power)
    Float(f64),
}

impl ResultValue {
    /// String form stored in the cache and the audit trail.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse a cached string back into the result type of `operation`.
    pub fn decode(operation: OperationKind, raw: &str) -> Result<Self, ValueDecodeError> {
        let err = || ValueDecodeError {
            operation,
            raw: raw.to_string(),
        };

        match operation {
            OperationKind::Fibonacci | OperationKind::Factorial => raw
                .parse::<BigUint>()
                .map(ResultValue::Integer)
                .map_err(|_| err()),
            OperationKind::Power => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(ResultValue::Float(v)),
                _ => Err(err()),
            },
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Integer(v) => write!(f, "{v}"),
            ResultValue::Float(v) => f.write_str(&format_float(*v)),
        }
    }
}

impl Serialize for ResultValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Values beyond u64 are emitted as decimal strings; JSON consumers
            // commonly lose precision on larger numbers.
            ResultValue::Integer(v) => match u64::try_from(v) {
                Ok(small) => serializer.serialize_u64(small),
                Err(_) => serializer.serialize_str(&v.to_string()),
            },
            ResultValue::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

/// The immutable outcome of one executed request.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub operation: Operation,
    pub value: ResultValue,
    pub origin: Origin,
}

impl OperationResult {
    pub fn new(operation: Operation, value: ResultValue, origin: Origin) -> Self {
        Self {
            operation,
            value,
            origin,
        }
    }
}

impl Serialize for OperationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("OperationResult", 4)?;
        state.serialize_field("operation", &self.operation.kind())?;
        state.serialize_field("input", &self.operation.operands_json())?;
        state.serialize_field("result", &self.value)?;
        state.serialize_field("origin", &self.origin)?;
        state.end()
    }
}
