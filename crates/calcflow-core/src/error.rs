use thiserror::Error;

use crate::operation::OperationKind;

/// Domain errors raised by the compute functions themselves.
///
/// These are checked independently of entry validation, so an operation that
/// bypassed [`OperationRequest::new`](crate::OperationRequest::new) is still
/// rejected before it reaches any cache or audit layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("{operation} requires a non-negative integer, got {value}")]
    NegativeInput { operation: OperationKind, value: i64 },

    #[error("power requires a non-negative exponent, got {0}")]
    NegativeExponent(f64),

    #[error("{operation} operands must be finite numbers")]
    NonFinite { operation: OperationKind },

    #[error("power({base}, {exponent}) has no finite real result")]
    NoRealResult { base: f64, exponent: f64 },
}

/// Entry validation errors (operand count, ranges, identity).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("{operation} expects {expected} operand(s), got {got}")]
    Arity {
        operation: OperationKind,
        expected: usize,
        got: usize,
    },

    #[error("invalid operand '{0}'")]
    InvalidOperand(String),

    #[error("{operation} input must be a non-negative integer, got {value}")]
    Negative { operation: OperationKind, value: i64 },

    #[error("{operation} input too large: {value} exceeds the limit of {max}")]
    TooLarge {
        operation: OperationKind,
        value: i64,
        max: i64,
    },

    #[error("power operands must be within ±{bound}, got base={base} exponent={exponent}")]
    OutOfBounds { base: f64, exponent: f64, bound: f64 },

    #[error("requester identity must not be empty")]
    EmptyRequester,
}

/// A cached string could not be turned back into a result value.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot decode cached {operation} value '{raw}'")]
pub struct ValueDecodeError {
    pub operation: OperationKind,
    pub raw: String,
}

/// A broker message could not be turned into an [`Event`](crate::Event).
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload is not a valid event: {0}")]
    Structure(#[source] serde_json::Error),
}
