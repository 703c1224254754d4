//! Operation types, entry validation and cache key derivation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, ValidationError};

/// Largest `n` accepted for fibonacci at the entry point.
pub const FIBONACCI_MAX: i64 = 500;

/// Largest `n` accepted for factorial at the entry point.
pub const FACTORIAL_MAX: i64 = 100;

/// Magnitude bound for both power operands.
pub const POWER_BOUND: f64 = 100.0;

/// The kind of arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Fibonacci,
    Factorial,
    #[serde(alias = "pow")]
    Power,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Fibonacci => "fibonacci",
            OperationKind::Factorial => "factorial",
            OperationKind::Power => "power",
        }
    }

    /// Number of operands the operation takes.
    pub fn arity(&self) -> usize {
        match self {
            OperationKind::Fibonacci | OperationKind::Factorial => 1,
            OperationKind::Power => 2,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fibonacci" | "fib" => Ok(OperationKind::Fibonacci),
            "factorial" | "fact" => Ok(OperationKind::Factorial),
            "power" | "pow" => Ok(OperationKind::Power),
            other => Err(ValidationError::UnknownOperation(other.to_string())),
        }
    }
}

/// An operation together with its operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Fibonacci { n: i64 },
    Factorial { n: i64 },
    Power { base: f64, exponent: f64 },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Fibonacci { .. } => OperationKind::Fibonacci,
            Operation::Factorial { .. } => OperationKind::Factorial,
            Operation::Power { .. } => OperationKind::Power,
        }
    }

    /// Parse textual operands for the given kind.
    pub fn parse(kind: OperationKind, operands: &[&str]) -> Result<Self, ValidationError> {
        if operands.len() != kind.arity() {
            return Err(ValidationError::Arity {
                operation: kind,
                expected: kind.arity(),
                got: operands.len(),
            });
        }

        match kind {
            OperationKind::Fibonacci => Ok(Operation::Fibonacci {
                n: parse_integer(operands[0])?,
            }),
            OperationKind::Factorial => Ok(Operation::Factorial {
                n: parse_integer(operands[0])?,
            }),
            OperationKind::Power => Ok(Operation::Power {
                base: parse_float(operands[0])?,
                exponent: parse_float(operands[1])?,
            }),
        }
    }

    /// Deterministic cache key for this operation.
    ///
    /// Floats are written in their shortest round-trip form, which is
    /// injective over finite values, and `:` never occurs inside a number.
    pub fn cache_key(&self) -> String {
        match *self {
            Operation::Fibonacci { n } => format!("fibonacci:{n}"),
            Operation::Factorial { n } => format!("factorial:{n}"),
            Operation::Power { base, exponent } => {
                format!("power:{}:{}", format_float(base), format_float(exponent))
            }
        }
    }

    /// Human readable input used in audit records and events.
    pub fn input_repr(&self) -> String {
        match *self {
            Operation::Fibonacci { n } | Operation::Factorial { n } => n.to_string(),
            Operation::Power { base, exponent } => {
                format!("{}^{}", format_float(base), format_float(exponent))
            }
        }
    }

    /// Operands as a JSON value, for presentation.
    pub fn operands_json(&self) -> serde_json::Value {
        match *self {
            Operation::Fibonacci { n } | Operation::Factorial { n } => serde_json::json!(n),
            Operation::Power { base, exponent } => {
                serde_json::json!({ "base": base, "exponent": exponent })
            }
        }
    }

    /// Domain constraints enforced by the compute functions.
    pub fn check_domain(&self) -> Result<(), DomainError> {
        match *self {
            Operation::Fibonacci { n } | Operation::Factorial { n } if n < 0 => {
                Err(DomainError::NegativeInput {
                    operation: self.kind(),
                    value: n,
                })
            }
            Operation::Fibonacci { .. } | Operation::Factorial { .. } => Ok(()),
            Operation::Power { base, exponent } => {
                if !base.is_finite() || !exponent.is_finite() {
                    return Err(DomainError::NonFinite {
                        operation: OperationKind::Power,
                    });
                }
                if exponent < 0.0 {
                    return Err(DomainError::NegativeExponent(exponent));
                }
                Ok(())
            }
        }
    }

    /// Entry-point range checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Operation::Fibonacci { n } => check_integer(OperationKind::Fibonacci, n, FIBONACCI_MAX),
            Operation::Factorial { n } => check_integer(OperationKind::Factorial, n, FACTORIAL_MAX),
            Operation::Power { base, exponent } => {
                // NaN fails both comparisons, so it is rejected here too
                if !(base.abs() <= POWER_BOUND && exponent.abs() <= POWER_BOUND) {
                    return Err(ValidationError::OutOfBounds {
                        base,
                        exponent,
                        bound: POWER_BOUND,
                    });
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operation::Fibonacci { n } => write!(f, "fibonacci({n})"),
            Operation::Factorial { n } => write!(f, "factorial({n})"),
            Operation::Power { base, exponent } => write!(
                f,
                "power({}, {})",
                format_float(base),
                format_float(exponent)
            ),
        }
    }
}

/// A validated request entering the compute pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation: Operation,
    pub requester: String,
}

impl OperationRequest {
    /// Build a request, applying the entry-point validation rules.
    pub fn new(operation: Operation, requester: impl Into<String>) -> Result<Self, ValidationError> {
        let requester = requester.into();
        if requester.trim().is_empty() {
            return Err(ValidationError::EmptyRequester);
        }
        operation.validate()?;
        Ok(Self {
            operation,
            requester,
        })
    }
}

/// Shortest round-trip decimal form, with `-0` folded into `0`.
pub(crate) fn format_float(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

fn check_integer(operation: OperationKind, value: i64, max: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::Negative { operation, value });
    }
    if value > max {
        return Err(ValidationError::TooLarge {
            operation,
            value,
            max,
        });
    }
    Ok(())
}

fn parse_integer(raw: &str) -> Result<i64, ValidationError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ValidationError::InvalidOperand(raw.to_string()))
}

fn parse_float(raw: &str) -> Result<f64, ValidationError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ValidationError::InvalidOperand(raw.to_string()))
}
