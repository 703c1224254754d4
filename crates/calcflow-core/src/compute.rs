//! Pure compute functions.
//!
//! Deterministic and side-effect free. Domain constraints are enforced here
//! as well as at the entry point.

use num_bigint::BigUint;

use crate::error::DomainError;
use crate::operation::Operation;
use crate::result::ResultValue;

/// Compute the value of an operation.
pub fn compute(operation: &Operation) -> Result<ResultValue, DomainError> {
    operation.check_domain()?;

    match *operation {
        Operation::Fibonacci { n } => Ok(ResultValue::Integer(fibonacci(n as u64))),
        Operation::Factorial { n } => Ok(ResultValue::Integer(factorial(n as u64))),
        Operation::Power { base, exponent } => {
            let value = base.powf(exponent);
            if !value.is_finite() {
                return Err(DomainError::NoRealResult { base, exponent });
            }
            Ok(ResultValue::Float(value))
        }
    }
}

/// The n-th fibonacci number, with `fibonacci(0) = 0`.
pub fn fibonacci(n: u64) -> BigUint {
    let mut a = BigUint::from(0u32);
    let mut b = BigUint::from(1u32);
    for _ in 0..n {
        let next = &a + &b;
        a = std::mem::replace(&mut b, next);
    }
    a
}

/// `n!`, with `factorial(0) = 1`.
pub fn factorial(n: u64) -> BigUint {
    (2..=n).fold(BigUint::from(1u32), |acc, i| acc * i)
}
