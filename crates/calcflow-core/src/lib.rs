//! Core types for calcflow: operations, results, broker events and the
//! bounded event ring.

pub mod compute;
pub mod error;
pub mod event;
pub mod operation;
pub mod result;
pub mod ring;

pub use compute::{compute, factorial, fibonacci};
pub use error::{DomainError, EventDecodeError, ValidationError, ValueDecodeError};
pub use event::{Event, encode_stable};
pub use operation::{
    FACTORIAL_MAX, FIBONACCI_MAX, Operation, OperationKind, OperationRequest, POWER_BOUND,
};
pub use result::{OperationResult, Origin, ResultValue};
pub use ring::{DEFAULT_EVENT_CAPACITY, EventRing};
