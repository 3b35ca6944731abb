//! Error taxonomy for the math container.
//!
//! Configuration errors describe a structurally invalid model and abort
//! compilation. Numerical errors are returned to the calling integrator,
//! which decides whether to retry, damp or abort. Lookup misses are not
//! errors at all; they surface as `Option::None`.

use thiserror::Error;

use crate::object::ObjectIndex;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MathError {
    #[error("parse error in '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("unknown symbol '{symbol}' in '{expression}'")]
    UnknownSymbol { symbol: String, expression: String },

    #[error("malformed discontinuity '{infix}': {reason}")]
    MalformedDiscontinuity { infix: String, reason: String },

    #[error("delay value '{infix}' is defined recursively through another delay")]
    RecursiveDelay { infix: String },

    #[error("cyclic dependency detected at object {0}")]
    CyclicDependency(ObjectIndex),

    #[error("expected {expected} objects in segment {segment}, found {found}")]
    MissingObject {
        segment: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("compile stage '{requested}' cannot run in state '{current}'")]
    InvalidTransition {
        current: &'static str,
        requested: &'static str,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("non-finite value {value} at object {index}")]
    NonFiniteValue { index: ObjectIndex, value: f64 },

    #[error("finite difference produced no usable derivative for coordinate {0}")]
    NoDerivative(usize),

    #[error("analysis objects must be removed in reverse creation order")]
    RemovalOrder,
}

pub type Result<T> = std::result::Result<T, MathError>;
