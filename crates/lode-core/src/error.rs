//! Configuration error types.

use std::error::Error;
use std::fmt;

/// Errors raised when validating a [`HeapConfig`](crate::HeapConfig) or
/// constructing a fault injector.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// A size parameter must be a non-zero multiple of the page size.
    InvalidSize {
        /// Name of the offending parameter.
        name: &'static str,
        /// The rejected value.
        value: usize,
    },
    /// The fault-injection probability is outside `[0, 1]` or not finite.
    InvalidFaultRate {
        /// The rejected probability.
        rate: f64,
    },
    /// The debug boundary is larger than the commit block.
    BoundaryTooLarge {
        /// The rejected boundary size.
        boundary: usize,
        /// Upper bound for the boundary.
        max: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize { name, value } => {
                write!(f, "{name} must be a non-zero multiple of the page size, got {value:#x}")
            }
            Self::InvalidFaultRate { rate } => {
                write!(f, "fault injection rate must be finite and within [0, 1], got {rate}")
            }
            Self::BoundaryTooLarge { boundary, max } => {
                write!(f, "debug boundary {boundary} exceeds maximum {max}")
            }
        }
    }
}

impl Error for ConfigError {}
