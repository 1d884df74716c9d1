//! Range-index error types.

use std::error::Error;
use std::fmt;

use lode_core::Address;

/// Errors from [`RangeWriter::add`](crate::RangeWriter::add).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeError {
    /// Every block is full and another could not be appended.
    OutOfMemory {
        /// Number of blocks in the index when the append failed.
        blocks: usize,
    },
    /// The range is empty or inverted (`start >= end`).
    InvalidRange {
        /// Requested start.
        start: Address,
        /// Requested end.
        end: Address,
    },
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { blocks } => {
                write!(f, "range index out of memory: cannot grow past {blocks} blocks")
            }
            Self::InvalidRange { start, end } => {
                write!(f, "invalid range [{start}, {end}): start must be below end")
            }
        }
    }
}

impl Error for RangeError {}
