//! Virtual-memory and reservation error types.

use std::error::Error;
use std::fmt;

use lode_core::{Address, AddressRange};

/// Failures reported by a [`VirtualMemory`](crate::VirtualMemory) backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    /// The backend could not reserve address space.
    ReserveFailed {
        /// Requested address, if the reservation was placed.
        at: Option<Address>,
        /// Requested size in bytes.
        size: usize,
        /// OS error number, when one is available.
        errno: Option<i32>,
    },
    /// Pages inside a reservation could not be committed.
    CommitFailed {
        /// The range that failed to commit.
        range: AddressRange,
        /// OS error number, when one is available.
        errno: Option<i32>,
    },
    /// Page protection could not be changed.
    ProtectFailed {
        /// The range whose protection was being changed.
        range: AddressRange,
        /// OS error number, when one is available.
        errno: Option<i32>,
    },
    /// The state of an address could not be queried.
    QueryFailed {
        /// The probed address.
        address: Address,
    },
    /// Misaligned, zero-sized, or out-of-bounds arguments.
    InvalidArgument {
        /// Description of the rejected argument.
        reason: &'static str,
    },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReserveFailed { at, size, errno } => {
                write!(f, "failed to reserve {size:#x} bytes")?;
                if let Some(at) = at {
                    write!(f, " at {at}")?;
                }
                if let Some(errno) = errno {
                    write!(f, " (errno {errno})")?;
                }
                Ok(())
            }
            Self::CommitFailed { range, errno } => {
                write!(f, "failed to commit {range}")?;
                if let Some(errno) = errno {
                    write!(f, " (errno {errno})")?;
                }
                Ok(())
            }
            Self::ProtectFailed { range, errno } => {
                write!(f, "failed to change protection of {range}")?;
                if let Some(errno) = errno {
                    write!(f, " (errno {errno})")?;
                }
                Ok(())
            }
            Self::QueryFailed { address } => write!(f, "failed to query address {address}"),
            Self::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
        }
    }
}

impl Error for VmError {}

/// Failures from [`AddressSpaceReserver`](crate::AddressSpaceReserver).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveError {
    /// A zero-byte reservation was requested.
    ZeroSize,
    /// The normalized window is empty (`max <= min`).
    InvalidWindow {
        /// Normalized lower bound.
        min: Address,
        /// Normalized upper bound.
        max: Address,
    },
    /// The scan reached the top of the window without finding room.
    Exhausted {
        /// Requested size in bytes.
        size: usize,
        /// Number of region queries performed.
        queries: usize,
    },
    /// The backend failed to describe a probed region.
    QueryFailed {
        /// The probed address.
        address: Address,
    },
    /// A synthetic failure was injected while scanning.
    FaultInjected,
    /// An unconstrained reservation failed in the backend.
    Os(VmError),
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "cannot reserve zero bytes"),
            Self::InvalidWindow { min, max } => {
                write!(f, "reservation window [{min}, {max}) is empty")
            }
            Self::Exhausted { size, queries } => write!(
                f,
                "address space exhausted: no free {size:#x}-byte region after {queries} queries"
            ),
            Self::QueryFailed { address } => write!(f, "region query failed at {address}"),
            Self::FaultInjected => write!(f, "injected reservation fault"),
            Self::Os(err) => write!(f, "reservation failed: {err}"),
        }
    }
}

impl Error for ReserveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VmError> for ReserveError {
    fn from(err: VmError) -> Self {
        Self::Os(err)
    }
}
