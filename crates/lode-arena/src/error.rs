//! Loader-heap error types.

use std::error::Error;
use std::fmt;

use lode_core::Address;
use lode_vm::VmError;

/// Programmer errors detected by a loader heap or tracker.
///
/// These are never caused by resource exhaustion; retrying will not help.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    /// An explicit-control backout targeted an allocation that is not the
    /// most recent one.
    BackoutNotMostRecent {
        /// Start of the allocation being backed out.
        address: Address,
        /// Current allocation pointer of the heap.
        alloc_ptr: Address,
    },
    /// A backout token was presented to a heap that did not issue it.
    BackoutForeignToken,
    /// A backout's address or size does not match what was allocated there.
    InvalidBackout {
        /// Address passed to the backout.
        address: Address,
        /// Requested size passed to the backout.
        size: usize,
    },
    /// `track` was called on a tracker that had already been committed.
    TrackAfterCommit,
    /// The request cannot be satisfied by this heap's policy at any size.
    AllocationTooLarge {
        /// Requested size in bytes.
        requested: usize,
        /// Largest size the policy supports.
        max: usize,
    },
    /// An alignment that is zero or not a power of two.
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },
    /// A caller-supplied reserved region was set while another was pending.
    ReservedRegionAlreadySet,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackoutNotMostRecent { address, alloc_ptr } => write!(
                f,
                "backout of {address} is not the most recent allocation (alloc ptr {alloc_ptr})"
            ),
            Self::BackoutForeignToken => write!(f, "backout token was issued by another heap"),
            Self::InvalidBackout { address, size } => write!(
                f,
                "invalid backout of {address} ({size} bytes): no matching live allocation"
            ),
            Self::TrackAfterCommit => write!(f, "allocation tracked after tracker commit"),
            Self::AllocationTooLarge { requested, max } => {
                write!(f, "allocation of {requested} bytes exceeds policy maximum {max}")
            }
            Self::InvalidAlignment { alignment } => {
                write!(f, "alignment {alignment} is not a non-zero power of two")
            }
            Self::ReservedRegionAlreadySet => {
                write!(f, "a reserved region is already pending for this heap")
            }
        }
    }
}

/// Errors returned by loader-heap operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// No more address space or pages could be reserved or committed.
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// The backend failure behind the exhaustion, if there was one.
        cause: Option<VmError>,
    },
    /// The caller broke the heap's usage contract.
    ContractViolation(ContractViolation),
    /// A backend call failed outside the allocation path.
    Vm(VmError),
}

impl ArenaError {
    pub(crate) fn oom(requested: usize) -> Self {
        Self::OutOfMemory {
            requested,
            cause: None,
        }
    }

    /// Whether this is an out-of-memory failure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, .. } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Self::ContractViolation(violation) => write!(f, "contract violation: {violation}"),
            Self::Vm(err) => write!(f, "virtual memory error: {err}"),
        }
    }
}

impl Error for ArenaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::OutOfMemory {
                cause: Some(err), ..
            } => Some(err),
            Self::Vm(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContractViolation> for ArenaError {
    fn from(violation: ContractViolation) -> Self {
        Self::ContractViolation(violation)
    }
}

impl From<VmError> for ArenaError {
    fn from(err: VmError) -> Self {
        Self::Vm(err)
    }
}
