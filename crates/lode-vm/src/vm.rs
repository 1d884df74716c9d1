//! The [`VirtualMemory`] trait and its supporting types.

use std::fmt;
use std::sync::Arc;

use lode_core::{Address, AddressRange};

use crate::error::VmError;

/// Page access permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Reserved but inaccessible.
    NoAccess,
    /// Readable only.
    ReadOnly,
    /// Readable and writable (ordinary data pages).
    ReadWrite,
    /// Readable and executable, never writable.
    ReadExecute,
}

impl Protection {
    /// Whether pages with this protection may be written.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    /// Whether pages with this protection may be read.
    pub fn is_readable(self) -> bool {
        !matches!(self, Self::NoAccess)
    }

    /// Whether pages with this protection may be executed.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::ReadExecute)
    }
}

/// Allocation state of a region as reported by [`VirtualMemory::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// Not reserved by anyone.
    Free,
    /// Reserved but not backed by committed pages.
    Reserved,
    /// Reserved and committed.
    Committed,
}

/// A maximal run of pages sharing one [`RegionState`], starting at the
/// page containing the queried address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// Page-aligned start of the run.
    pub base: Address,
    /// Length of the run in bytes. Zero means "unknown extent".
    pub size: usize,
    /// State shared by every page in the run.
    pub state: RegionState,
}

impl RegionInfo {
    /// One past the last byte of the run.
    pub fn end(&self) -> Address {
        self.base.offset(self.size)
    }
}

/// The operating-system virtual-memory surface a loader heap depends on.
///
/// Implementations must tolerate any call failing, except
/// [`release`](VirtualMemory::release), which never fails. All addresses
/// passed to reserve/commit/protect are page- or granularity-aligned by the
/// caller.
pub trait VirtualMemory: Send + Sync + fmt::Debug {
    /// Size of a page in bytes.
    fn page_size(&self) -> usize;

    /// Alignment and size quantum of reservations, in bytes.
    fn allocation_granularity(&self) -> usize;

    /// The lowest and highest addresses a reservation may occupy.
    fn address_bounds(&self) -> AddressRange;

    /// Describe the region containing `address`.
    fn query(&self, address: Address) -> Result<RegionInfo, VmError>;

    /// Reserve `size` bytes anywhere in the address space.
    fn reserve(&self, size: usize) -> Result<Address, VmError>;

    /// Reserve exactly `[address, address + size)`.
    ///
    /// Fails if any part of the range is already in use.
    fn reserve_at(&self, address: Address, size: usize) -> Result<Address, VmError>;

    /// Platform facility for reserving inside a window, when one exists.
    ///
    /// Returns `None` when the backend has no such facility, in which case
    /// callers fall back to a query-and-probe scan.
    fn reserve_within(&self, _window: AddressRange, _size: usize) -> Option<Address> {
        None
    }

    /// Commit `range` (inside a single reservation) with `protection`.
    fn commit(&self, range: AddressRange, protection: Protection) -> Result<(), VmError>;

    /// Change the protection of committed pages.
    fn protect(&self, range: AddressRange, protection: Protection) -> Result<(), VmError>;

    /// Zero the bytes of a committed, writable range.
    fn zero(&self, range: AddressRange) -> Result<(), VmError>;

    /// Copy `bytes` into committed, writable memory at `address`.
    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), VmError>;

    /// Copy committed, readable memory at `address` into `buf`.
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), VmError>;

    /// Release a whole reservation previously returned by a reserve call.
    fn release(&self, reservation: AddressRange);
}

/// Shared, type-erased virtual-memory backend.
pub type SharedVm = Arc<dyn VirtualMemory>;
