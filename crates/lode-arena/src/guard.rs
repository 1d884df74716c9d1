//! Guard bytes after user data.
//!
//! With [`HeapConfig::debug_boundary`](lode_core::HeapConfig) set, every
//! data allocation is followed by that many bytes of [`GUARD_BYTE`]. A
//! write past the end of the allocation clobbers them, which
//! [`ArenaSniffer::validate`](crate::ArenaSniffer::validate) reports as
//! corruption.

use lode_core::{Address, AddressRange};
use lode_vm::VirtualMemory;

/// Value every guard byte is filled with.
pub const GUARD_BYTE: u8 = 0xEE;

/// Where an allocation's guard lives and how to check it.
#[derive(Clone, Copy)]
pub struct BoundaryGuard<'a> {
    vm: &'a dyn VirtualMemory,
    width: usize,
}

impl<'a> BoundaryGuard<'a> {
    /// A guard of `width` bytes read through `vm`.
    pub fn new(vm: &'a dyn VirtualMemory, width: usize) -> Self {
        Self { vm, width }
    }

    /// Guard width in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The guard bytes of an allocation of `requested` bytes at `base`.
    pub fn range(&self, base: Address, requested: usize) -> AddressRange {
        AddressRange::new(base.offset(requested), self.width)
    }

    /// Whether an allocation whose consumed range is `memory` carries a
    /// guard at all. Code allocations are sized exactly and have none.
    pub fn covers(&self, memory: AddressRange, requested: usize) -> bool {
        self.width > 0
            && requested
                .checked_add(self.width)
                .is_some_and(|needed| memory.size() >= needed)
    }

    /// Whether every guard byte still holds [`GUARD_BYTE`].
    ///
    /// Unreadable guard memory counts as clobbered.
    pub fn is_intact(&self, base: Address, requested: usize) -> bool {
        let mut bytes = vec![0u8; self.width];
        self.vm.read(base.offset(requested), &mut bytes).is_ok()
            && bytes.iter().all(|&b| b == GUARD_BYTE)
    }
}

impl std::fmt::Debug for BoundaryGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryGuard")
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}
