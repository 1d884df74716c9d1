//! Heaps whose code pages are never writable and executable at once.
//!
//! An [`InterleavedLoaderHeap`] commits memory in pairs: a code page
//! followed by a data page of the same size. Allocations are carved from
//! the code page and every code address `c` has a private data slot at
//! `c + page_size`. The code page is filled by a [`CodePageGenerator`]
//! while it is still read-write and is then flipped to read-execute, so
//! the running program only ever writes to the data page.
//!
//! [`LockedInterleavedLoaderHeap`] is the shared form whose allocations
//! can be handed to an [`AllocationTracker`](crate::AllocationTracker).

use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lode_core::{Address, AddressRange, HeapId};
use lode_vm::{VirtualMemory, VmError};

use crate::block::ArenaBlock;
use crate::bump::BumpHeap;
use crate::error::ArenaError;
use crate::sniffer::ArenaSniffer;
use crate::tracker::{BackoutTarget, TaggedAllocation};

/// Fills a freshly committed code page before it becomes read-execute.
///
/// Called once per code/data pair, with both pages committed read-write.
pub trait CodePageGenerator: Send {
    /// Write the code page's contents.
    ///
    /// # Errors
    ///
    /// Any error aborts the growth step and surfaces as out-of-memory.
    fn generate(
        &mut self,
        vm: &dyn VirtualMemory,
        code_page: AddressRange,
        data_page: AddressRange,
    ) -> Result<(), VmError>;
}

impl<F> CodePageGenerator for F
where
    F: FnMut(&dyn VirtualMemory, AddressRange, AddressRange) -> Result<(), VmError> + Send,
{
    fn generate(
        &mut self,
        vm: &dyn VirtualMemory,
        code_page: AddressRange,
        data_page: AddressRange,
    ) -> Result<(), VmError> {
        self(vm, code_page, data_page)
    }
}

/// One interleaved allocation: a code slot and its data slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterleavedAllocation {
    /// Slot in the read-execute code page.
    pub code: AddressRange,
    /// Matching slot in the read-write data page, one page above `code`.
    pub data: AddressRange,
}

/// Loader heap handing out paired code and data slots.
///
/// Every allocation must fit in one page. Backouts are accepted in any
/// order; the most recent allocation is rewound and others go to a free
/// list. Backing out scrubs the data slot, never the code slot.
#[derive(Debug)]
pub struct InterleavedLoaderHeap {
    core: BumpHeap,
}

impl InterleavedLoaderHeap {
    pub(crate) fn from_core(core: BumpHeap) -> Self {
        Self { core }
    }

    /// This heap's unique ID.
    pub fn id(&self) -> HeapId {
        self.core.id()
    }

    /// Size of each code and data page.
    pub fn page_size(&self) -> usize {
        self.core.page_size()
    }

    /// Allocate a `size`-byte code slot and its data slot.
    ///
    /// # Errors
    ///
    /// - [`ContractViolation::AllocationTooLarge`] if `size` exceeds a page.
    /// - [`ArenaError::OutOfMemory`] if no pages can be reserved or
    ///   committed, or the code page generator fails.
    ///
    /// [`ContractViolation::AllocationTooLarge`]: crate::ContractViolation::AllocationTooLarge
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<InterleavedAllocation, ArenaError> {
        self.allocate_at(size, Location::caller())
    }

    fn allocate_at(
        &mut self,
        size: usize,
        location: &'static Location<'static>,
    ) -> Result<InterleavedAllocation, ArenaError> {
        let consumed = self.core.allocate(size, location)?;
        let code = AddressRange::new(consumed.base(), size);
        let data = AddressRange::new(consumed.base().offset(self.page_size()), size);
        Ok(InterleavedAllocation { code, data })
    }

    /// Give back the allocation whose code slot starts at `code`.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ContractViolation`] if `code` was not allocated here
    /// with `size`, or [`ArenaError::Vm`] if the data slot cannot be scrubbed.
    #[track_caller]
    pub fn backout(&mut self, code: Address, size: usize) -> Result<(), ArenaError> {
        self.core.backout(code, size, Location::caller())
    }

    /// Next free code address.
    pub fn alloc_ptr(&self) -> Address {
        self.core.alloc_ptr()
    }

    /// Free bytes left in the current code page.
    pub fn bytes_available_committed(&self) -> usize {
        self.core.bytes_available_committed()
    }

    /// Bytes committed so far, code and data pages both counted.
    pub fn total_committed(&self) -> usize {
        self.core.total_committed()
    }

    /// Bytes abandoned at the end of code pages.
    pub fn wasted_bytes(&self) -> usize {
        self.core.wasted_bytes()
    }

    /// Number of reserved blocks.
    pub fn block_count(&self) -> usize {
        self.core.block_count()
    }

    /// Reserved blocks, oldest first.
    pub fn blocks(&self) -> &[ArenaBlock] {
        self.core.blocks()
    }

    /// The event log, when call tracing is on.
    pub fn sniffer(&self) -> Option<&ArenaSniffer> {
        self.core.sniffer()
    }
}

/// A thread-safe [`InterleavedLoaderHeap`] whose allocations can be
/// tracked.
///
/// A [`TaggedAllocation`]'s memory is the code slot; the data slot is
/// [`page_size`](Self::page_size) bytes above it, as
/// [`data_slot`](Self::data_slot) computes.
#[derive(Debug)]
pub struct LockedInterleavedLoaderHeap {
    id: HeapId,
    page_size: usize,
    inner: Mutex<InterleavedLoaderHeap>,
}

// Compile-time assertion: LockedInterleavedLoaderHeap must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<LockedInterleavedLoaderHeap>();
};

impl LockedInterleavedLoaderHeap {
    /// Wrap an interleaved heap.
    pub fn new(heap: InterleavedLoaderHeap) -> Self {
        Self {
            id: heap.id(),
            page_size: heap.page_size(),
            inner: Mutex::new(heap),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InterleavedLoaderHeap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This heap's unique ID.
    pub fn id(&self) -> HeapId {
        self.id
    }

    /// Size of each code and data page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The data slot paired with `code`.
    pub fn data_slot(&self, code: AddressRange) -> AddressRange {
        AddressRange::new(code.base().offset(self.page_size), code.size())
    }

    /// Allocate a `size`-byte code slot and its data slot.
    ///
    /// # Errors
    ///
    /// See [`InterleavedLoaderHeap::allocate`].
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<TaggedAllocation<'_>, ArenaError> {
        let location = Location::caller();
        let slots = self.lock().allocate_at(size, location)?;
        Ok(TaggedAllocation::new(self, slots.code, slots.code.base(), size))
    }

    /// Run `f` with the heap locked.
    pub fn with_unlocked<R>(&self, f: impl FnOnce(&mut InterleavedLoaderHeap) -> R) -> R {
        f(&mut self.lock())
    }

    /// Next free code address.
    pub fn alloc_ptr(&self) -> Address {
        self.lock().alloc_ptr()
    }

    /// Take the interleaved heap back.
    pub fn into_inner(self) -> InterleavedLoaderHeap {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackoutTarget for LockedInterleavedLoaderHeap {
    fn heap_id(&self) -> HeapId {
        self.id
    }

    fn backout_allocation(
        &self,
        memory: Address,
        requested_size: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError> {
        self.lock().core.backout(memory, requested_size, location)
    }
}
