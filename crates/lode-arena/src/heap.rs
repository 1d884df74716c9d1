//! The default loader-heap policy, unlocked and locked.

use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lode_core::{Address, AddressRange, HeapId};
use lode_vm::SharedVm;

use crate::block::ArenaBlock;
use crate::bump::{AlignedAllocation, BumpHeap, HeapKind};
use crate::error::ArenaError;
use crate::sniffer::ArenaSniffer;
use crate::tags::ValidationTags;
use crate::tracker::{BackoutTarget, TaggedAllocation};

/// A bump heap that reclaims backed-out memory through a free list.
///
/// Allocations are O(1) in the common case and never move. Individual
/// allocations are not freed; memory comes back only through
/// [`backout`](Self::backout), used to undo allocations from a failed
/// operation, and all blocks are released together when the heap drops.
///
/// Requires `&mut self` for everything that changes the heap. Share it
/// across threads through [`LoaderHeap`].
#[derive(Debug)]
pub struct UnlockedLoaderHeap {
    core: BumpHeap,
}

impl UnlockedLoaderHeap {
    pub(crate) fn from_core(core: BumpHeap) -> Self {
        Self { core }
    }

    /// This heap's unique ID, also its owner ID in a range index.
    pub fn id(&self) -> HeapId {
        self.core.id()
    }

    /// Whether committed pages are read-execute.
    pub fn is_executable(&self) -> bool {
        self.core.kind() == HeapKind::Executable
    }

    /// The backend this heap reserves from.
    pub fn vm(&self) -> &SharedVm {
        self.core.vm()
    }

    /// Allocate `size` zeroed bytes, aligned to the pointer size.
    ///
    /// # Errors
    ///
    /// [`ArenaError::OutOfMemory`] if address space cannot be reserved or
    /// committed, or an injected fault fires.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<AddressRange, ArenaError> {
        let consumed = self.core.allocate(size, Location::caller())?;
        Ok(AddressRange::new(consumed.base(), size))
    }

    /// Allocate `size` zeroed bytes at a power-of-two `alignment`.
    ///
    /// Back the result out with
    /// [`AlignedAllocation::backout_address`] and
    /// [`AlignedAllocation::backout_size`].
    ///
    /// # Errors
    ///
    /// [`ContractViolation::InvalidAlignment`] for a bad alignment, otherwise
    /// as [`allocate`](Self::allocate).
    ///
    /// [`ContractViolation::InvalidAlignment`]: crate::ContractViolation::InvalidAlignment
    #[track_caller]
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<AlignedAllocation, ArenaError> {
        self.core
            .allocate_aligned(size, alignment, Location::caller())
    }

    /// Undo an allocation of `size` bytes starting at `memory`.
    ///
    /// The most recent allocation is rewound; any other goes to the free
    /// list for reuse. The bytes are zeroed before they are handed out
    /// again. A null `memory` is accepted and ignored.
    ///
    /// # Errors
    ///
    /// [`ContractViolation::InvalidBackout`] if `memory` and `size` do not
    /// describe a live allocation of this heap.
    ///
    /// [`ContractViolation::InvalidBackout`]: crate::ContractViolation::InvalidBackout
    #[track_caller]
    pub fn backout(&mut self, memory: Address, size: usize) -> Result<(), ArenaError> {
        self.core.backout(memory, size, Location::caller())
    }

    /// Offer a region the caller already reserved for the next block.
    ///
    /// # Errors
    ///
    /// [`ContractViolation::ReservedRegionAlreadySet`] if a region is still
    /// pending, or [`ArenaError::Vm`] if `range` is not whole pages.
    ///
    /// [`ContractViolation::ReservedRegionAlreadySet`]: crate::ContractViolation::ReservedRegionAlreadySet
    pub fn set_reserved_region(
        &mut self,
        range: AddressRange,
        release_on_drop: bool,
    ) -> Result<(), ArenaError> {
        self.core.set_reserved_region(range, release_on_drop)
    }

    /// The next address the bump pointer will hand out.
    pub fn alloc_ptr(&self) -> Address {
        self.core.alloc_ptr()
    }

    /// Committed bytes left in the current block.
    pub fn bytes_available_committed(&self) -> usize {
        self.core.bytes_available_committed()
    }

    /// Reserved bytes left in the current block, committed or not.
    pub fn bytes_available_reserved(&self) -> usize {
        self.core.bytes_available_reserved()
    }

    /// Bytes committed over the heap's lifetime.
    pub fn total_committed(&self) -> usize {
        self.core.total_committed()
    }

    /// Bytes reserved across all blocks.
    pub fn total_reserved(&self) -> usize {
        self.core.total_reserved()
    }

    /// Committed bytes abandoned when moving to a new block.
    pub fn wasted_bytes(&self) -> usize {
        self.core.wasted_bytes()
    }

    /// Bytes waiting on the free list.
    pub fn free_bytes(&self) -> usize {
        self.core.free_bytes()
    }

    /// Whether `address` lies in a backed-out block awaiting reuse.
    pub fn is_free(&self, address: Address) -> bool {
        self.core.is_free(address)
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

    /// Mutable event log access, for compaction and clearing.
    pub fn sniffer_mut(&mut self) -> Option<&mut ArenaSniffer> {
        self.core.sniffer_mut()
    }

    /// The validation tag table, when tags are on.
    pub fn validation_tags(&self) -> Option<&ValidationTags> {
        self.core.tags()
    }

    /// Explain where `address` came from, using the event log.
    pub fn describe(&self, address: Address) -> Option<String> {
        self.core.describe(address)
    }

    /// Check the newest logged event covering `address` for corruption:
    /// a validation tag that disagrees with the log, or overwritten guard
    /// bytes.
    ///
    /// `None` when call tracing is off or nothing was logged there.
    pub fn validate(&self, address: Address) -> Option<bool> {
        self.core.validate(address)
    }
}

/// A thread-safe [`UnlockedLoaderHeap`].
///
/// Every call takes the heap's lock for its duration. Allocations come back
/// as [`TaggedAllocation`]s so they can be handed to an
/// [`AllocationTracker`](crate::AllocationTracker).
#[derive(Debug)]
pub struct LoaderHeap {
    id: HeapId,
    inner: Mutex<UnlockedLoaderHeap>,
}

// Compile-time assertion: LoaderHeap must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<LoaderHeap>();
};

impl LoaderHeap {
    /// Wrap an unlocked heap.
    pub fn new(heap: UnlockedLoaderHeap) -> Self {
        Self {
            id: heap.id(),
            inner: Mutex::new(heap),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnlockedLoaderHeap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This heap's unique ID.
    pub fn id(&self) -> HeapId {
        self.id
    }

    /// Allocate `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// See [`UnlockedLoaderHeap::allocate`].
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<TaggedAllocation<'_>, ArenaError> {
        let location = Location::caller();
        let consumed = self.lock().core.allocate(size, location)?;
        let memory = AddressRange::new(consumed.base(), size);
        Ok(TaggedAllocation::new(self, memory, memory.base(), size))
    }

    /// Allocate `size` zeroed bytes at a power-of-two `alignment`.
    ///
    /// The returned allocation's memory is the aligned range; backing it out
    /// covers the alignment padding as well.
    ///
    /// # Errors
    ///
    /// See [`UnlockedLoaderHeap::allocate_aligned`].
    #[track_caller]
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<TaggedAllocation<'_>, ArenaError> {
        let location = Location::caller();
        let aligned = self
            .lock()
            .core
            .allocate_aligned(size, alignment, location)?;
        Ok(TaggedAllocation::new(
            self,
            aligned.memory,
            aligned.backout_address(),
            aligned.backout_size(),
        ))
    }

    /// Undo an allocation of `size` bytes starting at `memory`.
    ///
    /// # Errors
    ///
    /// See [`UnlockedLoaderHeap::backout`].
    #[track_caller]
    pub fn backout(&self, memory: Address, size: usize) -> Result<(), ArenaError> {
        let location = Location::caller();
        self.lock().core.backout(memory, size, location)
    }

    /// Run `f` with the heap locked.
    ///
    /// Used for accounting queries and diagnostics that need several
    /// consistent reads.
    pub fn with_unlocked<R>(&self, f: impl FnOnce(&mut UnlockedLoaderHeap) -> R) -> R {
        f(&mut self.lock())
    }

    /// The next address the bump pointer will hand out.
    pub fn alloc_ptr(&self) -> Address {
        self.lock().alloc_ptr()
    }

    /// Bytes committed over the heap's lifetime.
    pub fn total_committed(&self) -> usize {
        self.lock().total_committed()
    }

    /// Number of reserved blocks.
    pub fn block_count(&self) -> usize {
        self.lock().block_count()
    }

    /// Snapshot of the reserved blocks, oldest first.
    pub fn blocks(&self) -> Vec<ArenaBlock> {
        self.lock().blocks().to_vec()
    }

    /// Explain where `address` came from, using the event log.
    pub fn describe(&self, address: Address) -> Option<String> {
        self.lock().describe(address)
    }

    /// See [`UnlockedLoaderHeap::validate`].
    pub fn validate(&self, address: Address) -> Option<bool> {
        self.lock().validate(address)
    }

    /// Take the unlocked heap back.
    pub fn into_inner(self) -> UnlockedLoaderHeap {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackoutTarget for LoaderHeap {
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
