//! The explicit-control loader-heap policy.
//!
//! An [`ExplicitLoaderHeap`] never reserves address space on its own: every
//! block comes from a region the caller hands over with
//! [`set_reserved_region`](ExplicitLoaderHeap::set_reserved_region). Each
//! allocation returns a move-only [`ExplicitAllocation`] token. Passing the
//! token back to [`backout`](ExplicitLoaderHeap::backout) rewinds the heap,
//! which is only allowed while that token is the most recent live one.
//! Keeping the memory consumes the token through
//! [`keep`](ExplicitAllocation::keep).
//!
//! [`LockedExplicitLoaderHeap`] shares an explicit heap across threads and
//! hands out [`TaggedAllocation`]s instead of tokens, so an
//! [`AllocationTracker`](crate::AllocationTracker) can roll them back
//! together with allocations from other heaps. The most-recent-first rule
//! still holds: the tracker unwinds newest first, and an allocation made
//! behind the tracker's back makes the older ones fail with
//! [`ContractViolation::BackoutNotMostRecent`].

use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lode_core::{Address, AddressRange, HeapId};
use lode_vm::SharedVm;

use crate::block::ArenaBlock;
use crate::bump::{BumpHeap, HeapKind};
use crate::error::{ArenaError, ContractViolation};
use crate::sniffer::ArenaSniffer;
use crate::tracker::{BackoutTarget, TaggedAllocation};

/// Proof of one allocation from an [`ExplicitLoaderHeap`].
///
/// Deliberately neither `Clone` nor `Copy`: an allocation can be backed
/// out at most once.
#[must_use = "an explicit allocation must be kept or backed out"]
#[derive(Debug, PartialEq, Eq)]
pub struct ExplicitAllocation {
    heap: HeapId,
    memory: AddressRange,
    consumed: AddressRange,
    requested: usize,
}

impl ExplicitAllocation {
    /// The user memory. For code allocations this is the code range.
    pub fn memory(&self) -> AddressRange {
        self.memory
    }

    /// Everything the allocation took from the heap, header and padding
    /// included.
    pub fn consumed(&self) -> AddressRange {
        self.consumed
    }

    /// The heap that issued this token.
    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    /// Keep the memory for the heap's lifetime and give up the right to
    /// back it out.
    pub fn keep(self) -> AddressRange {
        self.memory
    }
}

/// Loader heap whose caller controls reservation and rollback.
#[derive(Debug)]
pub struct ExplicitLoaderHeap {
    core: BumpHeap,
}

impl ExplicitLoaderHeap {
    pub(crate) fn from_core(core: BumpHeap) -> Self {
        Self { core }
    }

    /// This heap's unique ID.
    pub fn id(&self) -> HeapId {
        self.core.id()
    }

    /// Whether committed pages are read-execute.
    pub fn is_executable(&self) -> bool {
        self.core.kind() == HeapKind::Executable
    }

    /// The backend this heap commits through.
    pub fn vm(&self) -> &SharedVm {
        self.core.vm()
    }

    fn token(
        &self,
        memory: AddressRange,
        consumed: AddressRange,
        requested: usize,
    ) -> ExplicitAllocation {
        ExplicitAllocation {
            heap: self.core.id(),
            memory,
            consumed,
            requested,
        }
    }

    /// Allocate `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// [`ArenaError::OutOfMemory`] if the current region is used up and no
    /// further caller-supplied region fits.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<ExplicitAllocation, ArenaError> {
        self.allocate_at(size, Location::caller())
    }

    fn allocate_at(
        &mut self,
        size: usize,
        location: &'static Location<'static>,
    ) -> Result<ExplicitAllocation, ArenaError> {
        let consumed = self.core.allocate(size, location)?;
        Ok(self.token(AddressRange::new(consumed.base(), size), consumed, size))
    }

    /// Allocate a `header_size`-byte header followed by `code_size` bytes of
    /// code aligned to `code_alignment`.
    ///
    /// `reserve_for_jump_stubs` bytes of committed room are guaranteed to
    /// remain after the code, so stubs emitted next stay within reach of it.
    /// The token's memory is the code range; its header sits immediately
    /// below, at `memory().base() - header_size`.
    ///
    /// # Errors
    ///
    /// [`ContractViolation::InvalidAlignment`] if `code_alignment` is not a
    /// power of two, otherwise as [`allocate`](Self::allocate).
    #[track_caller]
    pub fn allocate_code(
        &mut self,
        header_size: usize,
        code_size: usize,
        code_alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Result<ExplicitAllocation, ArenaError> {
        self.allocate_code_at(
            header_size,
            code_size,
            code_alignment,
            reserve_for_jump_stubs,
            Location::caller(),
        )
    }

    fn allocate_code_at(
        &mut self,
        header_size: usize,
        code_size: usize,
        code_alignment: usize,
        reserve_for_jump_stubs: usize,
        location: &'static Location<'static>,
    ) -> Result<ExplicitAllocation, ArenaError> {
        let (consumed, code) = self.core.allocate_code(
            header_size,
            code_size,
            code_alignment,
            reserve_for_jump_stubs,
            location,
        )?;
        Ok(self.token(AddressRange::new(code, code_size), consumed, consumed.size()))
    }

    /// Undo the allocation behind `token`, zeroing its memory.
    ///
    /// The token is consumed whether or not the backout succeeds.
    ///
    /// # Errors
    ///
    /// - [`ContractViolation::BackoutForeignToken`] if another heap issued
    ///   the token.
    /// - [`ContractViolation::BackoutNotMostRecent`] if a later allocation
    ///   is still live.
    #[track_caller]
    pub fn backout(&mut self, token: ExplicitAllocation) -> Result<(), ArenaError> {
        if token.heap != self.core.id() {
            return Err(ContractViolation::BackoutForeignToken.into());
        }
        self.core
            .rewind(token.consumed, token.requested, Location::caller())
    }

    /// Hand over a reserved region for the next block.
    ///
    /// # Errors
    ///
    /// See [`UnlockedLoaderHeap::set_reserved_region`](crate::UnlockedLoaderHeap::set_reserved_region).
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

    /// Reserved bytes left in the current block.
    pub fn bytes_available_reserved(&self) -> usize {
        self.core.bytes_available_reserved()
    }

    /// Bytes committed over the heap's lifetime.
    pub fn total_committed(&self) -> usize {
        self.core.total_committed()
    }

    /// Bytes left behind in exhausted blocks.
    pub fn wasted_bytes(&self) -> usize {
        self.core.wasted_bytes()
    }

    /// Number of blocks in use.
    pub fn block_count(&self) -> usize {
        self.core.block_count()
    }

    /// Blocks in use, oldest first.
    pub fn blocks(&self) -> &[ArenaBlock] {
        self.core.blocks()
    }

    /// The event log, when call tracing is on.
    pub fn sniffer(&self) -> Option<&ArenaSniffer> {
        self.core.sniffer()
    }
}

/// A thread-safe [`ExplicitLoaderHeap`] whose allocations can be tracked.
#[derive(Debug)]
pub struct LockedExplicitLoaderHeap {
    id: HeapId,
    inner: Mutex<ExplicitLoaderHeap>,
}

// Compile-time assertion: LockedExplicitLoaderHeap must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<LockedExplicitLoaderHeap>();
};

impl LockedExplicitLoaderHeap {
    /// Wrap an explicit heap.
    pub fn new(heap: ExplicitLoaderHeap) -> Self {
        Self {
            id: heap.id(),
            inner: Mutex::new(heap),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExplicitLoaderHeap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This heap's unique ID.
    pub fn id(&self) -> HeapId {
        self.id
    }

    fn tagged(&self, token: ExplicitAllocation) -> TaggedAllocation<'_> {
        let consumed = token.consumed();
        TaggedAllocation::new(self, token.keep(), consumed.base(), consumed.size())
    }

    /// Allocate `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// See [`ExplicitLoaderHeap::allocate`].
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<TaggedAllocation<'_>, ArenaError> {
        let location = Location::caller();
        let token = self.lock().allocate_at(size, location)?;
        Ok(self.tagged(token))
    }

    /// Allocate a header and aligned code; the allocation's memory is the
    /// code range.
    ///
    /// # Errors
    ///
    /// See [`ExplicitLoaderHeap::allocate_code`].
    #[track_caller]
    pub fn allocate_code(
        &self,
        header_size: usize,
        code_size: usize,
        code_alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Result<TaggedAllocation<'_>, ArenaError> {
        let location = Location::caller();
        let token = self.lock().allocate_code_at(
            header_size,
            code_size,
            code_alignment,
            reserve_for_jump_stubs,
            location,
        )?;
        Ok(self.tagged(token))
    }

    /// Hand over a reserved region for the next block.
    ///
    /// # Errors
    ///
    /// See [`ExplicitLoaderHeap::set_reserved_region`].
    pub fn set_reserved_region(
        &self,
        range: AddressRange,
        release_on_drop: bool,
    ) -> Result<(), ArenaError> {
        self.lock().set_reserved_region(range, release_on_drop)
    }

    /// Run `f` with the heap locked.
    pub fn with_unlocked<R>(&self, f: impl FnOnce(&mut ExplicitLoaderHeap) -> R) -> R {
        f(&mut self.lock())
    }

    /// The next address the bump pointer will hand out.
    pub fn alloc_ptr(&self) -> Address {
        self.lock().alloc_ptr()
    }

    /// Take the explicit heap back.
    pub fn into_inner(self) -> ExplicitLoaderHeap {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackoutTarget for LockedExplicitLoaderHeap {
    fn heap_id(&self) -> HeapId {
        self.id
    }

    /// `memory` and `requested_size` are the consumed range recorded in
    /// the tagged allocation, header and padding included.
    fn backout_allocation(
        &self,
        memory: Address,
        requested_size: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError> {
        let consumed = AddressRange::new(memory, requested_size);
        self.lock().core.rewind(consumed, requested_size, location)
    }
}
