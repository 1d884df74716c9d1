//! The reserve-then-commit bump allocator behind every heap policy.
//!
//! A heap owns a chain of reserved blocks and bump-allocates from the
//! committed prefix of the newest one:
//!
//! ```text
//!   block base            alloc_ptr      end_committed          end_reserved
//!   |=== handed out ===|--- committed ---|....... reserved .......|
//! ```
//!
//! When the committed room runs out the heap commits more of the current
//! block; when the block is used up it reserves a new one and the unused
//! committed tail of the old block goes to the free list (or is counted as
//! wasted). Interleaved heaps commit a code page and the data page after it
//! as a pair, and allocate only from the code page.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use lode_core::{
    align_up, Address, AddressRange, FaultSite, HeapConfig, HeapId, OwnerId, SharedInjector,
    ALLOC_ALIGN,
};
use lode_range::RangeIndex;
use lode_vm::{AddressSpaceReserver, Protection, ReserveError, SharedVm, VirtualMemory, VmError};

use crate::block::{ArenaBlock, BlockChain, Placement};
use crate::error::{ArenaError, ContractViolation};
use crate::freelist::{FreeList, MIN_BLOCK};
use crate::guard::{BoundaryGuard, GUARD_BYTE};
use crate::interleaved::CodePageGenerator;
use crate::sniffer::{ArenaSniffer, EventKind};
use crate::tags::ValidationTags;

/// Which pages a heap commits and how it hands them out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeapKind {
    /// Read-write data pages.
    Data,
    /// Read-execute pages, made writable only while being scrubbed.
    Executable,
    /// Alternating read-execute code pages and read-write data pages.
    Interleaved,
}

/// Everything a builder hands to a new heap.
pub(crate) struct HeapParts {
    pub(crate) vm: SharedVm,
    pub(crate) config: HeapConfig,
    pub(crate) placement: Placement,
    pub(crate) injector: SharedInjector,
    pub(crate) range_index: Option<Arc<RangeIndex>>,
    pub(crate) reserved_region: Option<ArenaBlock>,
}

/// Result of an aligned allocation.
///
/// The bytes in front of `memory` are part of the allocation: a backout
/// must cover `extra` bytes before `memory.base()` and `extra` more bytes
/// of size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignedAllocation {
    /// The aligned user memory, `requested` bytes long.
    pub memory: AddressRange,
    /// Padding in front of `memory` that belongs to the allocation.
    pub extra: usize,
}

impl AlignedAllocation {
    /// Start address to pass to a backout.
    pub fn backout_address(&self) -> Address {
        Address(self.memory.base().get() - self.extra)
    }

    /// Size to pass to a backout.
    pub fn backout_size(&self) -> usize {
        self.memory.size() + self.extra
    }
}

pub(crate) struct BumpHeap {
    id: HeapId,
    kind: HeapKind,
    explicit: bool,
    vm: SharedVm,
    reserver: AddressSpaceReserver,
    placement: Placement,
    config: HeapConfig,
    page_size: usize,
    alloc_ptr: Address,
    end_committed: Address,
    end_reserved: Address,
    chain: BlockChain,
    reserved_region: Option<ArenaBlock>,
    free_list: FreeList,
    total_committed: usize,
    wasted: usize,
    injector: SharedInjector,
    generator: Option<Box<dyn CodePageGenerator>>,
    sniffer: Option<ArenaSniffer>,
    tags: Option<ValidationTags>,
}

impl BumpHeap {
    pub(crate) fn new(
        parts: HeapParts,
        kind: HeapKind,
        explicit: bool,
        generator: Option<Box<dyn CodePageGenerator>>,
    ) -> Self {
        let id = HeapId::next();
        let registration = parts
            .range_index
            .map(|index| (index, OwnerId::from(id)));
        let reserver =
            AddressSpaceReserver::new(parts.vm.clone()).with_fault_injector(parts.injector.clone());
        let sniffer = parts
            .config
            .call_tracing
            .then(|| ArenaSniffer::new().with_fault_injector(parts.injector.clone()));
        // Explicit and interleaved heaps have no room for per-allocation tags.
        let tags = (parts.config.validation_tags && !explicit && kind != HeapKind::Interleaved)
            .then(ValidationTags::new);
        Self {
            id,
            kind,
            explicit,
            page_size: parts.vm.page_size(),
            chain: BlockChain::new(parts.vm.clone(), registration),
            vm: parts.vm,
            reserver,
            placement: parts.placement,
            config: parts.config,
            alloc_ptr: Address::NULL,
            end_committed: Address::NULL,
            end_reserved: Address::NULL,
            reserved_region: parts.reserved_region,
            free_list: FreeList::new(),
            total_committed: 0,
            wasted: 0,
            injector: parts.injector,
            generator,
            sniffer,
            tags,
        }
    }

    pub(crate) fn id(&self) -> HeapId {
        self.id
    }

    pub(crate) fn kind(&self) -> HeapKind {
        self.kind
    }

    pub(crate) fn vm(&self) -> &SharedVm {
        &self.vm
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes actually consumed by a request of `requested` bytes.
    pub(crate) fn total_size(&self, requested: usize) -> Result<usize, ArenaError> {
        if self.kind == HeapKind::Interleaved {
            let total =
                align_up(requested.max(1), ALLOC_ALIGN).ok_or(ArenaError::oom(requested))?;
            if total > self.page_size {
                return Err(ContractViolation::AllocationTooLarge {
                    requested,
                    max: self.page_size,
                }
                .into());
            }
            return Ok(total);
        }
        requested
            .checked_add(self.config.debug_boundary)
            .and_then(|n| align_up(n, ALLOC_ALIGN))
            .map(|n| n.max(ALLOC_ALIGN))
            .ok_or(ArenaError::oom(requested))
    }

    fn check_injected(&self, requested: usize) -> Result<(), ArenaError> {
        if self.injector.should_fail(FaultSite::Allocate) {
            tracing::warn!(heap = %self.id, requested, "injected allocation fault");
            return Err(ArenaError::oom(requested));
        }
        Ok(())
    }

    /// Bump-allocate `requested` bytes, consulting the free list first.
    ///
    /// Returns the whole consumed range, which starts at the user address.
    pub(crate) fn allocate(
        &mut self,
        requested: usize,
        location: &'static Location<'static>,
    ) -> Result<AddressRange, ArenaError> {
        self.check_injected(requested)?;
        let total = self.total_size(requested)?;
        let consumed = match self.take_free(total)? {
            Some(block) => block,
            None => {
                self.ensure_room(total)?;
                self.bump(total)
            }
        };
        self.fill_guard(consumed.base(), requested);
        self.record_alloc(consumed, requested, location);
        Ok(consumed)
    }

    /// Allocate `requested` bytes at a power-of-two `alignment`.
    ///
    /// Room is made for the worst-case padding before the start address is
    /// known, so the request never straddles a block boundary.
    pub(crate) fn allocate_aligned(
        &mut self,
        requested: usize,
        alignment: usize,
        location: &'static Location<'static>,
    ) -> Result<AlignedAllocation, ArenaError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ContractViolation::InvalidAlignment { alignment }.into());
        }
        self.check_injected(requested)?;
        let worst = requested
            .checked_add(alignment)
            .ok_or(ArenaError::oom(requested))?;
        let room = self.total_size(worst)?;
        self.ensure_room(room)?;

        let start = self.alloc_ptr;
        let misalignment = start.get() & (alignment - 1);
        let extra = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        let tagged = requested + extra;
        let consumed = self.bump(self.total_size(tagged)?);
        self.fill_guard(consumed.base(), tagged);
        self.record_alloc(consumed, tagged, location);
        Ok(AlignedAllocation {
            memory: AddressRange::new(start.offset(extra), requested),
            extra,
        })
    }

    /// Allocate `header_size` bytes followed by `code_size` bytes of code
    /// starting at `code_alignment`, keeping `reserve_for_jump_stubs` bytes
    /// of committed room free behind it.
    ///
    /// Returns the consumed range and the code start.
    pub(crate) fn allocate_code(
        &mut self,
        header_size: usize,
        code_size: usize,
        code_alignment: usize,
        reserve_for_jump_stubs: usize,
        location: &'static Location<'static>,
    ) -> Result<(AddressRange, Address), ArenaError> {
        if code_alignment == 0 || !code_alignment.is_power_of_two() {
            return Err(ContractViolation::InvalidAlignment {
                alignment: code_alignment,
            }
            .into());
        }
        self.check_injected(code_size)?;
        let room = header_size
            .checked_add(code_size)
            .and_then(|n| n.checked_add(code_alignment - 1))
            .and_then(|n| n.checked_add(reserve_for_jump_stubs))
            .ok_or(ArenaError::oom(code_size))?;
        self.ensure_room(room)?;

        let start = self.alloc_ptr;
        let code = start
            .offset(header_size)
            .align_up(code_alignment)
            .ok_or(ArenaError::oom(code_size))?;
        let end = code.offset(code_size);
        self.alloc_ptr = end;
        let consumed = AddressRange::new(start, end.distance_from(start));
        self.record_alloc(consumed, consumed.size(), location);
        Ok((consumed, code))
    }

    fn take_free(&mut self, total: usize) -> Result<Option<AddressRange>, ArenaError> {
        if self.explicit {
            return Ok(None);
        }
        let Some(block) = self.free_list.take(total) else {
            return Ok(None);
        };
        if let Err(err) = self.scrub(block) {
            self.free_list.insert(block);
            return Err(err.into());
        }
        Ok(Some(block))
    }

    fn committed_room(&self) -> usize {
        self.end_committed.distance_from(self.alloc_ptr)
    }

    fn ensure_room(&mut self, size: usize) -> Result<(), ArenaError> {
        if self.committed_room() < size {
            self.grow(size)?;
        }
        if self.committed_room() < size {
            return Err(ArenaError::oom(size));
        }
        Ok(())
    }

    fn bump(&mut self, total: usize) -> AddressRange {
        let block = AddressRange::new(self.alloc_ptr, total);
        self.alloc_ptr = block.end();
        block
    }

    fn record_alloc(
        &mut self,
        consumed: AddressRange,
        requested: usize,
        location: &'static Location<'static>,
    ) {
        if let Some(tags) = self.tags.as_mut() {
            tags.insert(consumed.base(), requested, location);
        }
        if let Some(sniffer) = self.sniffer.as_mut() {
            sniffer.record(EventKind::Alloc, consumed, requested, location);
        }
        tracing::trace!(
            target: "lode::alloc",
            heap = %self.id,
            address = %consumed.base(),
            size = consumed.size()
        );
    }

    /// Make at least `min_size` bytes of committed room.
    fn grow(&mut self, min_size: usize) -> Result<(), ArenaError> {
        let page = self.page_size;
        if self.kind == HeapKind::Interleaved {
            // Skip the data page that follows the current code page.
            let has_pair = !self.alloc_ptr.is_null()
                && self.end_reserved.distance_from(self.end_committed) >= 3 * page;
            if has_pair {
                let code = self.end_committed.offset(page);
                self.commit_pair(code, min_size)?;
                self.retire_remainder();
                self.alloc_ptr = code;
                self.end_committed = code.offset(page);
                self.total_committed += 2 * page;
                return Ok(());
            }
        } else if min_size <= self.end_reserved.distance_from(self.alloc_ptr) {
            let uncommitted = self.end_reserved.distance_from(self.end_committed);
            let needed = self
                .alloc_ptr
                .offset(min_size)
                .distance_from(self.end_committed);
            let chunk = needed.max(self.config.commit_block_size.min(uncommitted));
            let chunk = align_up(chunk, page).map_or(uncommitted, |c| c.min(uncommitted));
            self.commit(AddressRange::new(self.end_committed, chunk), min_size)?;
            self.end_committed = self.end_committed.offset(chunk);
            self.total_committed += chunk;
            return Ok(());
        }

        let (block, committed) = self.reserve_block(min_size)?;
        self.retire_remainder();
        let base = block.range().base();
        self.alloc_ptr = base;
        self.end_reserved = block.range().end();
        self.end_committed = if self.kind == HeapKind::Interleaved {
            base.offset(page)
        } else {
            base.offset(committed)
        };
        self.total_committed += committed;
        Ok(())
    }

    /// Hand the unused committed tail of the current block to the free list.
    fn retire_remainder(&mut self) {
        let size = self.committed_room();
        if size == 0 {
            return;
        }
        if !self.explicit && size >= MIN_BLOCK {
            self.free_list
                .insert(AddressRange::new(self.alloc_ptr, size));
        } else {
            self.wasted += size;
        }
        self.alloc_ptr = self.end_committed;
    }

    /// Reserve and commit the first pages of a new block.
    ///
    /// Uses the caller-supplied region when it is big enough; explicit heaps
    /// never reserve on their own. Returns the block and how many bytes of
    /// it were committed.
    fn reserve_block(&mut self, min_size: usize) -> Result<(ArenaBlock, usize), ArenaError> {
        let page = self.page_size;
        let commit_size = if self.kind == HeapKind::Interleaved {
            2 * page
        } else {
            align_up(min_size, page).ok_or(ArenaError::oom(min_size))?
        };

        let supplied = match self.reserved_region.take() {
            Some(region) if region.range().size() >= commit_size => Some(region),
            other => {
                self.reserved_region = other;
                None
            }
        };
        let (block, caller_supplied) = match supplied {
            Some(region) => (region, true),
            None if self.explicit => {
                tracing::debug!(heap = %self.id, min_size, "no caller-supplied region fits");
                return Err(ArenaError::oom(min_size));
            }
            None => {
                let mut size = commit_size.max(self.config.reserve_block_size);
                if self.kind == HeapKind::Interleaved {
                    size = align_up(size, 2 * page).ok_or(ArenaError::oom(min_size))?;
                }
                let range = self
                    .placement
                    .reserve(&self.reserver, size)
                    .map_err(|err| reserve_failure(min_size, err))?;
                (ArenaBlock::new(range, true), false)
            }
        };

        let base = block.range().base();
        let committed = if self.kind == HeapKind::Interleaved {
            self.commit_pair(base, min_size)
        } else {
            self.commit(AddressRange::new(base, commit_size), min_size)
        };
        if let Err(err) = committed {
            if caller_supplied {
                self.reserved_region = Some(block);
            } else {
                self.vm.release(block.range());
            }
            return Err(err);
        }

        self.chain.push(block)?;
        tracing::debug!(
            heap = %self.id,
            block = %block.range(),
            committed = commit_size,
            caller_supplied,
            "reserved new block"
        );
        Ok((block, commit_size))
    }

    fn protection(&self) -> Protection {
        match self.kind {
            HeapKind::Executable => Protection::ReadExecute,
            HeapKind::Data | HeapKind::Interleaved => Protection::ReadWrite,
        }
    }

    fn commit(&self, range: AddressRange, requested: usize) -> Result<(), ArenaError> {
        if self.injector.should_fail(FaultSite::Commit) {
            tracing::warn!(heap = %self.id, %range, "injected commit fault");
            return Err(ArenaError::oom(requested));
        }
        self.vm
            .commit(range, self.protection())
            .map_err(|err| commit_failure(requested, err))?;
        tracing::debug!(heap = %self.id, %range, "committed pages");
        Ok(())
    }

    /// Commit the code page at `code` and the data page after it, let the
    /// generator fill the code page, then make it read-execute.
    fn commit_pair(&mut self, code: Address, requested: usize) -> Result<(), ArenaError> {
        if self.injector.should_fail(FaultSite::Commit) {
            tracing::warn!(heap = %self.id, %code, "injected commit fault");
            return Err(ArenaError::oom(requested));
        }
        let page = self.page_size;
        let code_page = AddressRange::new(code, page);
        let data_page = AddressRange::new(code.offset(page), page);
        let fail = |err| commit_failure(requested, err);
        self.vm.commit(code_page, Protection::ReadWrite).map_err(fail)?;
        self.vm.commit(data_page, Protection::ReadWrite).map_err(fail)?;
        if let Some(generator) = self.generator.as_mut() {
            generator
                .generate(self.vm.as_ref(), code_page, data_page)
                .map_err(fail)?;
        }
        self.vm
            .protect(code_page, Protection::ReadExecute)
            .map_err(fail)?;
        tracing::debug!(heap = %self.id, %code_page, %data_page, "committed interleaved pages");
        Ok(())
    }

    /// Run `write` against `range`, opening a temporary read-write window
    /// over its pages on executable heaps.
    fn with_writable(
        &self,
        range: AddressRange,
        write: impl FnOnce(&dyn VirtualMemory) -> Result<(), VmError>,
    ) -> Result<(), VmError> {
        if self.kind != HeapKind::Executable {
            return write(&*self.vm);
        }
        let start = range.base().align_down(self.page_size);
        let end = range
            .end()
            .align_up(self.page_size)
            .ok_or(VmError::InvalidArgument {
                reason: "write range overflows",
            })?;
        let pages = AddressRange::new(start, end.distance_from(start));
        self.vm.protect(pages, Protection::ReadWrite)?;
        let written = write(&*self.vm);
        self.vm.protect(pages, Protection::ReadExecute)?;
        written
    }

    /// Zero memory that is being handed back or handed out again.
    fn scrub(&self, range: AddressRange) -> Result<(), VmError> {
        if range.is_empty() {
            return Ok(());
        }
        match self.kind {
            HeapKind::Interleaved => self
                .vm
                .zero(AddressRange::new(range.base().offset(self.page_size), range.size())),
            HeapKind::Data | HeapKind::Executable => self.with_writable(range, |vm| vm.zero(range)),
        }
    }

    /// Guard checker for this heap, if it writes guard bytes.
    pub(crate) fn guard(&self) -> Option<BoundaryGuard<'_>> {
        let width = self.config.debug_boundary;
        (width > 0 && self.kind != HeapKind::Interleaved)
            .then(|| BoundaryGuard::new(&*self.vm, width))
    }

    /// Fill the guard bytes behind `requested` bytes at `base`.
    ///
    /// Best-effort: a failed write leaves the guard zeroed, which later
    /// validation reports as clobbered.
    fn fill_guard(&self, base: Address, requested: usize) {
        let Some(guard) = self.guard() else {
            return;
        };
        let range = guard.range(base, requested);
        let pattern = vec![GUARD_BYTE; range.size()];
        if let Err(err) = self.with_writable(range, |vm| vm.write(range.base(), &pattern)) {
            tracing::warn!(heap = %self.id, %range, %err, "could not write boundary guard");
        }
    }

    fn owns(&self, block: AddressRange) -> bool {
        self.chain
            .blocks()
            .iter()
            .any(|b| b.range().contains_range(&block))
    }

    /// Undo an allocation on a heap that keeps a free list.
    ///
    /// The most recent allocation is rewound in place; anything else goes
    /// to the free list. A null address is a no-op.
    pub(crate) fn backout(
        &mut self,
        memory: Address,
        requested: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError> {
        if memory.is_null() {
            return Ok(());
        }
        if let Some(tags) = &self.tags {
            tags.check(memory, requested)?;
        }
        let block = AddressRange::new(memory, self.total_size(requested)?);
        if !self.owns(block) {
            return Err(ContractViolation::InvalidBackout {
                address: memory,
                size: requested,
            }
            .into());
        }

        if self.alloc_ptr == block.end() {
            self.scrub(block)?;
            self.alloc_ptr = memory;
        } else {
            self.free_list.insert(block);
        }
        self.record_free(block, requested, location);
        Ok(())
    }

    /// Undo the most recent allocation on an explicit heap.
    pub(crate) fn rewind(
        &mut self,
        consumed: AddressRange,
        requested: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError> {
        if consumed.end() != self.alloc_ptr {
            return Err(ContractViolation::BackoutNotMostRecent {
                address: consumed.base(),
                alloc_ptr: self.alloc_ptr,
            }
            .into());
        }
        self.scrub(consumed)?;
        self.alloc_ptr = consumed.base();
        self.record_free(consumed, requested, location);
        Ok(())
    }

    fn record_free(
        &mut self,
        block: AddressRange,
        requested: usize,
        location: &'static Location<'static>,
    ) {
        if let Some(tags) = self.tags.as_mut() {
            tags.mark_freed(block.base());
        }
        if let Some(sniffer) = self.sniffer.as_mut() {
            sniffer.record(EventKind::Free, block, requested, location);
        }
        tracing::trace!(
            target: "lode::alloc",
            heap = %self.id,
            address = %block.base(),
            size = block.size(),
            "backout"
        );
    }

    pub(crate) fn set_reserved_region(
        &mut self,
        range: AddressRange,
        release_on_drop: bool,
    ) -> Result<(), ArenaError> {
        if self.reserved_region.is_some() {
            return Err(ContractViolation::ReservedRegionAlreadySet.into());
        }
        if !is_page_region(range, self.page_size) {
            return Err(ArenaError::Vm(VmError::InvalidArgument {
                reason: "reserved region must be a non-empty run of whole pages",
            }));
        }
        self.reserved_region = Some(ArenaBlock::new(range, release_on_drop));
        Ok(())
    }

    pub(crate) fn alloc_ptr(&self) -> Address {
        self.alloc_ptr
    }

    pub(crate) fn bytes_available_committed(&self) -> usize {
        self.committed_room()
    }

    pub(crate) fn bytes_available_reserved(&self) -> usize {
        self.end_reserved.distance_from(self.alloc_ptr)
    }

    pub(crate) fn total_committed(&self) -> usize {
        self.total_committed
    }

    pub(crate) fn total_reserved(&self) -> usize {
        self.chain.reserved_bytes()
    }

    pub(crate) fn wasted_bytes(&self) -> usize {
        self.wasted
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_list.total_bytes()
    }

    pub(crate) fn is_free(&self, address: Address) -> bool {
        self.free_list.covers(address)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.chain.len()
    }

    pub(crate) fn blocks(&self) -> &[ArenaBlock] {
        self.chain.blocks()
    }

    pub(crate) fn sniffer(&self) -> Option<&ArenaSniffer> {
        self.sniffer.as_ref()
    }

    pub(crate) fn sniffer_mut(&mut self) -> Option<&mut ArenaSniffer> {
        self.sniffer.as_mut()
    }

    pub(crate) fn tags(&self) -> Option<&ValidationTags> {
        self.tags.as_ref()
    }

    pub(crate) fn describe(&self, address: Address) -> Option<String> {
        self.sniffer
            .as_ref()?
            .describe(address, self.tags.as_ref(), self.guard().as_ref())
    }

    pub(crate) fn validate(&self, address: Address) -> Option<bool> {
        let sniffer = self.sniffer.as_ref()?;
        let event = sniffer.find_event(address)?;
        Some(sniffer.validate(event, self.tags.as_ref(), self.guard().as_ref()))
    }
}

impl fmt::Debug for BumpHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpHeap")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("explicit", &self.explicit)
            .field("alloc_ptr", &self.alloc_ptr)
            .field("end_committed", &self.end_committed)
            .field("end_reserved", &self.end_reserved)
            .field("blocks", &self.chain.len())
            .field("free_blocks", &self.free_list.len())
            .finish_non_exhaustive()
    }
}

impl Drop for BumpHeap {
    fn drop(&mut self) {
        if let Some(region) = self.reserved_region.take() {
            if region.release_on_drop() {
                self.vm.release(region.range());
            }
        }
    }
}

/// Whether `range` is a non-empty run of whole pages.
pub(crate) fn is_page_region(range: AddressRange, page_size: usize) -> bool {
    !range.is_empty() && range.base().is_aligned(page_size) && range.size() % page_size == 0
}

fn reserve_failure(requested: usize, err: ReserveError) -> ArenaError {
    tracing::debug!(requested, %err, "block reservation failed");
    let cause = match err {
        ReserveError::Os(vm) => Some(vm),
        _ => None,
    };
    ArenaError::OutOfMemory { requested, cause }
}

fn commit_failure(requested: usize, err: VmError) -> ArenaError {
    tracing::debug!(requested, %err, "commit failed");
    ArenaError::OutOfMemory {
        requested,
        cause: Some(err),
    }
}
