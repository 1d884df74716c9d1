//! All-or-nothing rollback for multi-step allocation sequences.
//!
//! Loading a component takes many allocations from several heaps. If any
//! step fails, every allocation made so far must be given back, or the
//! heaps leak memory nobody will ever own. An [`AllocationTracker`] records
//! each allocation as it is made and, unless [`commit`] is called, backs
//! all of them out in reverse order when it goes out of scope.
//!
//! ```text
//! let mut tracker = AllocationTracker::new();
//! let header = tracker.track(types.allocate(64))?;
//! let slots  = tracker.track(statics.allocate(256))?;   // fails -> header is backed out
//! tracker.commit();                                     // keep both
//! ```
//!
//! [`commit`]: AllocationTracker::commit

use std::fmt;
use std::panic::Location;

use smallvec::SmallVec;

use lode_core::{Address, AddressRange, FaultSite, HeapId, SharedInjector};

use crate::error::{ArenaError, ContractViolation};

/// A heap that can undo one of its allocations on behalf of a tracker.
pub trait BackoutTarget: fmt::Debug {
    /// The heap's unique ID.
    fn heap_id(&self) -> HeapId;

    /// Back out the allocation starting at `memory` of `requested_size`
    /// bytes, exactly as it was returned.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ContractViolation`] if no such allocation is live.
    fn backout_allocation(
        &self,
        memory: Address,
        requested_size: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError>;
}

/// An allocation that knows how to undo itself.
///
/// Returned by the allocation calls of [`LoaderHeap`](crate::LoaderHeap),
/// [`LockedExplicitLoaderHeap`](crate::LockedExplicitLoaderHeap) and
/// [`LockedInterleavedLoaderHeap`](crate::LockedInterleavedLoaderHeap) for
/// handing to [`AllocationTracker::track`]. Dropping it keeps the memory
/// allocated.
#[must_use = "dropping a tagged allocation keeps it allocated with nothing to back it out"]
#[derive(Clone, Copy, Debug)]
pub struct TaggedAllocation<'a> {
    heap: &'a dyn BackoutTarget,
    memory: AddressRange,
    backout_address: Address,
    backout_size: usize,
}

impl<'a> TaggedAllocation<'a> {
    /// Wrap an allocation made by `heap`.
    ///
    /// `backout_address` and `backout_size` are what `heap` needs to undo
    /// it, which may cover more than `memory` (alignment padding, say).
    pub fn new(
        heap: &'a dyn BackoutTarget,
        memory: AddressRange,
        backout_address: Address,
        backout_size: usize,
    ) -> Self {
        Self {
            heap,
            memory,
            backout_address,
            backout_size,
        }
    }

    /// The user memory.
    pub fn memory(&self) -> AddressRange {
        self.memory
    }

    /// The heap that made the allocation.
    pub fn heap_id(&self) -> HeapId {
        self.heap.heap_id()
    }

    /// Give the memory back immediately.
    ///
    /// # Errors
    ///
    /// See [`BackoutTarget::backout_allocation`].
    #[track_caller]
    pub fn backout(self) -> Result<(), ArenaError> {
        self.heap
            .backout_allocation(self.backout_address, self.backout_size, Location::caller())
    }
}

#[derive(Clone, Copy, Debug)]
struct Record<'a> {
    allocation: TaggedAllocation<'a>,
    location: &'static Location<'static>,
}

/// Records allocations and backs them out on drop unless committed.
///
/// Records are kept inline for the first sixteen allocations, which covers
/// nearly every load sequence without touching the global allocator.
pub struct AllocationTracker<'a> {
    records: SmallVec<[Record<'a>; 16]>,
    committed: bool,
    injector: Option<SharedInjector>,
}

impl<'a> AllocationTracker<'a> {
    /// Create an empty, uncommitted tracker.
    pub fn new() -> Self {
        Self {
            records: SmallVec::new(),
            committed: false,
            injector: None,
        }
    }

    /// Consult `injector` at [`FaultSite::TrackerRecord`] before recording.
    pub fn with_fault_injector(mut self, injector: SharedInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Record a successful allocation and return its memory.
    ///
    /// A failed allocation is passed through untouched. If the record
    /// itself cannot be stored, the allocation is backed out before the
    /// error is returned, so the caller never holds memory the tracker
    /// does not know about.
    ///
    /// # Errors
    ///
    /// - The allocation's own error, unchanged.
    /// - [`ArenaError::OutOfMemory`] if the record cannot be stored.
    /// - [`ContractViolation::TrackAfterCommit`] if the tracker was
    ///   already committed. The allocation is left in place.
    #[track_caller]
    pub fn track(
        &mut self,
        allocation: Result<TaggedAllocation<'a>, ArenaError>,
    ) -> Result<AddressRange, ArenaError> {
        let location = Location::caller();
        if self.committed {
            tracing::warn!(%location, "allocation tracked after tracker commit");
            return Err(ContractViolation::TrackAfterCommit.into());
        }
        let allocation = allocation?;

        let refused = self
            .injector
            .as_ref()
            .is_some_and(|i| i.should_fail(FaultSite::TrackerRecord));
        if refused || self.records.try_reserve(1).is_err() {
            let requested = allocation.memory().size();
            if let Err(err) = allocation.heap.backout_allocation(
                allocation.backout_address,
                allocation.backout_size,
                location,
            ) {
                tracing::warn!(%err, heap = %allocation.heap_id(), "backout of untracked allocation failed");
            }
            return Err(ArenaError::oom(requested));
        }

        self.records.push(Record {
            allocation,
            location,
        });
        Ok(allocation.memory())
    }

    /// Keep every tracked allocation. The tracker backs nothing out after
    /// this, and further `track` calls are rejected.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Whether [`commit`](Self::commit) has been called.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Number of allocations recorded.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AllocationTracker<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationTracker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTracker")
            .field("records", &self.records.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl Drop for AllocationTracker<'_> {
    fn drop(&mut self) {
        if self.committed || self.records.is_empty() {
            return;
        }
        tracing::debug!(allocations = self.records.len(), "rolling back tracked allocations");
        for record in self.records.drain(..).rev() {
            let allocation = record.allocation;
            if let Err(err) = allocation.heap.backout_allocation(
                allocation.backout_address,
                allocation.backout_size,
                record.location,
            ) {
                tracing::warn!(
                    %err,
                    heap = %allocation.heap_id(),
                    address = %allocation.backout_address,
                    "tracked allocation could not be backed out"
                );
            }
        }
    }
}
