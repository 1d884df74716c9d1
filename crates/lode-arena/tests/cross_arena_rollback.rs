//! Integration test: all-or-nothing rollback across several heaps.
//!
//! A load sequence allocates from several locked heaps through one
//! `AllocationTracker`, mixing the default, explicit and interleaved
//! policies. When the sequence fails before `commit`, every tracked
//! allocation must come back, most recent first, and each heap's
//! allocation pointer must return to where it started.

use std::cell::RefCell;
use std::panic::Location;
use std::sync::Arc;

use lode_arena::{
    AllocationTracker, ArenaError, BackoutTarget, HeapBuilder, LoaderHeap,
    LockedExplicitLoaderHeap, LockedInterleavedLoaderHeap, TaggedAllocation, GUARD_BYTE,
};
use lode_core::{Address, AddressRange, FaultSite, HeapConfig, HeapId};
use lode_test_utils::{init_tracing, FailAfter, FailNth};
use lode_vm::{SimulatedVm, VirtualMemory, VmError};

fn config() -> HeapConfig {
    HeapConfig {
        reserve_block_size: 64 * 1024,
        validation_tags: true,
        ..HeapConfig::new()
    }
}

fn heap(vm: &Arc<SimulatedVm>) -> LoaderHeap {
    let heap = HeapBuilder::new(vm.clone())
        .config(config())
        .build_locked()
        .unwrap();
    // Reserve the first block so alloc_ptr is meaningful.
    heap.allocate(8).unwrap().memory();
    heap
}

/// Forwards to a heap and records the order backouts arrive in.
#[derive(Debug)]
struct Logged<'a> {
    name: &'static str,
    heap: &'a LoaderHeap,
    log: &'a RefCell<Vec<&'static str>>,
}

impl Logged<'_> {
    fn allocate(&self, size: usize) -> Result<TaggedAllocation<'_>, ArenaError> {
        let memory = self.heap.allocate(size)?.memory();
        Ok(TaggedAllocation::new(self, memory, memory.base(), size))
    }
}

impl BackoutTarget for Logged<'_> {
    fn heap_id(&self) -> HeapId {
        self.heap.id()
    }

    fn backout_allocation(
        &self,
        memory: Address,
        requested_size: usize,
        location: &'static Location<'static>,
    ) -> Result<(), ArenaError> {
        self.log.borrow_mut().push(self.name);
        self.heap
            .backout_allocation(memory, requested_size, location)
    }
}

#[test]
fn failed_sequence_rolls_back_newest_first() {
    init_tracing();
    let vm = Arc::new(SimulatedVm::new());
    let (a, b) = (heap(&vm), heap(&vm));
    let log = RefCell::new(Vec::new());
    let la = Logged {
        name: "a",
        heap: &a,
        log: &log,
    };
    let lb = Logged {
        name: "b",
        heap: &b,
        log: &log,
    };
    let (a_start, b_start) = (a.alloc_ptr(), b.alloc_ptr());

    {
        let mut tracker = AllocationTracker::new();
        tracker.track(la.allocate(128)).unwrap();
        tracker.track(la.allocate(128)).unwrap();
        tracker.track(lb.allocate(256)).unwrap();
        assert_eq!(tracker.len(), 3);
        assert!(a.alloc_ptr() > a_start);
        // The sequence fails here; the tracker goes out of scope uncommitted.
    }

    assert_eq!(*log.borrow(), vec!["b", "a", "a"]);
    assert_eq!(b.alloc_ptr(), b_start);
    assert_eq!(a.alloc_ptr(), a_start);
    assert_eq!(a.with_unlocked(|h| h.free_bytes()), 0);
}

#[test]
fn error_midway_through_a_load_releases_earlier_steps() {
    init_tracing();
    let vm = Arc::new(SimulatedVm::new());
    let a = heap(&vm);
    let b = HeapBuilder::new(vm.clone())
        .config(config())
        // Call 0 is the warm-up below; call 1 is the tracked allocation.
        .fault_injector(Arc::new(FailNth::new(Some(FaultSite::Allocate), 1)))
        .build_locked()
        .unwrap();
    b.allocate(8).unwrap().memory();
    let a_start = a.alloc_ptr();

    fn load(a: &LoaderHeap, b: &LoaderHeap) -> Result<(), ArenaError> {
        let mut tracker = AllocationTracker::new();
        tracker.track(a.allocate(128))?;
        tracker.track(a.allocate_aligned(100, 64))?;
        tracker.track(b.allocate(256))?;
        tracker.commit();
        Ok(())
    }

    let err = load(&a, &b).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(a.alloc_ptr(), a_start);
    assert_eq!(a.with_unlocked(|h| h.free_bytes()), 0);
}

#[test]
fn rollback_around_untracked_allocations_reuses_addresses() {
    let vm = Arc::new(SimulatedVm::new());
    let heap = heap(&vm);
    let (x, y) = {
        let mut tracker = AllocationTracker::new();
        let x = tracker.track(heap.allocate(64)).unwrap();
        // Someone else allocates in between; this one is kept.
        heap.allocate(32).unwrap().memory();
        let y = tracker.track(heap.allocate(64)).unwrap();
        (x, y)
    };

    assert_eq!(heap.alloc_ptr(), y.base());
    assert!(heap.with_unlocked(|h| h.is_free(x.base())));
    assert_eq!(heap.allocate(64).unwrap().memory(), x);
    assert_eq!(heap.allocate(64).unwrap().memory(), y);
}

#[test]
fn committed_tracker_changes_nothing_on_drop() {
    let vm = Arc::new(SimulatedVm::new());
    let heap = heap(&vm);
    let mut kept = Vec::new();
    {
        let mut tracker = AllocationTracker::new();
        for size in [16, 24, 200, 4096, 8] {
            kept.push(tracker.track(heap.allocate(size)).unwrap());
        }
        tracker.commit();
        assert!(tracker.track(heap.allocate(8)).is_err());
    }
    let after_commit = heap.alloc_ptr();
    assert!(after_commit >= kept.last().unwrap().end());
    assert_eq!(heap.with_unlocked(|h| h.free_bytes()), 0);

    let next = heap.allocate(8).unwrap().memory();
    assert!(kept.iter().all(|r| !r.overlaps(&next)));
}

#[test]
fn refused_tracker_record_backs_the_allocation_out() {
    let vm = Arc::new(SimulatedVm::new());
    let heap = heap(&vm);
    let start = heap.alloc_ptr();
    let refuse = Arc::new(FailAfter::always(FaultSite::TrackerRecord));
    let mut tracker = AllocationTracker::new().with_fault_injector(refuse);
    let err = tracker.track(heap.allocate(128)).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(tracker.is_empty());
    assert_eq!(heap.alloc_ptr(), start);
}

fn explicit(vm: &Arc<SimulatedVm>) -> LockedExplicitLoaderHeap {
    let heap = HeapBuilder::new(vm.clone()).build_explicit_locked().unwrap();
    let size = SimulatedVm::DEFAULT_GRANULARITY;
    let region = AddressRange::new(vm.reserve(size).unwrap(), size);
    heap.set_reserved_region(region, true).unwrap();
    heap.allocate(8).unwrap().memory();
    heap
}

fn interleaved(vm: &Arc<SimulatedVm>) -> LockedInterleavedLoaderHeap {
    let heap = HeapBuilder::new(vm.clone())
        .config(HeapConfig {
            reserve_block_size: 64 * 1024,
            ..HeapConfig::new()
        })
        .build_interleaved_locked(
            |vm: &dyn VirtualMemory, code: AddressRange, _: AddressRange| -> Result<(), VmError> {
                vm.write(code.base(), &[0xC3])
            },
        )
        .unwrap();
    heap.allocate(8).unwrap().memory();
    heap
}

#[test]
fn rollback_spans_every_heap_policy() {
    init_tracing();
    let vm = Arc::new(SimulatedVm::new());
    let (default, explicit, interleaved) = (heap(&vm), explicit(&vm), interleaved(&vm));
    let starts = (
        default.alloc_ptr(),
        explicit.alloc_ptr(),
        interleaved.alloc_ptr(),
    );

    fn load(
        default: &LoaderHeap,
        explicit: &LockedExplicitLoaderHeap,
        interleaved: &LockedInterleavedLoaderHeap,
    ) -> Result<(), ArenaError> {
        let mut tracker = AllocationTracker::new();
        tracker.track(explicit.allocate(64))?;
        tracker.track(default.allocate(128))?;
        tracker.track(interleaved.allocate(32))?;
        tracker.track(explicit.allocate_code(16, 100, 32, 0))?;
        tracker.track(interleaved.allocate(48))?;
        // Larger than a page: the interleaved heap refuses.
        tracker.track(interleaved.allocate(1 << 20))?;
        tracker.commit();
        Ok(())
    }

    assert!(load(&default, &explicit, &interleaved).is_err());
    assert_eq!(default.alloc_ptr(), starts.0);
    assert_eq!(explicit.alloc_ptr(), starts.1);
    assert_eq!(interleaved.alloc_ptr(), starts.2);
    assert_eq!(default.with_unlocked(|h| h.free_bytes()), 0);
}

#[test]
fn committed_sequence_keeps_every_policy_allocation() {
    let vm = Arc::new(SimulatedVm::new());
    let (default, explicit, interleaved) = (heap(&vm), explicit(&vm), interleaved(&vm));
    let kept = {
        let mut tracker = AllocationTracker::new();
        let kept = [
            tracker.track(explicit.allocate(64)).unwrap(),
            tracker.track(default.allocate(64)).unwrap(),
            tracker.track(interleaved.allocate(64)).unwrap(),
        ];
        tracker.commit();
        kept
    };
    assert_eq!(explicit.alloc_ptr(), kept[0].end());
    assert_eq!(default.alloc_ptr(), kept[1].end());
    assert_eq!(interleaved.alloc_ptr(), kept[2].end());
}

#[test]
fn explicit_allocation_behind_the_trackers_back_is_left_in_place() {
    init_tracing();
    let vm = Arc::new(SimulatedVm::new());
    let heap = explicit(&vm);
    let (tracked, untracked) = {
        let mut tracker = AllocationTracker::new();
        let tracked = tracker.track(heap.allocate(64)).unwrap();
        let untracked = heap.allocate(16).unwrap().memory();
        (tracked, untracked)
    };

    // The tracked allocation is no longer the most recent, so its backout
    // is refused and both allocations stay.
    assert_eq!(heap.alloc_ptr(), untracked.end());
    assert!(tracked.end() <= untracked.base());
}

#[test]
fn rolled_back_guarded_memory_is_guarded_again_on_reuse() {
    let vm = Arc::new(SimulatedVm::new());
    let heap = HeapBuilder::new(vm.clone())
        .config(HeapConfig {
            debug_boundary: 16,
            call_tracing: true,
            ..config()
        })
        .build_locked()
        .unwrap();
    heap.allocate(8).unwrap().memory();
    let start = heap.alloc_ptr();

    let first = {
        let mut tracker = AllocationTracker::new();
        let first = tracker.track(heap.allocate(40)).unwrap();
        tracker.track(heap.allocate(40)).unwrap();
        first
    };
    assert_eq!(heap.alloc_ptr(), start);

    let again = heap.allocate(40).unwrap().memory();
    assert_eq!(again, first);
    let mut guard = [0u8; 16];
    vm.read(again.end(), &mut guard).unwrap();
    assert_eq!(guard, [GUARD_BYTE; 16]);
    assert_eq!(heap.validate(again.base()), Some(true));

    vm.write(again.end(), &[0]).unwrap();
    assert_eq!(heap.validate(again.base()), Some(false));
}
