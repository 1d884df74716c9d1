//! Integration test: windowed reservation over a fragmented address space.
//!
//! Scatters foreign reservations across a window, then reserves until the
//! window is exhausted. Every reservation must sit inside the window, be
//! granularity-aligned and never overlap anything else.

use std::sync::Arc;

use lode_core::{Address, AddressRange};
use lode_vm::{AddressSpaceReserver, ReserveError, SimulatedVm, VirtualMemory};
use proptest::prelude::*;

const GRAN: usize = SimulatedVm::DEFAULT_GRANULARITY;
const WINDOW_BASE: usize = 0x1000_0000;
const WINDOW_GRANULES: usize = 64;

proptest! {
    #[test]
    fn window_reservations_never_overlap(
        occupied in prop::collection::btree_set(0..WINDOW_GRANULES, 0..24),
        request_granules in 1usize..4,
    ) {
        let vm = Arc::new(SimulatedVm::new());
        for &granule in &occupied {
            vm.occupy(AddressRange::new(Address(WINDOW_BASE + granule * GRAN), GRAN)).unwrap();
        }
        let reserver = AddressSpaceReserver::new(vm.clone());
        let min = Address(WINDOW_BASE);
        let max = Address(WINDOW_BASE + WINDOW_GRANULES * GRAN);

        let mut mine = Vec::new();
        loop {
            match reserver.reserve(Some(min), Some(max), request_granules * GRAN) {
                Ok(range) => {
                    prop_assert!(range.base() >= min && range.end() <= max);
                    prop_assert!(range.base().is_aligned(GRAN));
                    mine.push(range);
                }
                Err(ReserveError::Exhausted { .. }) => break,
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }

        let all = vm.reservations();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                prop_assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
        prop_assert_eq!(all.len(), occupied.len() + mine.len());

        // Exhaustion is genuine: no free run of the requested size is left.
        let mut run = 0;
        for granule in 0..WINDOW_GRANULES {
            let state = vm.query(Address(WINDOW_BASE + granule * GRAN)).unwrap().state;
            run = if state == lode_vm::RegionState::Free { run + 1 } else { 0 };
            prop_assert!(run < request_granules);
        }
    }
}

#[test]
fn releasing_reopens_the_window() {
    let vm = Arc::new(SimulatedVm::new());
    let reserver = AddressSpaceReserver::new(vm.clone());
    let min = Address(WINDOW_BASE);
    let max = Address(WINDOW_BASE + 2 * GRAN);

    let first = reserver.reserve(Some(min), Some(max), 2 * GRAN).unwrap();
    assert!(reserver.reserve(Some(min), Some(max), GRAN).is_err());

    vm.release(first);
    let again = reserver.reserve(Some(min), Some(max), 2 * GRAN).unwrap();
    assert_eq!(again, first);
}
