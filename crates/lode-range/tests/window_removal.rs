//! Integration test: removing ranges by address window.
//!
//! Registers three components' ranges, removes everything starting in a
//! window that covers two of them, and checks that only the third remains
//! reachable by lookup.

use lode_core::{Address, OwnerId};
use lode_range::{RangeIndex, RemovalReport};

fn owner(n: u64) -> OwnerId {
    OwnerId::new(n).unwrap()
}

#[test]
fn window_removal_leaves_outside_ranges() {
    let (x, y, z) = (owner(1), owner(2), owner(3));
    let index = RangeIndex::default();
    index.add(Address(100), Address(200), x).unwrap();
    index.add(Address(200), Address(300), y).unwrap();
    index.add(Address(1000), Address(1100), z).unwrap();

    let report = index.remove_window(Address(0), Address(500));

    assert_eq!(
        report,
        RemovalReport {
            removed: 2,
            straddling: 0
        }
    );
    assert_eq!(index.lookup(Address(150)), None);
    assert_eq!(index.lookup(Address(250)), None);
    assert_eq!(index.lookup(Address(1050)), Some(z));
}

#[test]
fn window_end_is_exclusive_for_starts() {
    let index = RangeIndex::default();
    index.add(Address(500), Address(600), owner(1)).unwrap();

    let report = index.remove_window(Address(0), Address(500));

    assert_eq!(report.removed, 0);
    assert_eq!(index.lookup(Address(550)), Some(owner(1)));
}

#[test]
fn slots_freed_by_window_are_refilled_first() {
    let index = RangeIndex::default();
    for i in 0..10usize {
        let base = 100 * (i + 1);
        index.add(Address(base), Address(base + 50), owner(1)).unwrap();
    }
    index.remove_window(Address(0), Address(350));

    for i in 0..3usize {
        let base = 10_000 + 100 * i;
        index.add(Address(base), Address(base + 50), owner(2)).unwrap();
    }

    assert_eq!(index.block_count(), 1);
    assert_eq!(index.len(), 10);
}
