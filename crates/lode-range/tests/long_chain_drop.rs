//! Integration test: an index with a very long block chain.
//!
//! Fills 30,000 blocks through one writer guard, checks that lookups still
//! resolve at both ends of the chain and that vacated slots are reused,
//! then drops the index on the default test thread stack.

use lode_core::{Address, OwnerId};
use lode_range::{RangeIndex, SLOTS_PER_BLOCK};

const BLOCKS: usize = 30_000;

fn owner(n: u64) -> OwnerId {
    OwnerId::new(n).unwrap()
}

#[test]
fn dropping_a_long_chain_does_not_overflow_the_stack() {
    let index = RangeIndex::default();
    {
        let mut writer = index.writer();
        for i in 0..BLOCKS * SLOTS_PER_BLOCK {
            let base = 0x1000 + i * 0x10;
            writer
                .add(Address(base), Address(base + 0x10), owner(i as u64 % 7 + 1))
                .unwrap();
        }
    }
    assert_eq!(index.block_count(), BLOCKS);
    assert_eq!(index.lookup(Address(0x1000)), Some(owner(1)));
    let last = 0x1000 + (BLOCKS * SLOTS_PER_BLOCK - 1) * 0x10;
    assert!(index.lookup(Address(last)).is_some());

    drop(index);
}

#[test]
fn adds_after_removal_reuse_early_slots() {
    let index = RangeIndex::default();
    for i in 0..5 * SLOTS_PER_BLOCK {
        let base = 0x1000 + i * 0x10;
        index
            .add(Address(base), Address(base + 0x10), owner(i as u64 + 1))
            .unwrap();
    }
    assert_eq!(index.block_count(), 5);

    // Vacate the second slot of the first block.
    assert_eq!(index.remove(owner(2)), 1);
    index
        .add(Address(0x9_0000), Address(0x9_0100), owner(99))
        .unwrap();
    assert_eq!(index.block_count(), 5);
    assert_eq!(index.entries()[1].owner(), owner(99));

    // The chain is full again, so the next add appends a block.
    index
        .add(Address(0xA_0000), Address(0xA_0100), owner(100))
        .unwrap();
    assert_eq!(index.block_count(), 6);
    assert_eq!(index.lookup(Address(0xA_0000)), Some(owner(100)));
}
