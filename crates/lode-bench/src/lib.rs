//! Benchmark fixtures for the lode loader heaps.
//!
//! - [`bench_heap`]: a locked default-policy heap over a fresh [`SimulatedVm`]
//! - [`populated_index`]: a [`RangeIndex`] holding `n` disjoint ranges

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use lode_arena::{HeapBuilder, LoaderHeap};
use lode_core::{Address, HeapConfig, OwnerId};
use lode_range::{RangeIndex, RangeIndexConfig};
use lode_vm::SimulatedVm;

/// Spacing between ranges in [`populated_index`].
pub const RANGE_STRIDE: usize = 0x1_0000;

/// Base address of the first range in [`populated_index`].
pub const RANGE_BASE: usize = 0x1000_0000;

/// Build a locked default-policy heap with diagnostics off.
///
/// Blocks are 1 MiB so that benchmark loops rarely cross into a new one.
pub fn bench_heap() -> LoaderHeap {
    let config = HeapConfig {
        reserve_block_size: 1024 * 1024,
        commit_block_size: 64 * 1024,
        validation_tags: false,
        call_tracing: false,
        ..HeapConfig::new()
    };
    HeapBuilder::new(Arc::new(SimulatedVm::new()))
        .config(config)
        .build_locked()
        .unwrap()
}

/// Build an index with `n` ranges of half a stride each, owner `i + 1`.
pub fn populated_index(n: usize) -> Arc<RangeIndex> {
    let blocks = n / lode_range::SLOTS_PER_BLOCK + 2;
    let index = RangeIndex::new(RangeIndexConfig { max_blocks: blocks }).into_shared();
    {
        let mut writer = index.writer();
        for i in 0..n {
            let start = Address(RANGE_BASE + i * RANGE_STRIDE);
            let owner = OwnerId::new(i as u64 + 1).unwrap();
            writer
                .add(start, start.offset(RANGE_STRIDE / 2), owner)
                .unwrap();
        }
    }
    index
}
