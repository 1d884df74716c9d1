//! The block-chained range index.
//!
//! Storage is a singly linked chain of fixed-capacity `RangeBlock`s. Each
//! slot is an [`ArcSwapOption`] holding either nothing (vacant) or an
//! immutable, fully built [`RangeEntry`], so a reader only ever sees a
//! vacant slot or a complete entry. The chain only ever grows: a block's
//! `next` link is a [`OnceLock`], written once and never cleared while the
//! index is alive, so a reader walking the chain can never follow a
//! dangling link.
//!
//! Writers serialize through [`RangeIndex::writer`], which returns a
//! [`RangeWriter`] guard owning the index's empty-slot cursor. The cursor
//! holds a handle to the block it points into, so an add resumes there
//! instead of walking from the head.

use std::iter;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use arc_swap::ArcSwapOption;

use lode_core::{Address, AddressRange, FaultSite, OwnerId, SharedInjector};

use crate::error::RangeError;

/// Number of entries stored per block.
pub const SLOTS_PER_BLOCK: usize = 10;

/// One registered range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry {
    start: Address,
    end: Address,
    owner: OwnerId,
}

impl RangeEntry {
    /// First address covered.
    pub fn start(&self) -> Address {
        self.start
    }

    /// One past the last address covered.
    pub fn end(&self) -> Address {
        self.end
    }

    /// The owner that registered the range.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The covered range.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start, self.end.distance_from(self.start))
    }

    fn covers(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }
}

struct RangeBlock {
    slots: [ArcSwapOption<RangeEntry>; SLOTS_PER_BLOCK],
    next: OnceLock<Arc<RangeBlock>>,
}

impl RangeBlock {
    fn new() -> Self {
        Self {
            slots: Default::default(),
            next: OnceLock::new(),
        }
    }

    fn next(&self) -> Option<&RangeBlock> {
        self.next.get().map(|b| &**b)
    }
}

/// Configuration for a [`RangeIndex`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeIndexConfig {
    /// Upper bound on the number of blocks, the first one included.
    pub max_blocks: usize,
}

impl RangeIndexConfig {
    /// Default block limit.
    pub const DEFAULT_MAX_BLOCKS: usize = 1 << 16;
}

impl Default for RangeIndexConfig {
    fn default() -> Self {
        Self {
            max_blocks: Self::DEFAULT_MAX_BLOCKS,
        }
    }
}

/// Where the next vacant-slot search starts.
struct WriterState {
    /// Block the search starts in; `None` is the head block.
    cursor: Option<Arc<RangeBlock>>,
    /// Chain position of the cursor block.
    cursor_block: usize,
    /// First slot of the cursor block to probe. `SLOTS_PER_BLOCK` means
    /// the block is known to be full.
    cursor_slot: usize,
    blocks: usize,
}

impl WriterState {
    fn rewind(&mut self) {
        self.cursor = None;
        self.cursor_block = 0;
        self.cursor_slot = 0;
    }
}

/// Concurrent-read address-range to owner index.
pub struct RangeIndex {
    head: RangeBlock,
    writer: Mutex<WriterState>,
    config: RangeIndexConfig,
    injector: Option<SharedInjector>,
}

// Compile-time assertion: RangeIndex must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RangeIndex>();
};

impl RangeIndex {
    /// Create an empty index with one block of capacity.
    pub fn new(config: RangeIndexConfig) -> Self {
        Self {
            head: RangeBlock::new(),
            writer: Mutex::new(WriterState {
                cursor: None,
                cursor_block: 0,
                cursor_slot: 0,
                blocks: 1,
            }),
            config,
            injector: None,
        }
    }

    /// Consult `injector` at [`FaultSite::RangeBlock`] before appending
    /// a block.
    pub fn with_fault_injector(mut self, injector: SharedInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Wrap in the shared handle heaps accept.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn blocks(&self) -> impl Iterator<Item = &RangeBlock> {
        iter::successors(Some(&self.head), |b| b.next())
    }

    /// Take the writer lock.
    pub fn writer(&self) -> RangeWriter<'_> {
        RangeWriter {
            index: self,
            state: self.writer.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Find the owner of the range containing `address`.
    ///
    /// Takes no lock. A concurrent writer's fresh entry may or may not be
    /// seen; a removed or never-added entry is never reported.
    pub fn lookup(&self, address: Address) -> Option<OwnerId> {
        self.blocks().find_map(|block| {
            block.slots.iter().find_map(|slot| match &*slot.load() {
                Some(entry) if entry.covers(address) => Some(entry.owner),
                _ => None,
            })
        })
    }

    /// Whether any registered range contains `address`.
    pub fn contains(&self, address: Address) -> bool {
        self.lookup(address).is_some()
    }

    /// Snapshot of every occupied slot, in chain order.
    pub fn entries(&self) -> Vec<RangeEntry> {
        self.blocks()
            .flat_map(|block| block.slots.iter())
            .filter_map(|slot| slot.load().as_deref().copied())
            .collect()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.blocks()
            .flat_map(|block| block.slots.iter())
            .filter(|slot| slot.load().is_some())
            .count()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    /// Register `[start, end) -> owner`, taking the writer lock.
    pub fn add(&self, start: Address, end: Address, owner: OwnerId) -> Result<(), RangeError> {
        self.writer().add(start, end, owner)
    }

    /// Remove every range registered by `owner`, taking the writer lock.
    pub fn remove(&self, owner: OwnerId) -> usize {
        self.writer().remove(owner)
    }

    /// Remove every range starting inside `[start, end)`, taking the writer
    /// lock.
    pub fn remove_window(&self, start: Address, end: Address) -> RemovalReport {
        self.writer().remove_window(start, end)
    }
}

impl Drop for RangeIndex {
    fn drop(&mut self) {
        // Unlink block by block; letting each block drop its successor
        // recurses once per block.
        self.writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cursor = None;
        let mut next = self.head.next.take();
        while let Some(block) = next {
            next = Arc::into_inner(block).and_then(|mut b| b.next.take());
        }
    }
}

impl Default for RangeIndex {
    fn default() -> Self {
        Self::new(RangeIndexConfig::default())
    }
}

impl std::fmt::Debug for RangeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIndex")
            .field("entries", &self.len())
            .field("blocks", &self.block_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`RangeWriter::remove_window`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Entries cleared.
    pub removed: usize,
    /// Cleared entries whose end ran past the window.
    pub straddling: usize,
}

/// Exclusive writer access to a [`RangeIndex`].
///
/// Holding this guard serializes all mutation; lookups proceed regardless.
pub struct RangeWriter<'a> {
    index: &'a RangeIndex,
    state: MutexGuard<'a, WriterState>,
}

impl RangeWriter<'_> {
    /// Register `[start, end) -> owner`.
    ///
    /// Fills the first vacant slot at or after the empty-slot hint,
    /// appending a block when every existing one is full. The entry is
    /// published with a single atomic store.
    ///
    /// # Errors
    ///
    /// [`RangeError::InvalidRange`] if `start >= end`, and
    /// [`RangeError::OutOfMemory`] if a block is needed but the configured
    /// limit is reached or the fault injector refuses.
    pub fn add(&mut self, start: Address, end: Address, owner: OwnerId) -> Result<(), RangeError> {
        if start >= end {
            return Err(RangeError::InvalidRange { start, end });
        }
        let entry = Arc::new(RangeEntry { start, end, owner });
        let index = self.index;

        let cursor = self.state.cursor.clone();
        let mut link = cursor.as_ref();
        let mut block_index = self.state.cursor_block;
        let mut first_slot = self.state.cursor_slot;
        loop {
            let block = link.map_or(&index.head, |b| &**b);
            let vacant = block
                .slots
                .iter()
                .enumerate()
                .skip(first_slot)
                .find(|(_, slot)| slot.load().is_none())
                .map(|(slot_index, _)| slot_index);
            if let Some(slot_index) = vacant {
                block.slots[slot_index].store(Some(entry));
                self.state.cursor = link.cloned();
                self.state.cursor_block = block_index;
                self.state.cursor_slot = slot_index + 1;
                return Ok(());
            }
            match block.next.get() {
                Some(next) => {
                    link = Some(next);
                    block_index += 1;
                    first_slot = 0;
                }
                None => break,
            }
        }

        // `link` is now the tail.
        let blocks = self.state.blocks;
        let refused = index
            .injector
            .as_ref()
            .is_some_and(|i| i.should_fail(FaultSite::RangeBlock));
        if blocks >= index.config.max_blocks || refused {
            self.state.cursor = link.cloned();
            self.state.cursor_block = block_index;
            self.state.cursor_slot = SLOTS_PER_BLOCK;
            return Err(RangeError::OutOfMemory { blocks });
        }

        // Populate slot 0 before the block becomes reachable.
        let fresh = Arc::new(RangeBlock::new());
        fresh.slots[0].store(Some(entry));
        let tail = link.map_or(&index.head, |b| &**b);
        tail.next.get_or_init(|| Arc::clone(&fresh));
        self.state.cursor = Some(fresh);
        self.state.cursor_block = block_index + 1;
        self.state.cursor_slot = 1;
        self.state.blocks += 1;
        tracing::debug!(blocks = self.state.blocks, "range index grew a block");
        Ok(())
    }

    /// Remove every range registered by `owner`. Returns how many were
    /// cleared.
    pub fn remove(&mut self, owner: OwnerId) -> usize {
        let removed = self.clear_where(|entry| entry.owner == owner);
        self.state.rewind();
        removed
    }

    /// Remove every range whose start lies in `[start, end)`.
    ///
    /// An entry starting in the window is expected to end inside it too
    /// (at most `end`). One that does not is still removed, counted in
    /// [`RemovalReport::straddling`] and logged.
    pub fn remove_window(&mut self, start: Address, end: Address) -> RemovalReport {
        let mut straddling = 0;
        let removed = self.clear_where(|entry| {
            let hit = entry.start >= start && entry.start < end;
            if hit && entry.end > end {
                straddling += 1;
                tracing::warn!(
                    entry_start = %entry.start,
                    entry_end = %entry.end,
                    window_start = %start,
                    window_end = %end,
                    "removed range extends past the removal window"
                );
            }
            hit
        });
        self.state.rewind();
        RemovalReport {
            removed,
            straddling,
        }
    }

    fn clear_where(&mut self, mut doomed: impl FnMut(&RangeEntry) -> bool) -> usize {
        let mut removed = 0;
        let index = self.index;
        for slot in index.blocks().flat_map(|block| block.slots.iter()) {
            let hit = matches!(&*slot.load(), Some(entry) if doomed(entry.as_ref()));
            if hit {
                slot.store(None);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_core::FaultInjector;
    use proptest::prelude::*;

    fn owner(n: u64) -> OwnerId {
        OwnerId::new(n).unwrap()
    }

    #[test]
    fn lookup_matches_half_open_ranges() {
        let index = RangeIndex::default();
        index.add(Address(100), Address(200), owner(1)).unwrap();
        assert_eq!(index.lookup(Address(100)), Some(owner(1)));
        assert_eq!(index.lookup(Address(199)), Some(owner(1)));
        assert_eq!(index.lookup(Address(200)), None);
        assert_eq!(index.lookup(Address(99)), None);
    }

    #[test]
    fn invalid_range_rejected() {
        let index = RangeIndex::default();
        let err = index.add(Address(5), Address(5), owner(1)).unwrap_err();
        assert!(matches!(err, RangeError::InvalidRange { .. }));
        assert!(index.is_empty());
    }

    #[test]
    fn grows_past_one_block() {
        let index = RangeIndex::default();
        for i in 0..25 {
            let base = 1000 * (i + 1);
            index
                .add(Address(base), Address(base + 10), owner(i as u64 + 1))
                .unwrap();
        }
        assert_eq!(index.block_count(), 3);
        assert_eq!(index.len(), 25);
        assert_eq!(index.lookup(Address(25_005)), Some(owner(25)));
    }

    #[test]
    fn block_limit_reports_out_of_memory() {
        let index = RangeIndex::new(RangeIndexConfig { max_blocks: 1 });
        for i in 0..SLOTS_PER_BLOCK {
            let base = 100 * (i + 1);
            index.add(Address(base), Address(base + 1), owner(1)).unwrap();
        }
        let err = index.add(Address(5000), Address(5001), owner(2)).unwrap_err();
        assert_eq!(err, RangeError::OutOfMemory { blocks: 1 });

        index.remove(owner(1));
        index.add(Address(5000), Address(5001), owner(2)).unwrap();
        assert_eq!(index.block_count(), 1);
    }

    #[derive(Debug)]
    struct RefuseBlocks;

    impl FaultInjector for RefuseBlocks {
        fn should_fail(&self, site: FaultSite) -> bool {
            site == FaultSite::RangeBlock
        }
    }

    #[test]
    fn injected_block_fault_reports_out_of_memory() {
        let index = RangeIndex::default().with_fault_injector(Arc::new(RefuseBlocks));
        for i in 0..SLOTS_PER_BLOCK {
            let base = 100 * (i + 1);
            index.add(Address(base), Address(base + 1), owner(1)).unwrap();
        }
        assert!(matches!(
            index.add(Address(5000), Address(5001), owner(2)),
            Err(RangeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn vacated_slots_are_reused() {
        let index = RangeIndex::default();
        for i in 0..SLOTS_PER_BLOCK {
            let base = 100 * (i + 1);
            index.add(Address(base), Address(base + 1), owner(1 + (i % 2) as u64)).unwrap();
        }
        assert_eq!(index.remove(owner(2)), SLOTS_PER_BLOCK / 2);
        for i in 0..SLOTS_PER_BLOCK / 2 {
            let base = 10_000 + 100 * i;
            index.add(Address(base), Address(base + 1), owner(3)).unwrap();
        }
        assert_eq!(index.block_count(), 1);
    }

    #[test]
    fn window_removal_counts_straddlers() {
        let index = RangeIndex::default();
        index.add(Address(100), Address(200), owner(1)).unwrap();
        index.add(Address(400), Address(600), owner(2)).unwrap();
        let report = index.remove_window(Address(0), Address(500));
        assert_eq!(
            report,
            RemovalReport {
                removed: 2,
                straddling: 1
            }
        );
        assert!(index.is_empty());
    }

    #[test]
    fn writer_guard_batches_mutations() {
        let index = RangeIndex::default();
        {
            let mut writer = index.writer();
            writer.add(Address(0x1000), Address(0x2000), owner(7)).unwrap();
            writer.add(Address(0x3000), Address(0x4000), owner(7)).unwrap();
            assert_eq!(index.lookup(Address(0x3800)), Some(owner(7)));
        }
        assert_eq!(index.remove(owner(7)), 2);
        assert_eq!(index.lookup(Address(0x1800)), None);
    }

    proptest! {
        #[test]
        fn added_ranges_are_found_and_removed(
            spans in prop::collection::vec((1usize..64, 1usize..64), 1..40),
            probe in 0usize..64,
        ) {
            let index = RangeIndex::default();
            let mut cursor = 0x1000;
            let mut ranges = Vec::new();
            for (i, (gap, len)) in spans.iter().enumerate() {
                let start = cursor + gap;
                let end = start + len;
                let id = owner(i as u64 % 3 + 1);
                index.add(Address(start), Address(end), id).unwrap();
                ranges.push((start, end, id));
                cursor = end;
            }

            for &(start, end, id) in &ranges {
                prop_assert_eq!(index.lookup(Address(start)), Some(id));
                prop_assert_eq!(index.lookup(Address(end - 1)), Some(id));
                let inside = start + probe % (end - start);
                prop_assert_eq!(index.lookup(Address(inside)), Some(id));
            }
            prop_assert_eq!(index.lookup(Address(cursor)), None);

            index.remove(owner(1));
            for &(start, end, id) in &ranges {
                let expected = if id == owner(1) { None } else { Some(id) };
                prop_assert_eq!(index.lookup(Address(start)), expected);
                prop_assert_eq!(index.lookup(Address(end - 1)), expected);
            }
        }
    }
}
