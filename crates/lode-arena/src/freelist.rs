//! First-fit free list for non-LIFO backouts on default-policy heaps.

use lode_core::{Address, AddressRange, ALLOC_ALIGN};

/// Smallest block the list will hold; also the minimum split remainder.
pub(crate) const MIN_BLOCK: usize = ALLOC_ALIGN;

/// Backed-out blocks awaiting reuse, kept in insertion order.
///
/// Insertion coalesces with a block that starts exactly where the new one
/// ends. No attempt is made to merge with a predecessor: the heap backs
/// allocations out in reverse order most of the time, so successor merges
/// catch the common case.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    blocks: Vec<AddressRange>,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add `block` to the list, merging with its immediate successor.
    pub(crate) fn insert(&mut self, block: AddressRange) {
        if block.size() < MIN_BLOCK {
            return;
        }
        if let Some(pos) = self.blocks.iter().position(|b| b.base() == block.end()) {
            let successor = self.blocks.remove(pos);
            self.blocks
                .insert(pos, AddressRange::new(block.base(), block.size() + successor.size()));
            return;
        }
        self.blocks.push(block);
    }

    /// Take the first block of at least `size` bytes.
    ///
    /// An exact fit is removed whole. A larger block is split when the
    /// remainder can stand on its own; otherwise the whole block is handed
    /// out and the returned range is the full block.
    pub(crate) fn take(&mut self, size: usize) -> Option<AddressRange> {
        let pos = self.blocks.iter().position(|b| b.size() >= size)?;
        let block = self.blocks[pos];
        let remainder = block.size() - size;
        if remainder >= MIN_BLOCK {
            self.blocks[pos] = AddressRange::new(block.base().offset(size), remainder);
            Some(AddressRange::new(block.base(), size))
        } else {
            self.blocks.remove(pos);
            Some(block)
        }
    }

    /// Whether any free block covers `address`.
    pub(crate) fn covers(&self, address: Address) -> bool {
        self.blocks.iter().any(|b| b.contains(address))
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.blocks.iter().map(AddressRange::size).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: usize, size: usize) -> AddressRange {
        AddressRange::new(Address(base), size)
    }

    #[test]
    fn exact_fit_removes_block() {
        let mut list = FreeList::new();
        list.insert(range(0x1000, 32));
        assert_eq!(list.take(32), Some(range(0x1000, 32)));
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn large_block_is_split() {
        let mut list = FreeList::new();
        list.insert(range(0x1000, 64));
        assert_eq!(list.take(16), Some(range(0x1000, 16)));
        assert_eq!(list.total_bytes(), 48);
        assert_eq!(list.take(48), Some(range(0x1010, 48)));
    }

    #[test]
    fn tiny_remainder_hands_out_whole_block() {
        let mut list = FreeList::new();
        list.insert(range(0x1000, 16 + MIN_BLOCK));
        let taken = list.take(17).unwrap();
        assert_eq!(taken.size(), 16 + MIN_BLOCK);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn insert_merges_with_successor() {
        let mut list = FreeList::new();
        list.insert(range(0x1020, 32));
        list.insert(range(0x1000, 32));
        assert_eq!(list.len(), 1);
        assert_eq!(list.take(64), Some(range(0x1000, 64)));
    }

    #[test]
    fn first_fit_skips_small_blocks() {
        let mut list = FreeList::new();
        list.insert(range(0x1000, 16));
        list.insert(range(0x2000, 64));
        assert_eq!(list.take(64), Some(range(0x2000, 64)));
        assert!(list.covers(Address(0x1008)));
        assert!(!list.covers(Address(0x2000)));
    }
}
