//! Raw addresses and half-open address ranges.
//!
//! Loader heaps hand out memory as address ranges rather than typed
//! references: the heap only tracks where bytes live, never what they hold.
//! [`Address`] is a thin newtype over `usize` so that byte counts and
//! addresses cannot be mixed up by accident.

use std::fmt;

/// Alignment quantum applied to every loader-heap allocation.
///
/// Matches pointer alignment on the host so that every returned address is
/// suitable for storing a pointer.
pub const ALLOC_ALIGN: usize = std::mem::size_of::<usize>();

/// Round `value` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` on overflow.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` down to the previous multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
    value & !(align - 1)
}

/// A virtual address in the current process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub usize);

impl Address {
    /// The null address. Never returned by a successful allocation.
    pub const NULL: Address = Address(0);

    /// The raw numeric value.
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Advance by `bytes`, returning `None` on overflow.
    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Address> {
        self.0.checked_add(bytes).map(Address)
    }

    /// Move back by `bytes`, returning `None` on underflow.
    #[inline]
    pub fn checked_sub(self, bytes: usize) -> Option<Address> {
        self.0.checked_sub(bytes).map(Address)
    }

    /// Advance by `bytes`.
    ///
    /// # Panics
    ///
    /// Panics on address-space overflow; callers use this only for offsets
    /// already known to lie inside a reserved range.
    #[inline]
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// Number of bytes from `earlier` up to `self`, or 0 if `earlier` is
    /// above `self`.
    #[inline]
    pub fn distance_from(self, earlier: Address) -> usize {
        self.0.saturating_sub(earlier.0)
    }

    /// Round up to a multiple of `align` (a power of two).
    #[inline]
    pub fn align_up(self, align: usize) -> Option<Address> {
        align_up(self.0, align).map(Address)
    }

    /// Round down to a multiple of `align` (a power of two).
    #[inline]
    pub fn align_down(self, align: usize) -> Address {
        Address(align_down(self.0, align))
    }

    /// Whether this address is a multiple of `align` (a power of two).
    #[inline]
    pub fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<usize> for Address {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

/// A half-open byte range `[base, base + size)`.
///
/// Produced by address-space reservation and by every heap allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressRange {
    base: Address,
    size: usize,
}

impl AddressRange {
    /// Create a range starting at `base` spanning `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `base + size` overflows the address space.
    pub fn new(base: Address, size: usize) -> Self {
        assert!(
            base.checked_add(size).is_some(),
            "address range {base} + {size:#x} overflows the address space"
        );
        Self { base, size }
    }

    /// Create the range `[start, end)`, or `None` if `end < start`.
    pub fn from_bounds(start: Address, end: Address) -> Option<Self> {
        end.0.checked_sub(start.0).map(|size| Self { base: start, size })
    }

    /// First byte of the range.
    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Length of the range in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the range.
    #[inline]
    pub fn end(&self) -> Address {
        self.base.offset(self.size)
    }

    /// Whether the range spans zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `address` lies inside `[base, end)`.
    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Whether the two ranges share at least one byte.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.base < other.end() && other.base < self.end()
    }

    /// The sub-range starting `offset` bytes in and spanning `len` bytes,
    /// or `None` if it would run past the end of this range.
    pub fn subrange(&self, offset: usize, len: usize) -> Option<AddressRange> {
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        Some(AddressRange::new(self.base.offset(offset), len))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(usize::MAX, 8), None);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn address_arithmetic() {
        let a = Address(0x1000);
        assert_eq!(a.offset(0x10), Address(0x1010));
        assert_eq!(a.checked_sub(0x2000), None);
        assert_eq!(Address(0x1010).distance_from(a), 0x10);
        assert_eq!(a.distance_from(Address(0x1010)), 0);
        assert!(a.is_aligned(0x1000));
        assert!(!Address(0x1008).is_aligned(0x10));
        assert_eq!(format!("{a}"), "0x1000");
    }

    #[test]
    fn range_contains_half_open() {
        let r = AddressRange::new(Address(100), 100);
        assert!(r.contains(Address(100)));
        assert!(r.contains(Address(199)));
        assert!(!r.contains(Address(200)));
        assert!(!r.contains(Address(99)));
        assert_eq!(r.end(), Address(200));
    }

    #[test]
    fn range_overlap_and_subrange() {
        let a = AddressRange::new(Address(0), 10);
        let b = AddressRange::new(Address(10), 10);
        let c = AddressRange::new(Address(5), 10);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert_eq!(a.subrange(2, 3), Some(AddressRange::new(Address(2), 3)));
        assert_eq!(a.subrange(8, 3), None);
        assert!(a.contains_range(&AddressRange::new(Address(0), 10)));
        assert!(!a.contains_range(&c));
    }

    #[test]
    fn from_bounds_rejects_inverted() {
        assert!(AddressRange::from_bounds(Address(10), Address(5)).is_none());
        let r = AddressRange::from_bounds(Address(5), Address(10)).unwrap();
        assert_eq!(r.size(), 5);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn align_up_is_smallest_multiple(value in 0usize..1 << 40, shift in 0u32..16) {
                let align = 1usize << shift;
                let up = align_up(value, align).unwrap();
                prop_assert!(up >= value);
                prop_assert_eq!(up % align, 0);
                prop_assert!(up - value < align);
            }
        }
    }
}
