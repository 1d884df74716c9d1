//! A deterministic, in-process model of a virtual address space.
//!
//! [`SimulatedVm`] tracks reservations and committed pages in ordered maps
//! without touching real memory. Every heap test in the workspace runs
//! against it, which makes addresses reproducible across runs and lets
//! tests assert on exact reservation and commit state.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lode_core::{align_down, align_up, Address, AddressRange};

use crate::error::VmError;
use crate::vm::{Protection, RegionInfo, RegionState, VirtualMemory};

#[derive(Debug, Default)]
struct SimState {
    /// Reservation base -> size.
    reservations: BTreeMap<usize, usize>,
    /// Committed page base -> protection.
    pages: BTreeMap<usize, Protection>,
    /// Page base -> contents, materialized on first write.
    contents: BTreeMap<usize, Box<[u8]>>,
    zeroed_bytes: usize,
    queries: usize,
}

impl SimState {
    fn containing(&self, address: usize) -> Option<(usize, usize)> {
        self.reservations
            .range(..=address)
            .next_back()
            .filter(|(&base, &size)| address < base + size)
            .map(|(&base, &size)| (base, size))
    }

    fn all_pages(
        &self,
        range: AddressRange,
        page_size: usize,
        allowed: impl Fn(Protection) -> bool,
    ) -> bool {
        let start = align_down(range.base().get(), page_size);
        (start..range.end().get())
            .step_by(page_size)
            .all(|page| self.pages.get(&page).is_some_and(|&p| allowed(p)))
    }

    /// Visit `range` page by page as `(page base, offset in page, offset in
    /// range, length)` chunks.
    fn chunks(range: AddressRange, page_size: usize) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        let mut cursor = range.base().get();
        let end = range.end().get();
        std::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let page = align_down(cursor, page_size);
            let len = (page + page_size).min(end) - cursor;
            let chunk = (page, cursor - page, cursor - range.base().get(), len);
            cursor += len;
            Some(chunk)
        })
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        if self.containing(base).is_some() {
            return true;
        }
        self.reservations.range(base..base + size).next().is_some()
    }
}

/// Deterministic simulated address space.
#[derive(Debug)]
pub struct SimulatedVm {
    page_size: usize,
    granularity: usize,
    bounds: AddressRange,
    state: Mutex<SimState>,
}

impl SimulatedVm {
    /// Default page size: 4 KiB.
    pub const DEFAULT_PAGE_SIZE: usize = 4096;

    /// Default reservation granularity: 64 KiB.
    pub const DEFAULT_GRANULARITY: usize = 64 * 1024;

    /// Default lowest usable address.
    pub const DEFAULT_MIN_ADDRESS: usize = 0x1_0000;

    /// Default one-past-highest usable address.
    pub const DEFAULT_MAX_ADDRESS: usize = 0x7fff_ffff_0000;

    /// Create a simulated address space with the default layout.
    pub fn new() -> Self {
        let bounds = AddressRange::from_bounds(
            Address(Self::DEFAULT_MIN_ADDRESS),
            Address(Self::DEFAULT_MAX_ADDRESS),
        )
        .unwrap_or_else(|| AddressRange::new(Address(Self::DEFAULT_MIN_ADDRESS), 0));
        Self::with_layout(Self::DEFAULT_PAGE_SIZE, Self::DEFAULT_GRANULARITY, bounds)
    }

    /// Create a simulated address space with an explicit layout.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` or `granularity` is not a power of two, if the
    /// granularity is smaller than a page, or if `bounds` is not
    /// granularity-aligned.
    pub fn with_layout(page_size: usize, granularity: usize, bounds: AddressRange) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        assert!(
            granularity.is_power_of_two() && granularity >= page_size,
            "granularity must be a power of two no smaller than a page"
        );
        assert!(
            bounds.base().is_aligned(granularity) && bounds.end().is_aligned(granularity),
            "bounds {bounds} must be granularity-aligned"
        );
        Self {
            page_size,
            granularity,
            bounds,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn round_reservation(&self, size: usize) -> Result<usize, VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument {
                reason: "zero-sized reservation",
            });
        }
        align_up(size, self.granularity).ok_or(VmError::InvalidArgument {
            reason: "reservation size overflows",
        })
    }

    fn page_span(&self, range: AddressRange) -> Result<(usize, usize), VmError> {
        if range.is_empty() {
            return Err(VmError::InvalidArgument {
                reason: "empty page range",
            });
        }
        let start = align_down(range.base().get(), self.page_size);
        let end = align_up(range.end().get(), self.page_size).ok_or(VmError::InvalidArgument {
            reason: "page range overflows",
        })?;
        Ok((start, end))
    }

    /// Mark `range` as reserved by a foreign party, as another library or
    /// thread would. Used to build fragmented layouts for reservation tests.
    pub fn occupy(&self, range: AddressRange) -> Result<(), VmError> {
        self.reserve_at(range.base(), range.size()).map(|_| ())
    }

    /// Number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.state().reservations.len()
    }

    /// Live reservations in address order.
    pub fn reservations(&self) -> Vec<AddressRange> {
        self.state()
            .reservations
            .iter()
            .map(|(&base, &size)| AddressRange::new(Address(base), size))
            .collect()
    }

    /// Total committed bytes across all reservations.
    pub fn committed_bytes(&self) -> usize {
        self.state().pages.len() * self.page_size
    }

    /// Protection of the committed page containing `address`, if any.
    pub fn protection_of(&self, address: Address) -> Option<Protection> {
        let page = align_down(address.get(), self.page_size);
        self.state().pages.get(&page).copied()
    }

    /// Total bytes passed to [`VirtualMemory::zero`] so far.
    pub fn zeroed_bytes(&self) -> usize {
        self.state().zeroed_bytes
    }

    /// Number of [`VirtualMemory::query`] calls served so far.
    pub fn query_count(&self) -> usize {
        self.state().queries
    }
}

impl Default for SimulatedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for SimulatedVm {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocation_granularity(&self) -> usize {
        self.granularity
    }

    fn address_bounds(&self) -> AddressRange {
        self.bounds
    }

    fn query(&self, address: Address) -> Result<RegionInfo, VmError> {
        let mut state = self.state();
        state.queries += 1;
        let addr = address.get();
        if addr >= self.bounds.end().get() {
            return Err(VmError::QueryFailed { address });
        }
        let page = align_down(addr, self.page_size);

        if let Some((base, size)) = state.containing(addr) {
            let committed = |p: usize| state.pages.contains_key(&p);
            let first = committed(page);
            let mut end = page + self.page_size;
            while end < base + size && committed(end) == first {
                end += self.page_size;
            }
            let region_state = if first {
                RegionState::Committed
            } else {
                RegionState::Reserved
            };
            return Ok(RegionInfo {
                base: Address(page),
                size: end - page,
                state: region_state,
            });
        }

        let next = state
            .reservations
            .range(addr..)
            .next()
            .map(|(&base, _)| base)
            .unwrap_or(self.bounds.end().get());
        Ok(RegionInfo {
            base: Address(page),
            size: next - page,
            state: RegionState::Free,
        })
    }

    fn reserve(&self, size: usize) -> Result<Address, VmError> {
        let size = self.round_reservation(size)?;
        let mut state = self.state();
        let mut cursor = self.bounds.base().get();
        for (&base, &len) in &state.reservations {
            if base >= cursor && base - cursor >= size {
                break;
            }
            let end = base + len;
            if end > cursor {
                cursor = align_up(end, self.granularity).unwrap_or(usize::MAX);
            }
        }
        let fits = cursor
            .checked_add(size)
            .is_some_and(|end| end <= self.bounds.end().get());
        if !fits {
            return Err(VmError::ReserveFailed {
                at: None,
                size,
                errno: None,
            });
        }
        state.reservations.insert(cursor, size);
        Ok(Address(cursor))
    }

    fn reserve_at(&self, address: Address, size: usize) -> Result<Address, VmError> {
        let size = self.round_reservation(size)?;
        if !address.is_aligned(self.granularity) {
            return Err(VmError::InvalidArgument {
                reason: "reservation address is not granularity-aligned",
            });
        }
        let failed = VmError::ReserveFailed {
            at: Some(address),
            size,
            errno: None,
        };
        let end = match address.checked_add(size) {
            Some(end) => end,
            None => return Err(failed),
        };
        if address < self.bounds.base() || end > self.bounds.end() {
            return Err(failed);
        }
        let mut state = self.state();
        if state.overlaps(address.get(), size) {
            return Err(failed);
        }
        state.reservations.insert(address.get(), size);
        Ok(address)
    }

    fn commit(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        let (start, end) = self.page_span(range)?;
        let mut state = self.state();
        let inside = state
            .containing(start)
            .is_some_and(|(base, size)| end <= base + size);
        if !inside {
            return Err(VmError::CommitFailed { range, errno: None });
        }
        for page in (start..end).step_by(self.page_size) {
            state.pages.insert(page, protection);
        }
        Ok(())
    }

    fn protect(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        let (start, end) = self.page_span(range)?;
        let mut state = self.state();
        let all_committed = (start..end)
            .step_by(self.page_size)
            .all(|page| state.pages.contains_key(&page));
        if !all_committed {
            return Err(VmError::ProtectFailed { range, errno: None });
        }
        for page in (start..end).step_by(self.page_size) {
            state.pages.insert(page, protection);
        }
        Ok(())
    }

    fn zero(&self, range: AddressRange) -> Result<(), VmError> {
        if range.is_empty() {
            return Ok(());
        }
        let mut state = self.state();
        if !state.all_pages(range, self.page_size, Protection::is_writable) {
            return Err(VmError::InvalidArgument {
                reason: "zeroing pages that are not committed read-write",
            });
        }
        for (page, offset, _, len) in SimState::chunks(range, self.page_size) {
            if let Some(bytes) = state.contents.get_mut(&page) {
                bytes[offset..offset + len].fill(0);
            }
        }
        state.zeroed_bytes += range.size();
        Ok(())
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), VmError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let range = AddressRange::new(address, bytes.len());
        let mut state = self.state();
        if !state.all_pages(range, self.page_size, Protection::is_writable) {
            return Err(VmError::InvalidArgument {
                reason: "writing pages that are not committed read-write",
            });
        }
        let page_size = self.page_size;
        for (page, offset, src, len) in SimState::chunks(range, page_size) {
            let contents = state
                .contents
                .entry(page)
                .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
            contents[offset..offset + len].copy_from_slice(&bytes[src..src + len]);
        }
        Ok(())
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), VmError> {
        if buf.is_empty() {
            return Ok(());
        }
        let range = AddressRange::new(address, buf.len());
        let state = self.state();
        if !state.all_pages(range, self.page_size, Protection::is_readable) {
            return Err(VmError::InvalidArgument {
                reason: "reading pages that are not committed readable",
            });
        }
        for (page, offset, dst, len) in SimState::chunks(range, self.page_size) {
            let out = &mut buf[dst..dst + len];
            match state.contents.get(&page) {
                Some(bytes) => out.copy_from_slice(&bytes[offset..offset + len]),
                None => out.fill(0),
            }
        }
        Ok(())
    }

    fn release(&self, reservation: AddressRange) {
        let mut state = self.state();
        let base = reservation.base().get();
        if let Some(size) = state.reservations.remove(&base) {
            let doomed: Vec<usize> = state.pages.range(base..base + size).map(|(&p, _)| p).collect();
            for page in doomed {
                state.pages.remove(&page);
                state.contents.remove(&page);
            }
        }
    }
}
