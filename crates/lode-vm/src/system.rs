//! [`VirtualMemory`] backed by the Linux `mmap` family.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lode_core::{align_down, align_up, Address, AddressRange};

use crate::error::VmError;
use crate::sys;
use crate::vm::{Protection, RegionInfo, RegionState, VirtualMemory};

/// Lowest address handed out: keeps the null page region untouched.
const MIN_ADDRESS: usize = 0x1_0000;

/// One past the highest user address with 4-level page tables.
const MAX_ADDRESS: usize = 0x7fff_ffff_0000;

#[derive(Debug, Default)]
struct Owned {
    /// Reservations made through this backend: base -> size.
    reservations: BTreeMap<usize, usize>,
    /// Committed page base -> protection.
    pages: BTreeMap<usize, Protection>,
}

impl Owned {
    fn reservation_containing(&self, start: usize, end: usize) -> bool {
        self.reservations
            .range(..=start)
            .next_back()
            .is_some_and(|(&base, &size)| end <= base + size)
    }
}

/// The real process address space.
///
/// Reservations are `PROT_NONE` anonymous mappings; commit and protect are
/// `mprotect`. The backend remembers which reservations and pages it owns,
/// so the safe [`VirtualMemory`] surface can never touch foreign mappings.
#[derive(Debug)]
pub struct SystemVm {
    page_size: usize,
    owned: Mutex<Owned>,
}

impl SystemVm {
    /// Create a backend for the current process.
    pub fn new() -> Self {
        Self {
            page_size: sys::page_size(),
            owned: Mutex::new(Owned::default()),
        }
    }

    fn owned(&self) -> MutexGuard<'_, Owned> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn round_size(&self, size: usize) -> Result<usize, VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument {
                reason: "zero-sized reservation",
            });
        }
        align_up(size, self.page_size).ok_or(VmError::InvalidArgument {
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

    fn all_pages(
        &self,
        owned: &Owned,
        range: AddressRange,
        allowed: impl Fn(Protection) -> bool,
    ) -> bool {
        let start = align_down(range.base().get(), self.page_size);
        (start..range.end().get())
            .step_by(self.page_size)
            .all(|page| owned.pages.get(&page).is_some_and(|&p| allowed(p)))
    }

    fn record_reservation(&self, base: usize, size: usize) {
        self.owned().reservations.insert(base, size);
    }

    fn set_protection(
        &self,
        range: AddressRange,
        protection: Protection,
        committing: bool,
    ) -> Result<(), VmError> {
        let (start, end) = self.page_span(range)?;
        let mut owned = self.owned();
        let permitted = if committing {
            owned.reservation_containing(start, end)
        } else {
            (start..end)
                .step_by(self.page_size)
                .all(|page| owned.pages.contains_key(&page))
        };
        let fail = |errno| {
            if committing {
                VmError::CommitFailed { range, errno }
            } else {
                VmError::ProtectFailed { range, errno }
            }
        };
        if !permitted {
            return Err(fail(None));
        }
        // SAFETY: the range lies inside a live reservation owned by this
        // backend, and only loader heaps hold addresses into it.
        #[allow(unsafe_code)]
        unsafe { sys::protect(start, end - start, protection) }.map_err(|e| fail(Some(e)))?;
        for page in (start..end).step_by(self.page_size) {
            owned.pages.insert(page, protection);
        }
        Ok(())
    }
}

impl Default for SystemVm {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for SystemVm {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocation_granularity(&self) -> usize {
        self.page_size
    }

    fn address_bounds(&self) -> AddressRange {
        AddressRange::new(Address(MIN_ADDRESS), MAX_ADDRESS - MIN_ADDRESS)
    }

    fn query(&self, address: Address) -> Result<RegionInfo, VmError> {
        let page = align_down(address.get(), self.page_size);
        if page >= MAX_ADDRESS {
            return Err(VmError::QueryFailed { address });
        }
        let mapped =
            sys::is_mapped(page, self.page_size).map_err(|_| VmError::QueryFailed { address })?;
        let info = if !mapped {
            // mincore cannot measure a hole cheaply; report unknown extent.
            RegionInfo {
                base: Address(page),
                size: 0,
                state: RegionState::Free,
            }
        } else {
            let committed = self.owned().pages.contains_key(&page);
            RegionInfo {
                base: Address(page),
                size: self.page_size,
                state: if committed {
                    RegionState::Committed
                } else {
                    RegionState::Reserved
                },
            }
        };
        Ok(info)
    }

    fn reserve(&self, size: usize) -> Result<Address, VmError> {
        let size = self.round_size(size)?;
        let base = sys::reserve(None, size, false).map_err(|errno| VmError::ReserveFailed {
            at: None,
            size,
            errno: Some(errno),
        })?;
        self.record_reservation(base, size);
        Ok(Address(base))
    }

    fn reserve_at(&self, address: Address, size: usize) -> Result<Address, VmError> {
        let size = self.round_size(size)?;
        if !address.is_aligned(self.page_size) {
            return Err(VmError::InvalidArgument {
                reason: "reservation address is not page-aligned",
            });
        }
        let failed = |errno| VmError::ReserveFailed {
            at: Some(address),
            size,
            errno,
        };
        let base = sys::reserve(Some(address.get()), size, true).map_err(|e| failed(Some(e)))?;
        if base != address.get() {
            // Kernels predating MAP_FIXED_NOREPLACE treat the address as a hint.
            #[allow(unsafe_code)]
            // SAFETY: `base` is the mapping the call above just created.
            unsafe {
                sys::release(base, size)
            };
            return Err(failed(None));
        }
        self.record_reservation(base, size);
        Ok(address)
    }

    fn reserve_within(&self, window: AddressRange, size: usize) -> Option<Address> {
        let size = self.round_size(size).ok()?;
        let hint = window.base().align_up(self.page_size)?;
        let base = sys::reserve(Some(hint.get()), size, false).ok()?;
        let placed = AddressRange::new(Address(base), size);
        if window.contains_range(&placed) {
            self.record_reservation(base, size);
            return Some(placed.base());
        }
        #[allow(unsafe_code)]
        // SAFETY: `base` is the mapping the call above just created.
        unsafe {
            sys::release(base, size)
        };
        None
    }

    fn commit(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        self.set_protection(range, protection, true)
    }

    fn protect(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        self.set_protection(range, protection, false)
    }

    fn zero(&self, range: AddressRange) -> Result<(), VmError> {
        if range.is_empty() {
            return Ok(());
        }
        let owned = self.owned();
        if !self.all_pages(&owned, range, Protection::is_writable) {
            return Err(VmError::InvalidArgument {
                reason: "zeroing pages that are not committed read-write",
            });
        }
        // SAFETY: every page of the range is committed read-write by this
        // backend, and the lock keeps it from being released concurrently.
        #[allow(unsafe_code)]
        unsafe {
            sys::zero(range.base().get(), range.size())
        };
        Ok(())
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), VmError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let range = AddressRange::new(address, bytes.len());
        let owned = self.owned();
        if !self.all_pages(&owned, range, Protection::is_writable) {
            return Err(VmError::InvalidArgument {
                reason: "writing pages that are not committed read-write",
            });
        }
        // SAFETY: the destination is committed read-write by this backend
        // and cannot alias a borrowed Rust slice.
        #[allow(unsafe_code)]
        unsafe {
            sys::copy_in(address.get(), bytes)
        };
        Ok(())
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), VmError> {
        if buf.is_empty() {
            return Ok(());
        }
        let range = AddressRange::new(address, buf.len());
        let owned = self.owned();
        if !self.all_pages(&owned, range, Protection::is_readable) {
            return Err(VmError::InvalidArgument {
                reason: "reading pages that are not committed readable",
            });
        }
        // SAFETY: the source is committed readable memory owned by this
        // backend and cannot alias `buf`.
        #[allow(unsafe_code)]
        unsafe {
            sys::copy_out(address.get(), buf)
        };
        Ok(())
    }

    fn release(&self, reservation: AddressRange) {
        let mut owned = self.owned();
        let base = reservation.base().get();
        let Some(size) = owned.reservations.remove(&base) else {
            return;
        };
        let doomed: Vec<usize> = owned.pages.range(base..base + size).map(|(&p, _)| p).collect();
        for page in doomed {
            owned.pages.remove(&page);
        }
        // SAFETY: the reservation was created by this backend and is removed
        // from the ownership table above, so it is unmapped exactly once.
        #[allow(unsafe_code)]
        unsafe {
            sys::release(base, size)
        };
    }
}

impl Drop for SystemVm {
    fn drop(&mut self) {
        let owned = self.owned.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (&base, &size) in &owned.reservations {
            // SAFETY: every recorded reservation is still mapped and nothing
            // can reach it once its backend is gone.
            #[allow(unsafe_code)]
            unsafe {
                sys::release(base, size)
            };
        }
        owned.reservations.clear();
    }
}
