//! A simulated backend with scripted failures.

use std::sync::atomic::{AtomicUsize, Ordering};

use lode_core::{Address, AddressRange};
use lode_vm::{Protection, RegionInfo, SimulatedVm, VirtualMemory, VmError};

/// Wraps a [`SimulatedVm`] and fails reserve or commit calls on request.
///
/// Each `fail_next_*` call adds to a countdown; while it is non-zero the
/// matching operation fails with the corresponding [`VmError`] and does
/// not reach the simulation.
#[derive(Debug, Default)]
pub struct ScriptedVm {
    inner: SimulatedVm,
    reserve_failures: AtomicUsize,
    commit_failures: AtomicUsize,
    commits: AtomicUsize,
}

impl ScriptedVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped simulation, for its inspection helpers.
    pub fn inner(&self) -> &SimulatedVm {
        &self.inner
    }

    /// Fail the next `n` reserve calls (`reserve` and `reserve_at`).
    pub fn fail_next_reserves(&self, n: usize) {
        self.reserve_failures.fetch_add(n, Ordering::Relaxed);
    }

    /// Fail the next `n` commit calls.
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_failures.fetch_add(n, Ordering::Relaxed);
    }

    /// Number of commit calls that reached the simulation.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl VirtualMemory for ScriptedVm {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn allocation_granularity(&self) -> usize {
        self.inner.allocation_granularity()
    }

    fn address_bounds(&self) -> AddressRange {
        self.inner.address_bounds()
    }

    fn query(&self, address: Address) -> Result<RegionInfo, VmError> {
        self.inner.query(address)
    }

    fn reserve(&self, size: usize) -> Result<Address, VmError> {
        if Self::take(&self.reserve_failures) {
            return Err(VmError::ReserveFailed {
                at: None,
                size,
                errno: None,
            });
        }
        self.inner.reserve(size)
    }

    fn reserve_at(&self, address: Address, size: usize) -> Result<Address, VmError> {
        if Self::take(&self.reserve_failures) {
            return Err(VmError::ReserveFailed {
                at: Some(address),
                size,
                errno: None,
            });
        }
        self.inner.reserve_at(address, size)
    }

    fn commit(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        if Self::take(&self.commit_failures) {
            return Err(VmError::CommitFailed { range, errno: None });
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.inner.commit(range, protection)
    }

    fn protect(&self, range: AddressRange, protection: Protection) -> Result<(), VmError> {
        self.inner.protect(range, protection)
    }

    fn zero(&self, range: AddressRange) -> Result<(), VmError> {
        self.inner.zero(range)
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), VmError> {
        self.inner.write(address, bytes)
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), VmError> {
        self.inner.read(address, buf)
    }

    fn release(&self, reservation: AddressRange) {
        self.inner.release(reservation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let vm = ScriptedVm::new();
        vm.fail_next_reserves(1);
        assert!(matches!(
            vm.reserve(0x1_0000),
            Err(VmError::ReserveFailed { .. })
        ));
        let base = vm.reserve(0x1_0000).unwrap();
        let page = AddressRange::new(base, vm.page_size());

        vm.fail_next_commits(1);
        assert!(vm.commit(page, Protection::ReadWrite).is_err());
        vm.commit(page, Protection::ReadWrite).unwrap();
        assert_eq!(vm.commit_count(), 1);
        assert_eq!(vm.inner().committed_bytes(), vm.page_size());
    }
}
