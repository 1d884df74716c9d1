//! Thin wrappers over the libc virtual-memory calls used by [`SystemVm`].
//!
//! Every function here takes raw addresses and reports failures as an errno.
//! Callers in `system.rs` are responsible for only passing ranges this
//! process reserved itself.
//!
//! [`SystemVm`]: crate::SystemVm

#![allow(unsafe_code)]

use std::io;
use std::ptr;

use crate::vm::Protection;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn prot_flags(protection: Protection) -> libc::c_int {
    match protection {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

/// The system page size.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n < 1 {
        4096
    } else {
        n as usize
    }
}

/// Reserve `size` bytes of inaccessible address space.
///
/// With `fixed`, the mapping is placed exactly at `hint` or not at all.
/// Without it, `hint` is advisory and the kernel may place the mapping
/// anywhere.
pub(crate) fn reserve(hint: Option<usize>, size: usize, fixed: bool) -> Result<usize, i32> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    if fixed {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }
    let addr = hint.unwrap_or(0) as *mut libc::c_void;
    // SAFETY: an anonymous PROT_NONE mapping never aliases existing memory:
    // without MAP_FIXED the kernel picks a free range, and MAP_FIXED_NOREPLACE
    // refuses to clobber an existing mapping.
    let result = unsafe { libc::mmap(addr, size, libc::PROT_NONE, flags, -1, 0) };
    if result == libc::MAP_FAILED {
        return Err(last_errno());
    }
    Ok(result as usize)
}

/// Change the protection of `[addr, addr + size)`.
///
/// # Safety
///
/// The range must lie inside a mapping created by [`reserve`] that is still
/// live, and no Rust reference may point into pages being made inaccessible.
pub(crate) unsafe fn protect(addr: usize, size: usize, protection: Protection) -> Result<(), i32> {
    let ret = libc::mprotect(addr as *mut libc::c_void, size, prot_flags(protection));
    if ret == 0 {
        Ok(())
    } else {
        Err(last_errno())
    }
}

/// Unmap `[addr, addr + size)`.
///
/// # Safety
///
/// The range must be a whole mapping created by [`reserve`], with no live
/// references into it.
pub(crate) unsafe fn release(addr: usize, size: usize) {
    let ret = libc::munmap(addr as *mut libc::c_void, size);
    debug_assert!(ret == 0, "munmap({addr:#x}, {size:#x}) failed");
}

/// Whether the page at `page` is mapped by anyone in this process.
///
/// `mincore` fails with `ENOMEM` for unmapped pages, which is the probe.
pub(crate) fn is_mapped(page: usize, page_size: usize) -> Result<bool, i32> {
    let mut vec = 0u8;
    // SAFETY: mincore only inspects the page table for the given range and
    // writes one byte per page into `vec`, which holds exactly one page.
    let ret = unsafe { libc::mincore(page as *mut libc::c_void, page_size, &mut vec) };
    if ret == 0 {
        return Ok(true);
    }
    match last_errno() {
        libc::ENOMEM => Ok(false),
        errno => Err(errno),
    }
}

/// Fill `[addr, addr + size)` with zero bytes.
///
/// # Safety
///
/// Every byte of the range must be committed read-write memory owned by the
/// caller.
pub(crate) unsafe fn zero(addr: usize, size: usize) {
    ptr::write_bytes(addr as *mut u8, 0, size);
}

/// Copy `bytes` to `addr`.
///
/// # Safety
///
/// `[addr, addr + bytes.len())` must be committed read-write memory owned by
/// the caller and must not overlap `bytes`.
pub(crate) unsafe fn copy_in(addr: usize, bytes: &[u8]) {
    ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
}

/// Copy from `addr` into `buf`.
///
/// # Safety
///
/// `[addr, addr + buf.len())` must be committed readable memory owned by the
/// caller and must not overlap `buf`.
pub(crate) unsafe fn copy_out(addr: usize, buf: &mut [u8]) {
    ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
}
