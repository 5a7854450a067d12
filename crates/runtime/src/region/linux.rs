// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Linux-specific mapping primitives using anonymous private mmap

use std::{io, ptr::NonNull};

use libc::{c_int, c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE};

use super::{Placement, Protection};

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(start: *mut c_void, end: *mut c_void);
}

/// Address hint for low placement where `MAP_32BIT` is unavailable
#[cfg(not(target_arch = "x86_64"))]
const LOW32_HINT: usize = 0x1000_0000;

/// Exclusive upper bound of the 32-bit address space
const LOW32_LIMIT: usize = 1 << 32;

fn prot_bits(protection: Protection) -> c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Extra mmap flags and address hint for a placement constraint
#[cfg(target_arch = "x86_64")]
fn placement_args(placement: Placement) -> (c_int, *mut c_void) {
    match placement {
        Placement::Anywhere => (0, std::ptr::null_mut()),
        Placement::Low32 => (libc::MAP_32BIT, std::ptr::null_mut()),
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn placement_args(placement: Placement) -> (c_int, *mut c_void) {
    match placement {
        Placement::Anywhere => (0, std::ptr::null_mut()),
        Placement::Low32 => (0, LOW32_HINT as *mut c_void),
    }
}

/// Map `size` bytes of zeroed anonymous memory
pub(super) fn map(
    size: usize,
    protection: Protection,
    placement: Placement,
) -> io::Result<NonNull<u8>> {
    let (extra_flags, hint) = placement_args(placement);
    let flags = MAP_PRIVATE | MAP_ANONYMOUS | extra_flags;

    let addr = unsafe { libc::mmap(hint, size, prot_bits(protection), flags, -1, 0) };
    if addr == MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    if placement == Placement::Low32 && (addr as usize).saturating_add(size) > LOW32_LIMIT {
        unsafe { libc::munmap(addr, size) };
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "32-bit address space exhausted",
        ));
    }

    // Safety: mmap returns MAP_FAILED (-1) on error, never null.
    Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
}

/// Change the protection of an existing mapping
pub(super) fn protect(ptr: NonNull<u8>, size: usize, protection: Protection) -> io::Result<()> {
    if unsafe { libc::mprotect(ptr.as_ptr() as *mut c_void, size, prot_bits(protection)) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Release a mapping
///
/// # Safety
///
/// `ptr` and `size` must describe a live mapping created by [`map`].
pub(super) unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
    libc::munmap(ptr.as_ptr() as *mut c_void, size);
}

/// Make freshly written code visible to instruction fetch
///
/// # Safety
///
/// The range must lie within a readable mapping.
#[cfg(target_arch = "aarch64")]
pub(super) unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
    __clear_cache(
        ptr.as_ptr() as *mut c_void,
        ptr.as_ptr().add(len) as *mut c_void,
    );
}

/// x86 keeps instruction fetch coherent with stores
#[cfg(not(target_arch = "aarch64"))]
pub(super) unsafe fn flush_icache(_ptr: NonNull<u8>, _len: usize) {}
