// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Protected memory regions backing one execution instance
//!
//! A [`Region`] is an anonymous, zero-initialized OS mapping with a fixed base
//! address. Addresses handed to native code always come from the mapping call
//! itself and stay valid until the region is dropped: mappings never move.
//!
//! Protection can be tightened after the loader has finished writing into a
//! region (text becomes execute-only, read-only data becomes read-only) but
//! never loosened.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as sys;

#[cfg(not(target_os = "linux"))]
compile_error!("Region only supported on Linux");

use std::{fmt, ptr::NonNull};

use bitflags::bitflags;
use tracing::debug;

use crate::{
    config::PAGE_SIZE,
    error::{RuntimeError, RuntimeResult},
};

bitflags! {
    /// Access rights of a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Where a region may be placed in the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Anywhere the OS chooses
    #[default]
    Anywhere,
    /// Entirely below 4 GiB, so addresses fit compact 32-bit pointers in code
    Low32,
}

/// Side of a region that gets an inaccessible guard page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Below the base, for stacks growing down
    Below,
    /// Past the end, for memory indexed upward
    Above,
}

/// A contiguous OS mapping with a fixed base address and protection
///
/// The mapping is released when the region is dropped. A zero-sized region
/// owns no mapping and reports a base address of 0. Guard pages are part of
/// the mapping but not of the region's usable range.
pub struct Region {
    ptr: Option<NonNull<u8>>,
    size: usize,
    protection: Protection,
    guard_below: usize,
    guard_above: usize,
}

// Safety: Region exclusively owns its mapping; no aliasing handles exist.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn empty(protection: Protection) -> Self {
        Self {
            ptr: None,
            size: 0,
            protection,
            guard_below: 0,
            guard_above: 0,
        }
    }

    /// Base address of the mapping
    pub fn base(&self) -> usize {
        self.ptr.map_or(0, |p| p.as_ptr() as usize)
    }

    /// One past the last mapped address
    pub fn end(&self) -> usize {
        self.base() + self.size
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current protection
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Whether `address` lies inside the mapping
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.end()
    }

    /// Copy `data` into the region at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> RuntimeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.protection.contains(Protection::WRITE) {
            return Err(RuntimeError::configuration("write into a non-writable region"));
        }
        offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                RuntimeError::configuration(format!(
                    "write of {} bytes at offset {offset} exceeds region size {}",
                    data.len(),
                    self.size
                ))
            })?;

        let Some(ptr) = self.ptr else {
            return Ok(());
        };
        // Safety: the range was checked against the mapping and the mapping is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// View the mapped bytes
    ///
    /// Only meaningful while no native code is concurrently writing into the
    /// region; the runner guarantees this by reading only while the guest is
    /// suspended in a host call on the same thread.
    pub fn as_slice(&self) -> &[u8] {
        debug_assert!(
            self.protection.contains(Protection::READ),
            "reading a non-readable region"
        );
        match self.ptr {
            // Safety: the mapping is live for the lifetime of `self`.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    /// View the mapped bytes from `offset` to the end
    ///
    /// Only the requested range is borrowed, so the rest of the region may be
    /// in use by native code at the same time.
    pub fn slice_from(&self, offset: usize) -> &[u8] {
        debug_assert!(
            self.protection.contains(Protection::READ),
            "reading a non-readable region"
        );
        match self.ptr {
            // Safety: `offset` is clamped to the mapping, which is live for
            // the lifetime of `self`.
            Some(ptr) if offset < self.size => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr().add(offset), self.size - offset)
            },
            _ => &[],
        }
    }

    /// Turn one page at either end into an inaccessible guard
    ///
    /// The usable range shrinks by [`PAGE_SIZE`]; accesses to the guard fault.
    pub fn carve_guard(&mut self, guard: Guard) -> RuntimeResult<()> {
        let Some(ptr) = self.ptr else {
            return Err(RuntimeError::configuration("cannot guard an empty region"));
        };
        if self.size < 2 * PAGE_SIZE {
            return Err(RuntimeError::configuration(format!(
                "region of {} bytes is too small for a guard page",
                self.size
            )));
        }

        let guard_ptr = match guard {
            Guard::Below => ptr,
            // Safety: the last page lies within the mapping.
            Guard::Above => unsafe { ptr.add(self.size - PAGE_SIZE) },
        };
        sys::protect(guard_ptr, PAGE_SIZE, Protection::empty()).map_err(|e| {
            RuntimeError::Allocation {
                size: PAGE_SIZE,
                reason: format!("mprotect failed: {e}"),
            }
        })?;

        match guard {
            Guard::Below => {
                // Safety: the first page lies within the mapping.
                self.ptr = Some(unsafe { ptr.add(PAGE_SIZE) });
                self.guard_below += PAGE_SIZE;
            }
            Guard::Above => self.guard_above += PAGE_SIZE,
        }
        self.size -= PAGE_SIZE;
        debug!(
            base = format_args!("{:#x}", self.base()),
            size = self.size,
            ?guard,
            "carved guard page"
        );
        Ok(())
    }

    /// Tighten the protection of the region
    ///
    /// Fails if `protection` would grant any right the region does not
    /// currently have.
    pub fn retag(&mut self, protection: Protection) -> RuntimeResult<()> {
        if !self.protection.contains(protection) {
            return Err(RuntimeError::configuration(format!(
                "cannot loosen region protection from {:?} to {:?}",
                self.protection, protection
            )));
        }

        if let Some(ptr) = self.ptr {
            if protection.contains(Protection::EXEC) && self.protection.contains(Protection::WRITE)
            {
                // Safety: the mapping is still writable, hence readable.
                unsafe { sys::flush_icache(ptr, self.size) };
            }
            sys::protect(ptr, self.size, protection).map_err(|e| RuntimeError::Allocation {
                size: self.size,
                reason: format!("mprotect failed: {e}"),
            })?;
        }

        debug!(
            base = format_args!("{:#x}", self.base()),
            size = self.size,
            ?protection,
            "retagged region"
        );
        self.protection = protection;
        Ok(())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .field("protection", &self.protection)
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // Safety: the guards and usable range together are exactly the
            // range returned by `sys::map`.
            unsafe {
                sys::unmap(
                    ptr.sub(self.guard_below),
                    self.guard_below + self.size + self.guard_above,
                )
            };
        }
    }
}

/// Source of protected memory regions
///
/// The runner requests every region through this trait, so tests can observe
/// or restrict what gets mapped.
pub trait RegionAllocator {
    /// Map `size` bytes of zeroed memory
    ///
    /// A zero `size` yields an empty region without touching the OS.
    fn allocate(
        &self,
        size: usize,
        protection: Protection,
        placement: Placement,
    ) -> RuntimeResult<Region>;

    /// Tighten the protection of `region`
    fn retag(&self, region: &mut Region, protection: Protection) -> RuntimeResult<()> {
        region.retag(protection)
    }

    /// Map `size` usable bytes plus one guard page on the `guard` side
    fn allocate_guarded(
        &self,
        size: usize,
        protection: Protection,
        guard: Guard,
    ) -> RuntimeResult<Region> {
        let mut region = self.allocate(size + PAGE_SIZE, protection, Placement::Anywhere)?;
        region.carve_guard(guard)?;
        Ok(region)
    }
}

/// Allocator backed by anonymous `mmap`
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapAllocator;

impl RegionAllocator for MmapAllocator {
    fn allocate(
        &self,
        size: usize,
        protection: Protection,
        placement: Placement,
    ) -> RuntimeResult<Region> {
        if size == 0 {
            return Ok(Region::empty(protection));
        }

        let ptr = sys::map(size, protection, placement).map_err(|e| RuntimeError::Allocation {
            size,
            reason: format!("mmap failed: {e}"),
        })?;

        let region = Region {
            ptr: Some(ptr),
            size,
            protection,
            guard_below: 0,
            guard_above: 0,
        };
        debug!(
            base = format_args!("{:#x}", region.base()),
            size,
            ?protection,
            ?placement,
            "mapped region"
        );
        Ok(region)
    }
}
