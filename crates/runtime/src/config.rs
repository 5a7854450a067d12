// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sizing parameters of an execution instance

use crate::error::{RuntimeError, RuntimeResult};

/// Granularity by which linear memory grows (one WebAssembly page)
pub const MEMORY_INCREMENT: usize = 1 << 16;

/// Alignment of the linear memory within the globals+memory region
pub const PAGE_SIZE: usize = 4096;

/// Default call stack size: 64 KB
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Default maximum program text size: 128 MB
pub const DEFAULT_TEXT_SIZE: usize = 128 * 1024 * 1024;

/// Default maximum read-only data size: 4 MB
pub const DEFAULT_RO_DATA_SIZE: usize = 4 * 1024 * 1024;

/// Round `size` up to a multiple of `align` (a power of two)
pub fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Memory and stack sizes for one runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Linear memory size at start, in bytes
    pub init_memory_size: usize,
    /// Ceiling the guest may grow linear memory to, in bytes
    pub grow_memory_size: usize,
    /// Call stack size in bytes
    pub stack_size: usize,
}

impl RunnerConfig {
    pub fn new(init_memory_size: usize, grow_memory_size: usize, stack_size: usize) -> Self {
        Self {
            init_memory_size,
            grow_memory_size,
            stack_size,
        }
    }

    /// Check the size invariants
    ///
    /// Both memory sizes must be multiples of [`MEMORY_INCREMENT`] with
    /// `grow >= init`, and the stack must be non-empty and page aligned.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.init_memory_size % MEMORY_INCREMENT != 0 {
            return Err(RuntimeError::configuration(format!(
                "initial memory size {} is not a multiple of {MEMORY_INCREMENT}",
                self.init_memory_size
            )));
        }
        if self.grow_memory_size % MEMORY_INCREMENT != 0 {
            return Err(RuntimeError::configuration(format!(
                "grow memory size {} is not a multiple of {MEMORY_INCREMENT}",
                self.grow_memory_size
            )));
        }
        if self.grow_memory_size < self.init_memory_size {
            return Err(RuntimeError::configuration(format!(
                "grow memory size {} is smaller than initial memory size {}",
                self.grow_memory_size, self.init_memory_size
            )));
        }
        if self.stack_size == 0 {
            return Err(RuntimeError::configuration("stack size is zero"));
        }
        if self.stack_size % PAGE_SIZE != 0 {
            return Err(RuntimeError::configuration(format!(
                "stack size {} is not a multiple of {PAGE_SIZE}",
                self.stack_size
            )));
        }
        Ok(())
    }
}
