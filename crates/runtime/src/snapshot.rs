// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Immutable captures of suspended executions
//!
//! The guest requests a capture by calling the `snapshot` host import with two
//! words: its current memory limit address and its current stack pointer. The
//! runner validates them, copies globals, in-use linear memory and the live
//! stack into a [`Snapshot`], appends it to the [`SnapshotStore`] and writes the
//! new id back as the call's result. Guest-visible state is never modified.
//!
//! [`SnapshotStore`]: crate::SnapshotStore

use std::{fmt, sync::Arc};

use crate::{
    config::RunnerConfig,
    error::RuntimeResult,
    program::Program,
    region::{MmapAllocator, RegionAllocator},
    runner::Runner,
};

/// Capture request written by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Absolute address of the end of the guest's in-use linear memory
    pub memory_limit: u64,
    /// Absolute address of the guest's innermost return address
    pub stack_ptr: u64,
}

/// Frozen state of a suspended runner
pub struct Snapshot {
    program: Arc<Program>,
    memory_size: usize,
    globals: Vec<u8>,
    data: Vec<u8>,
    portable_stack: Option<Vec<u8>>,
    native_stack: Vec<u8>,
}

impl Snapshot {
    pub(crate) fn new(
        program: Arc<Program>,
        memory_size: usize,
        globals: Vec<u8>,
        data: Vec<u8>,
        portable_stack: Option<Vec<u8>>,
        native_stack: Vec<u8>,
    ) -> Self {
        Self {
            program,
            memory_size,
            globals,
            data,
            portable_stack,
            native_stack,
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Size of linear memory at capture time
    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn globals(&self) -> &[u8] {
        &self.globals
    }

    /// Linear memory contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Architecture-neutral stack, absent if the codec could not encode it
    pub fn portable_stack(&self) -> Option<&[u8]> {
        self.portable_stack.as_deref()
    }

    /// Raw stack image, usable only on the capturing architecture
    pub fn native_stack(&self) -> &[u8] {
        &self.native_stack
    }

    /// Build a fresh runner with the captured globals and memory
    ///
    /// The new runner starts at the program's entry point with an empty
    /// stack; resuming mid-execution from the captured stack is not supported.
    pub fn new_runner(&self, grow_memory_size: usize, stack_size: usize) -> RuntimeResult<Runner> {
        self.new_runner_with(&MmapAllocator, grow_memory_size, stack_size)
    }

    /// Like [`Snapshot::new_runner`], mapping regions through `allocator`
    pub fn new_runner_with(
        &self,
        allocator: &impl RegionAllocator,
        grow_memory_size: usize,
        stack_size: usize,
    ) -> RuntimeResult<Runner> {
        let config = RunnerConfig::new(self.memory_size, grow_memory_size, stack_size);
        Runner::build(&self.program, &self.globals, &self.data, config, allocator)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("memory_size", &self.memory_size)
            .field("globals_size", &self.globals.len())
            .field("data_size", &self.data.len())
            .field("portable_stack_size", &self.portable_stack.as_ref().map(Vec::len))
            .field("native_stack_size", &self.native_stack.len())
            .finish_non_exhaustive()
    }
}
