// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Immutable compiled program shared by runners and snapshots
//!
//! A [`Program`] is what the external compiler/loader produces: machine code,
//! its entry table, read-only data, initial globals and linear memory, and the
//! metadata needed to interpret its call stacks. It is never mutated after
//! being built and is shared via `Arc`.

use std::{collections::HashMap, fmt};

use crate::{
    codec::{FrameCodec, StackCodec},
    config::PAGE_SIZE,
    error::{RuntimeError, RuntimeResult, StackEncodingError},
    unwind::{NativeStack, StackTrace, UnwindMap},
};

/// Default entry symbol
pub const DEFAULT_ENTRY: &str = "main";

/// A 32-bit absolute pointer into read-only data embedded in the code
///
/// When a runner maps the program, the little-endian `u32` at `code_offset`
/// is set to `ro_data_base + addend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoDataFixup {
    pub code_offset: u32,
    pub addend: u32,
}

/// Compiled program
pub struct Program {
    code: Vec<u8>,
    entry_points: HashMap<String, u32>,
    entry: String,
    ro_data: Vec<u8>,
    ro_data_fixups: Vec<RoDataFixup>,
    globals: Vec<u8>,
    memory_offset: usize,
    data: Vec<u8>,
    unwind: UnwindMap,
    codec: Box<dyn StackCodec>,
}

impl Program {
    /// Start building a program around raw machine code
    pub fn builder(code: Vec<u8>) -> ProgramBuilder {
        ProgramBuilder {
            code,
            entry_points: HashMap::new(),
            entry: DEFAULT_ENTRY.to_string(),
            ro_data: Vec::new(),
            ro_data_fixups: Vec::new(),
            globals: Vec::new(),
            memory_offset: 0,
            data: Vec::new(),
            unwind: UnwindMap::new(),
            codec: Box::new(FrameCodec),
        }
    }

    /// Create a program with a single entry point at offset 0
    pub fn with_single_entry(code: Vec<u8>, name: impl Into<String>) -> RuntimeResult<Self> {
        let name = name.into();
        Self::builder(code).entry_point(name.clone(), 0).entry(name).build()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn entry_points(&self) -> &HashMap<String, u32> {
        &self.entry_points
    }

    /// Name of the function a runner starts at
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Offset of the entry function within the code
    pub fn entry_offset(&self) -> u32 {
        // Presence is checked by `ProgramBuilder::build`.
        self.entry_points[&self.entry]
    }

    pub fn ro_data(&self) -> &[u8] {
        &self.ro_data
    }

    pub fn ro_data_fixups(&self) -> &[RoDataFixup] {
        &self.ro_data_fixups
    }

    /// Initial global values, placed at the end of the globals block
    pub fn globals(&self) -> &[u8] {
        &self.globals
    }

    /// Byte offset of linear memory within the globals+memory region
    ///
    /// This is also the size of the globals block.
    pub fn memory_offset(&self) -> usize {
        self.memory_offset
    }

    /// Initial linear memory contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn unwind(&self) -> &UnwindMap {
        &self.unwind
    }

    /// Diagnostic trace of a live stack
    pub fn stacktrace(&self, stack: NativeStack<'_>) -> StackTrace {
        self.unwind.stacktrace(stack)
    }

    /// Encode a live stack in the portable representation
    pub fn export_stack(&self, stack: NativeStack<'_>) -> Result<Vec<u8>, StackEncodingError> {
        self.codec.export(&self.unwind, stack)
    }

    /// Minimal program whose entry returns `value`
    #[cfg(test)]
    pub(crate) fn returning(value: u16) -> Self {
        Self::with_single_entry(returning_code(value), DEFAULT_ENTRY)
            .expect("test program should be valid")
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("code_size", &self.code.len())
            .field("entry", &self.entry)
            .field("ro_data_size", &self.ro_data.len())
            .field("globals_size", &self.globals.len())
            .field("memory_offset", &self.memory_offset)
            .field("data_size", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Program`]
pub struct ProgramBuilder {
    code: Vec<u8>,
    entry_points: HashMap<String, u32>,
    entry: String,
    ro_data: Vec<u8>,
    ro_data_fixups: Vec<RoDataFixup>,
    globals: Vec<u8>,
    memory_offset: usize,
    data: Vec<u8>,
    unwind: UnwindMap,
    codec: Box<dyn StackCodec>,
}

impl ProgramBuilder {
    pub fn entry_point(mut self, name: impl Into<String>, offset: u32) -> Self {
        self.entry_points.insert(name.into(), offset);
        self
    }

    pub fn entry_points(mut self, entry_points: HashMap<String, u32>) -> Self {
        self.entry_points.extend(entry_points);
        self
    }

    /// Select the entry symbol (defaults to `main`)
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = name.into();
        self
    }

    pub fn ro_data(mut self, ro_data: Vec<u8>, fixups: Vec<RoDataFixup>) -> Self {
        self.ro_data = ro_data;
        self.ro_data_fixups = fixups;
        self
    }

    /// Globals block of `memory_offset` bytes, initialized at its tail by `globals`
    pub fn globals(mut self, globals: Vec<u8>, memory_offset: usize) -> Self {
        self.globals = globals;
        self.memory_offset = memory_offset;
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn unwind(mut self, unwind: UnwindMap) -> Self {
        self.unwind = unwind;
        self
    }

    pub fn codec(mut self, codec: impl StackCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn build(self) -> RuntimeResult<Program> {
        if self.code.is_empty() {
            return Err(RuntimeError::invalid_program("empty code"));
        }

        let entry_offset = *self
            .entry_points
            .get(&self.entry)
            .ok_or_else(|| RuntimeError::SymbolNotFound {
                symbol: self.entry.clone(),
            })?;
        if entry_offset as usize >= self.code.len() {
            return Err(RuntimeError::invalid_program(format!(
                "entry {} at offset {entry_offset:#x} is outside the code",
                self.entry
            )));
        }

        if self.memory_offset % PAGE_SIZE != 0 {
            return Err(RuntimeError::invalid_program(format!(
                "memory offset {} is not a multiple of {PAGE_SIZE}",
                self.memory_offset
            )));
        }
        if self.globals.len() > self.memory_offset {
            return Err(RuntimeError::invalid_program(format!(
                "{} bytes of globals do not fit before memory offset {}",
                self.globals.len(),
                self.memory_offset
            )));
        }

        for fixup in &self.ro_data_fixups {
            if fixup.code_offset as usize + 4 > self.code.len() {
                return Err(RuntimeError::invalid_program(format!(
                    "read-only data fixup at {:#x} is outside the code",
                    fixup.code_offset
                )));
            }
            if fixup.addend as usize > self.ro_data.len() {
                return Err(RuntimeError::invalid_program(format!(
                    "read-only data fixup addend {:#x} exceeds read-only data size {}",
                    fixup.addend,
                    self.ro_data.len()
                )));
            }
        }

        Ok(Program {
            code: self.code,
            entry_points: self.entry_points,
            entry: self.entry,
            ro_data: self.ro_data,
            ro_data_fixups: self.ro_data_fixups,
            globals: self.globals,
            memory_offset: self.memory_offset,
            data: self.data,
            unwind: self.unwind,
            codec: self.codec,
        })
    }
}

/// Machine code for `return value`
#[cfg(test)]
pub(crate) fn returning_code(value: u16) -> Vec<u8> {
    #[cfg(target_arch = "aarch64")]
    {
        // mov x0, #value; ret
        let mov = 0xd2800000u32 | ((value as u32) << 5);
        let ret = 0xd65f03c0u32;
        mov.to_le_bytes().into_iter().chain(ret.to_le_bytes()).collect()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        // mov eax, value; ret
        let mut code = vec![0xb8];
        code.extend_from_slice(&(value as u32).to_le_bytes());
        code.push(0xc3);
        code
    }
}
