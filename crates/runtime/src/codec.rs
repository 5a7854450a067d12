// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Architecture-neutral encoding of a suspended call stack
//!
//! The portable form replaces absolute return addresses with text offsets and
//! stores every value little-endian, so it can be replayed by a different build
//! of the same program. Replaying it into a fresh native stack is not
//! implemented; only the capture format is defined.
//!
//! # Format
//!
//! ```text
//! "PSTK"  u16 version  u32 frame_count
//! frame*: u32 function  u32 return_offset  u32 slot_count  u64 slot*
//! ```

use crate::{
    error::StackEncodingError,
    unwind::{NativeStack, UnwindMap},
};

const MAGIC: &[u8; 4] = b"PSTK";
const VERSION: u16 = 1;
const SLOT: usize = 8;

/// Converts a native stack image into a portable representation
pub trait StackCodec: Send + Sync {
    /// Encode the live stack described by `unwind`
    fn export(&self, unwind: &UnwindMap, stack: NativeStack<'_>) -> Result<Vec<u8>, StackEncodingError>;
}

/// Default codec: one record per frame with its locals as 64-bit slots
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl StackCodec for FrameCodec {
    fn export(&self, unwind: &UnwindMap, stack: NativeStack<'_>) -> Result<Vec<u8>, StackEncodingError> {
        let mut frames = Vec::new();
        for frame in unwind.frames(stack) {
            let frame = frame?;
            if frame.locals.len() % SLOT != 0 {
                return Err(StackEncodingError::UnalignedFrame {
                    function: frame.function,
                    size: frame.locals.len() as u32,
                });
            }
            frames.push(frame);
        }

        let mut out = Vec::with_capacity(10 + stack.bytes.len() * 2);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for frame in &frames {
            out.extend_from_slice(&frame.function.to_le_bytes());
            out.extend_from_slice(&frame.return_offset.to_le_bytes());
            out.extend_from_slice(&((frame.locals.len() / SLOT) as u32).to_le_bytes());
            for slot in frame.locals.chunks_exact(SLOT) {
                let mut word = [0u8; SLOT];
                word.copy_from_slice(slot);
                out.extend_from_slice(&u64::from_ne_bytes(word).to_le_bytes());
            }
        }
        Ok(out)
    }
}

/// A frame read back from the portable encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortableFrame {
    pub function: u32,
    pub return_offset: u32,
    pub slots: Vec<u64>,
}

/// Parse a stack produced by [`FrameCodec`]
pub fn decode_portable(bytes: &[u8]) -> Result<Vec<PortableFrame>, StackEncodingError> {
    let mut reader = Reader { bytes, offset: 0 };

    if reader.take(MAGIC.len())? != MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = u16::from_le_bytes(reader.array()?);
    if version != VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }

    let count = reader.u32()?;
    let mut frames = Vec::new();
    for _ in 0..count {
        let function = reader.u32()?;
        let return_offset = reader.u32()?;
        let slot_count = reader.u32()? as usize;
        let slots = (0..slot_count)
            .map(|_| reader.array().map(u64::from_le_bytes))
            .collect::<Result<_, _>>()?;
        frames.push(PortableFrame {
            function,
            return_offset,
            slots,
        });
    }

    if reader.offset != bytes.len() {
        return Err(malformed(format!(
            "{} trailing bytes",
            bytes.len() - reader.offset
        )));
    }
    Ok(frames)
}

fn malformed(reason: impl Into<String>) -> StackEncodingError {
    StackEncodingError::Malformed {
        reason: reason.into(),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], StackEncodingError> {
        let end = self.offset + len;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| malformed(format!("unexpected end at offset {}", self.offset)))?;
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StackEncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, StackEncodingError> {
        self.array().map(u32::from_le_bytes)
    }
}
