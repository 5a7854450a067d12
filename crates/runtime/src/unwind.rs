// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Call stack walking driven by compiler-provided call-site metadata
//!
//! # Stack Layout
//!
//! Stacks grow toward lower addresses. Walking upward from a suspended stack
//! pointer, every frame starts with a return address word followed by the
//! locals of the function that return address resumes:
//!
//! ```text
//! low   [return address][caller locals ...][return address][caller locals ...] ... [host frame]   high
//!       ^ stack pointer                                                                ^ stack end
//! ```
//!
//! The outermost return address points back into the execution trampoline,
//! outside the program text, and is followed by exactly the trampoline's host
//! frame.

use std::{collections::BTreeMap, fmt, ops::Range};

use crate::error::StackEncodingError;

const WORD: usize = 8;

/// Metadata recorded by the compiler for one call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Index of the function containing the call
    pub function: u32,
    /// Bytes of that function's locals between this return address and the
    /// next one up the stack
    pub frame_size: u32,
}

/// Call-site table keyed by return address offset within the program text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindMap {
    call_sites: BTreeMap<u32, CallSite>,
    function_names: Vec<String>,
}

impl UnwindMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the call site whose return address is at `return_offset`
    pub fn insert(&mut self, return_offset: u32, site: CallSite) {
        self.call_sites.insert(return_offset, site);
    }

    /// Attach human-readable names, indexed by function index
    pub fn with_function_names(mut self, names: Vec<String>) -> Self {
        self.function_names = names;
        self
    }

    pub fn call_site(&self, return_offset: u32) -> Option<&CallSite> {
        self.call_sites.get(&return_offset)
    }

    pub fn function_name(&self, function: u32) -> Option<&str> {
        self.function_names.get(function as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.call_sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.call_sites.is_empty()
    }

    /// Walk the frames of a live native stack
    pub fn frames<'a>(&'a self, stack: NativeStack<'a>) -> Frames<'a> {
        Frames {
            map: self,
            stack,
            offset: 0,
            done: false,
        }
    }

    /// Produce a diagnostic trace, stopping at the first undecodable frame
    pub fn stacktrace(&self, stack: NativeStack<'_>) -> StackTrace {
        let mut trace = StackTrace::default();
        for frame in self.frames(stack) {
            match frame {
                Ok(frame) => trace.frames.push(TraceFrame {
                    function: frame.function,
                    name: self.function_name(frame.function).map(str::to_owned),
                    return_offset: frame.return_offset,
                    frame_size: frame.locals.len(),
                }),
                Err(e) => {
                    trace.truncated = Some(e.to_string());
                    break;
                }
            }
        }
        trace
    }

    /// Best-effort trace from a stack pointer that may be mid-function
    ///
    /// Skips words until the first one that is a known return address, then
    /// walks normally from there.
    pub fn scan_stacktrace(&self, stack: NativeStack<'_>) -> StackTrace {
        let start = (0..stack.bytes.len() / WORD)
            .map(|i| i * WORD)
            .find(|&offset| {
                stack
                    .text_offset(read_word(stack.bytes, offset))
                    .is_some_and(|ret| self.call_sites.contains_key(&ret))
            });
        match start {
            Some(offset) => self.stacktrace(NativeStack {
                bytes: &stack.bytes[offset..],
                ..stack
            }),
            None => StackTrace::default(),
        }
    }
}

/// Live stack bytes plus what is needed to interpret return addresses
#[derive(Debug, Clone, Copy)]
pub struct NativeStack<'a> {
    /// Bytes from the stack pointer up to the stack end
    pub bytes: &'a [u8],
    /// Absolute address range of the program text
    pub text: (u64, u64),
    /// Size of the trampoline frame above the outermost return address
    pub host_frame_size: usize,
}

impl<'a> NativeStack<'a> {
    pub fn new(bytes: &'a [u8], text: Range<u64>, host_frame_size: usize) -> Self {
        Self {
            bytes,
            text: (text.start, text.end),
            host_frame_size,
        }
    }

    fn text_offset(&self, address: u64) -> Option<u32> {
        let (start, end) = self.text;
        (address >= start && address < end).then(|| (address - start) as u32)
    }
}

/// One decoded stack frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Function the return address resumes
    pub function: u32,
    /// Return address as an offset into the program text
    pub return_offset: u32,
    /// Raw locals of the resumed function
    pub locals: &'a [u8],
}

/// Iterator over the frames of a native stack, innermost first
pub struct Frames<'a> {
    map: &'a UnwindMap,
    stack: NativeStack<'a>,
    offset: usize,
    done: bool,
}

impl<'a> Frames<'a> {
    fn fail(&mut self, error: StackEncodingError) -> Option<Result<Frame<'a>, StackEncodingError>> {
        self.done = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>, StackEncodingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let bytes = self.stack.bytes;
        let offset = self.offset;
        let remaining = bytes.len() - offset;
        if remaining < WORD {
            return self.fail(StackEncodingError::Truncated {
                offset,
                needed: WORD - remaining,
            });
        }

        let address = read_word(bytes, offset);
        let Some(return_offset) = self.stack.text_offset(address) else {
            if remaining - WORD == self.stack.host_frame_size {
                self.done = true;
                return None;
            }
            return self.fail(StackEncodingError::UnknownReturnAddress { offset, address });
        };

        let Some(site) = self.map.call_site(return_offset).copied() else {
            return self.fail(StackEncodingError::UnknownReturnAddress { offset, address });
        };

        let locals_start = offset + WORD;
        let locals_end = locals_start + site.frame_size as usize;
        if locals_end > bytes.len() {
            return self.fail(StackEncodingError::Truncated {
                offset: locals_start,
                needed: locals_end - bytes.len(),
            });
        }

        self.offset = locals_end;
        Some(Ok(Frame {
            function: site.function,
            return_offset,
            locals: &bytes[locals_start..locals_end],
        }))
    }
}

fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&bytes[offset..offset + WORD]);
    u64::from_ne_bytes(word)
}

/// One line of a diagnostic stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: u32,
    pub name: Option<String>,
    pub return_offset: u32,
    pub frame_size: usize,
}

/// Diagnostic frame-by-frame stack trace, innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<TraceFrame>,
    /// Why the walk stopped early, if it did
    pub truncated: Option<String>,
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate() {
            match &frame.name {
                Some(name) => write!(f, "#{depth:<3} {name}")?,
                None => write!(f, "#{depth:<3} function {}", frame.function)?,
            }
            writeln!(
                f,
                " (return offset {:#x}, {} bytes of locals)",
                frame.return_offset, frame.frame_size
            )?;
        }
        if let Some(reason) = &self.truncated {
            writeln!(f, "     ... {reason}")?;
        }
        Ok(())
    }
}
