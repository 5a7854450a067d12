// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the runtime crate

use thiserror::Error;

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("failed to map {size} bytes: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("invalid program: {reason}")]
    InvalidProgram { reason: String },

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("snapshot: memory size {memory_size} is out of bounds (region size {region_size})")]
    OutOfBounds {
        memory_size: usize,
        region_size: usize,
    },

    #[error("snapshot: memory size {size} is not a multiple of {increment}")]
    MisalignedSize { size: usize, increment: usize },

    #[error("snapshot: stack offset {offset} is out of bounds (stack size {stack_size})")]
    StackOutOfBounds { offset: usize, stack_size: usize },

    #[error(transparent)]
    StackEncoding(#[from] StackEncodingError),

    #[error("failed to set up signal handler: {reason}")]
    SignalSetup { reason: String },
}

impl RuntimeError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_program(reason: impl Into<String>) -> Self {
        Self::InvalidProgram {
            reason: reason.into(),
        }
    }

    /// Whether the error leaves no sound way to continue the process.
    ///
    /// Allocation failures signal resource exhaustion, and a capture request
    /// that fails validation indicates a corrupted guest.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::OutOfBounds { .. }
                | Self::MisalignedSize { .. }
                | Self::StackOutOfBounds { .. }
        )
    }
}

/// Errors raised while walking or encoding a native call stack
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackEncodingError {
    #[error("unknown return address {address:#x} at stack offset {offset}")]
    UnknownReturnAddress { offset: usize, address: u64 },

    #[error("stack truncated at offset {offset} (need {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    #[error("frame of function {function} has size {size}, not a multiple of 8")]
    UnalignedFrame { function: u32, size: u32 },

    #[error("malformed portable stack: {reason}")]
    Malformed { reason: String },
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
