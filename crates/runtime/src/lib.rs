// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Native execution engine for precompiled WebAssembly modules
//!
//! A [`Program`] holds machine code produced ahead of time together with its
//! read-only data, initial globals, initial linear memory and call-site
//! metadata. A [`Runner`] maps a private instance of a program into memory and
//! executes its entry point natively. While running, the guest may ask the
//! host to freeze its state into a [`Snapshot`]; snapshots are kept in a
//! [`SnapshotStore`] and can seed fresh runners later.
//!
//! # Architecture
//!
//! ```text
//! Program (immutable, shared via Arc)
//!      ↓ Runner::new
//! Runner ── text / ro data / globals+memory / stack regions
//!      ↓ Runner::run ──→ guest code ──→ `snapshot` import
//!      ↓                                   ↓ Runner::capture
//! ExecutionResult                     SnapshotStore ──→ Snapshot::new_runner
//! ```
//!
//! # Platform Support
//!
//! Linux on x86_64 and aarch64.
//!
//! # Thread Safety
//!
//! Programs, snapshots and the store are shared freely. A runner is used by
//! one thread at a time; different runners execute in parallel without
//! interfering, since trap state and import sessions are thread-local.

mod codec;
mod config;
mod error;
mod exec;
mod imports;
mod program;
mod region;
mod runner;
mod snapshot;
mod store;
mod trap;
mod unwind;

pub use codec::{decode_portable, FrameCodec, PortableFrame, StackCodec};
pub use config::{
    round_up, RunnerConfig, DEFAULT_RO_DATA_SIZE, DEFAULT_STACK_SIZE, DEFAULT_TEXT_SIZE,
    MEMORY_INCREMENT, PAGE_SIZE,
};
pub use error::{RuntimeError, RuntimeResult, StackEncodingError};
pub use exec::ExecArgs;
pub use imports::{resolve as resolve_import, SNAPSHOT_IMPORT};
pub use program::{Program, ProgramBuilder, RoDataFixup, DEFAULT_ENTRY};
pub use region::{MmapAllocator, Placement, Protection, Region, RegionAllocator};
pub use runner::{ExecutionResult, Runner, TrapCause};
pub use snapshot::{Snapshot, SnapshotRequest};
pub use store::{SnapshotId, SnapshotStore};
pub use unwind::{CallSite, Frame, Frames, NativeStack, StackTrace, TraceFrame, UnwindMap};
