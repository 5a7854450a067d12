// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Host functions callable from guest code
//!
//! Guest code reaches the host through absolute addresses patched into its
//! text at load time. The only import is `snapshot`, which freezes the calling
//! runner and returns the new snapshot id.
//!
//! Imports find their runner through a thread-local session that
//! [`Runner::run`] opens for the duration of the guest call.
//!
//! The address handed to the guest is an assembly stub, not the Rust
//! function: the stub moves onto the host stack saved by the trampoline
//! before calling into Rust, and back onto the guest stack afterwards. Host
//! code therefore never consumes guest stack, and the guest stack is not
//! written to while it is being copied.
//!
//! [`Runner::run`]: crate::Runner::run

use std::{cell::Cell, ptr};

use tracing::error;

use crate::{
    runner::Runner,
    snapshot::SnapshotRequest,
    store::SnapshotStore,
    trap::{self, HostCall},
};

/// Import name for snapshot capture
pub const SNAPSHOT_IMPORT: &str = "snapshot";

#[derive(Clone, Copy)]
struct Session {
    runner: *const Runner,
    store: *const SnapshotStore,
}

thread_local! {
    static SESSION: Cell<Option<Session>> = const { Cell::new(None) };
}

/// Restores the previous session when dropped
struct SessionGuard(Option<Session>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION.set(self.0);
    }
}

/// Run `f` with `runner` and `store` reachable from host imports
pub(crate) fn with_session<R>(runner: &Runner, store: &SnapshotStore, f: impl FnOnce() -> R) -> R {
    let previous = SESSION.replace(Some(Session {
        runner: ptr::from_ref(runner),
        store: ptr::from_ref(store),
    }));
    let _guard = SessionGuard(previous);
    f()
}

/// Address of the host function implementing import `name`
pub fn resolve(name: &str) -> Option<usize> {
    match name {
        SNAPSHOT_IMPORT => Some(snapshot_entry()),
        _ => None,
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn native_runtime_snapshot_stub();
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn snapshot_entry() -> usize {
    native_runtime_snapshot_stub as usize
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn snapshot_entry() -> usize {
    snapshot_import as usize
}

// Guest stack on entry: rdi = memory limit, rsi = stack pointer. rbx holds
// the guest SP across the host call.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl native_runtime_snapshot_stub",
    ".hidden native_runtime_snapshot_stub",
    ".type native_runtime_snapshot_stub, @function",
    "native_runtime_snapshot_stub:",
    "push rbx",
    "mov rbx, rsp",
    "and rsp, -16",
    "push rdi",
    "push rsi",
    "call {host_sp}",
    "pop rsi",
    "pop rdi",
    "mov rsp, rax",
    "and rsp, -16",
    "call {capture}",
    "mov rsp, rbx",
    "pop rbx",
    "ret",
    ".size native_runtime_snapshot_stub, . - native_runtime_snapshot_stub",
    host_sp = sym trap::host_stack_pointer,
    capture = sym snapshot_import,
);

// Guest stack on entry: x0 = memory limit, x1 = stack pointer. x29 holds the
// guest SP across the host call.
#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl native_runtime_snapshot_stub",
    ".hidden native_runtime_snapshot_stub",
    ".type native_runtime_snapshot_stub, %function",
    "native_runtime_snapshot_stub:",
    "stp x29, x30, [sp, #-32]!",
    "stp x0, x1, [sp, #16]",
    "mov x29, sp",
    "bl {host_sp}",
    "ldp x1, x2, [sp, #16]",
    "and x3, x0, #0xfffffffffffffff0",
    "mov sp, x3",
    "mov x0, x1",
    "mov x1, x2",
    "bl {capture}",
    "mov sp, x29",
    "ldp x29, x30, [sp], #32",
    "ret",
    ".size native_runtime_snapshot_stub, . - native_runtime_snapshot_stub",
    host_sp = sym trap::host_stack_pointer,
    capture = sym snapshot_import,
);

/// Guest-callable snapshot capture
///
/// Takes the guest's memory limit address and stack pointer, returns the new
/// snapshot id. Invalid requests and allocation failures are unrecoverable
/// for the guest: the process aborts.
extern "C" fn snapshot_import(memory_limit: u64, stack_ptr: u64) -> u64 {
    let _host = HostCall::enter();
    let Some(session) = SESSION.get() else {
        error!("snapshot import called outside of a guest execution");
        std::process::abort();
    };

    // Safety: the session only exists while `with_session` borrows both.
    let (runner, store) = unsafe { (&*session.runner, &*session.store) };
    let request = SnapshotRequest {
        memory_limit,
        stack_ptr,
    };
    match runner.capture(request, store) {
        Ok(id) => id.get(),
        Err(e) => {
            error!(error = %e, "snapshot failed");
            std::process::abort();
        }
    }
}
