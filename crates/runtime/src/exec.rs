// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Entry point for executing compiled guest code
//!
//! The trampoline switches to the guest stack, calls the entry function with
//! the memory and stack bounds in the C argument registers, and switches back
//! when the guest returns or when the trap handler redirects a fault.
//!
//! # Guest ABI
//!
//! | Argument | x86_64 | aarch64 |
//! |----------|--------|---------|
//! | linear memory base | `rdi` | `x0` |
//! | initial memory end | `rsi` | `x1` |
//! | grow limit end | `rdx` | `x2` |
//! | stack limit (lowest stack address) | `rcx` | `x3` |
//! | text base | `r8` | `x4` |
//!
//! The result is returned in `rax` / `x0`. Callee-saved registers need not be
//! preserved; the trampoline saves what the host needs in a 32-byte frame at
//! the top of the guest stack. The host stack pointer is also published to a
//! thread-local so host imports can run on the host stack.

use crate::{
    error::RuntimeResult,
    trap::{self, Fault, GuestGuard},
};

/// Bytes the trampoline keeps at the top of the guest stack
pub(crate) const HOST_FRAME_SIZE: usize = 32;

/// Addresses passed to native code for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecArgs {
    pub text_base: usize,
    /// Lowest usable stack address
    pub stack_limit: usize,
    pub memory_base: usize,
    pub memory_init_end: usize,
    pub memory_grow_end: usize,
    /// One past the highest stack address; the stack grows down from here
    pub stack_end: usize,
}

/// How a native call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Returned(u64),
    Faulted(Fault),
}

/// Execute guest code at `entry`
///
/// Blocks until the guest returns or traps; nothing can interrupt it.
///
/// # Safety
///
/// The caller must ensure:
/// - `entry` points to executable code following the guest ABI
/// - every address in `args` belongs to live mappings owned by the caller
/// - `args.stack_end` is 16-byte aligned with at least [`HOST_FRAME_SIZE`]
///   bytes of stack below it
pub(crate) unsafe fn execute(entry: usize, args: &ExecArgs) -> RuntimeResult<Outcome> {
    trap::install_handler()?;

    let guard = GuestGuard::enter(args.stack_end - HOST_FRAME_SIZE);
    let result = enter(entry, args, trap::return_pc_ptr(), trap::host_sp_ptr());
    drop(guard);

    Ok(match trap::take_fault() {
        Some(fault) => Outcome::Faulted(fault),
        None => Outcome::Returned(result),
    })
}

/// Switch stacks and call the guest (x86_64)
///
/// Host frame, from the stack end down: host rsp, rbx, rbp, padding.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
unsafe fn enter(entry: usize, args: &ExecArgs, return_pc: *mut u64, host_sp: *mut u64) -> u64 {
    let result: u64;

    std::arch::asm!(
        // Publish the resume address for the trap handler
        "lea rax, [rip + 2f]",
        "mov [r10], rax",
        // Switch to the guest stack, saving what the host needs
        "mov rax, rsp",
        "mov [r12], rax",
        "mov rsp, r11",
        "push rax",
        "push rbx",
        "push rbp",
        "sub rsp, 8",
        "call r9",
        "2:",
        "add rsp, 8",
        "pop rbp",
        "pop rbx",
        "pop rsp",
        in("rdi") args.memory_base,
        in("rsi") args.memory_init_end,
        in("rdx") args.memory_grow_end,
        in("rcx") args.stack_limit,
        in("r8") args.text_base,
        in("r9") entry,
        in("r10") return_pc,
        in("r11") args.stack_end,
        lateout("rax") result,
        inout("r12") host_sp => _,
        out("r13") _,
        out("r14") _,
        out("r15") _,
        clobber_abi("C"),
    );

    result
}

/// Switch stacks and call the guest (aarch64)
///
/// Host frame, from the stack end down: host sp, x29, x19, padding.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
unsafe fn enter(entry: usize, args: &ExecArgs, return_pc: *mut u64, host_sp: *mut u64) -> u64 {
    let result: u64;

    std::arch::asm!(
        // Publish the resume address for the trap handler
        "adr x16, 2f",
        "str x16, [x10]",
        // Switch to the guest stack, saving what the host needs
        "mov x16, sp",
        "str x16, [x12]",
        "mov sp, x11",
        "stp x16, x29, [sp, #-16]!",
        "str x19, [sp, #-16]!",
        "blr x9",
        "2:",
        "ldr x19, [sp], #16",
        "ldp x16, x29, [sp], #16",
        "mov sp, x16",
        in("x0") args.memory_base,
        in("x1") args.memory_init_end,
        in("x2") args.memory_grow_end,
        in("x3") args.stack_limit,
        in("x4") args.text_base,
        in("x9") entry,
        in("x10") return_pc,
        in("x11") args.stack_end,
        in("x12") host_sp,
        lateout("x0") result,
        out("x20") _,
        out("x21") _,
        out("x22") _,
        out("x23") _,
        out("x24") _,
        out("x25") _,
        out("x26") _,
        out("x27") _,
        out("x28") _,
        clobber_abi("C"),
    );

    result
}

/// Fallback for other architectures (for compilation only)
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn enter(
    _entry: usize,
    _args: &ExecArgs,
    _return_pc: *mut u64,
    _host_sp: *mut u64,
) -> u64 {
    panic!("guest execution is only supported on x86_64 and aarch64");
}
