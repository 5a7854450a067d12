// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Trap handling for guest faults (SIGSEGV, SIGBUS, SIGILL, SIGFPE, SIGTRAP)
//!
//! # Design
//!
//! When guest code faults:
//! 1. The signal handler records the signal, faulting address, PC and SP
//! 2. SP is reset to the trampoline's saved value and PC is redirected to the
//!    instruction after the call into the guest
//! 3. The trampoline restores the host stack and returns normally
//! 4. The executor takes the recorded fault and reports a trap
//!
//! Faults on a thread that is not running guest code, including host code
//! called from the guest, go to whatever handler was installed before ours.
//! Without one, the default disposition is restored and the fault repeats, so
//! unrelated crashes are not swallowed.
//!
//! # Thread Safety
//!
//! All fault state is thread-local. Synchronous signals are delivered to the
//! faulting thread, so concurrent runners on different threads never observe
//! each other's faults. The handler runs on the alternate signal stack that
//! the Rust standard library installs for every thread, so guest stack
//! exhaustion is still recoverable.

use std::{cell::Cell, sync::OnceLock};

use libc::{c_int, c_void, sigaction, siginfo_t, SA_ONSTACK, SA_SIGINFO};

use crate::error::{RuntimeError, RuntimeResult};

/// Signals treated as guest traps
const TRAP_SIGNALS: [c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
];

/// Once guard to ensure the handler is installed exactly once per process,
/// storing the cached result from installation.
static HANDLER_INIT: OnceLock<RuntimeResult<()>> = OnceLock::new();

/// Dispositions replaced by the trap handler
static PREVIOUS: OnceLock<Vec<(c_int, sigaction)>> = OnceLock::new();

/// A fault raised by guest code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fault {
    pub signal: c_int,
    /// Faulting data address (SIGSEGV/SIGBUS) or instruction address
    pub address: usize,
    pub pc: usize,
    pub sp: usize,
}

thread_local! {
    /// True only while this thread executes guest code
    static IN_GUEST: Cell<bool> = const { Cell::new(false) };

    /// Address right after the call into the guest; the trampoline stores it
    static RETURN_PC: Cell<u64> = const { Cell::new(0) };

    /// Guest-stack SP the trampoline expects when the guest returns
    static RESUME_SP: Cell<u64> = const { Cell::new(0) };

    /// Host SP at the moment the trampoline switched to the guest stack
    static HOST_SP: Cell<u64> = const { Cell::new(0) };

    static FAULT: Cell<Option<Fault>> = const { Cell::new(None) };
}

/// Marks the current thread as running guest code until dropped
pub(crate) struct GuestGuard(());

impl GuestGuard {
    /// Arm trap recovery for one guest call resuming at `resume_sp`
    pub(crate) fn enter(resume_sp: usize) -> Self {
        FAULT.set(None);
        RESUME_SP.set(resume_sp as u64);
        IN_GUEST.set(true);
        Self(())
    }
}

impl Drop for GuestGuard {
    fn drop(&mut self) {
        IN_GUEST.set(false);
    }
}

/// Suspends trap recovery while host code runs on behalf of the guest
///
/// Faults raised by the host in the meantime are not guest traps.
pub(crate) struct HostCall {
    in_guest: bool,
}

impl HostCall {
    pub(crate) fn enter() -> Self {
        Self {
            in_guest: IN_GUEST.replace(false),
        }
    }
}

impl Drop for HostCall {
    fn drop(&mut self) {
        IN_GUEST.set(self.in_guest);
    }
}

/// Pointer the trampoline writes its resume address to
pub(crate) fn return_pc_ptr() -> *mut u64 {
    RETURN_PC.with(Cell::as_ptr)
}

/// Pointer the trampoline writes the host stack pointer to
pub(crate) fn host_sp_ptr() -> *mut u64 {
    HOST_SP.with(Cell::as_ptr)
}

/// Host stack pointer saved by the innermost guest call on this thread
///
/// Called from the import stub while still on the guest stack.
pub(crate) extern "C" fn host_stack_pointer() -> u64 {
    HOST_SP.get()
}

/// Take the fault recorded by the last guest call, if any
pub(crate) fn take_fault() -> Option<Fault> {
    FAULT.take()
}

/// Install the trap handler (once per process)
pub(crate) fn install_handler() -> RuntimeResult<()> {
    HANDLER_INIT.get_or_init(install_handler_inner).clone()
}

fn install_handler_inner() -> RuntimeResult<()> {
    let mut previous = Vec::with_capacity(TRAP_SIGNALS.len());
    for signal in TRAP_SIGNALS {
        unsafe {
            let mut sa: sigaction = std::mem::zeroed();
            sa.sa_sigaction = trap_handler as usize;
            sa.sa_flags = SA_SIGINFO | SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);

            let mut old: sigaction = std::mem::zeroed();
            if sigaction(signal, &sa, &mut old) != 0 {
                return Err(RuntimeError::SignalSetup {
                    reason: format!(
                        "sigaction({signal}) failed: {}",
                        std::io::Error::last_os_error()
                    ),
                });
            }
            previous.push((signal, old));
        }
    }
    // Only set here, inside `HANDLER_INIT`
    let _ = PREVIOUS.set(previous);
    Ok(())
}

/// Disposition `signal` had before the trap handler was installed
fn previous_action(signal: c_int) -> Option<sigaction> {
    PREVIOUS
        .get()?
        .iter()
        .find(|(s, _)| *s == signal)
        .map(|(_, action)| *action)
}

extern "C" fn trap_handler(signal: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    if !IN_GUEST.get() {
        // Safety: arguments are forwarded unchanged from the kernel.
        unsafe { chain(signal, info, ctx) };
        return;
    }

    // Safety: the kernel passes a valid siginfo_t and ucontext_t.
    unsafe {
        let address = (*info).si_addr() as usize;
        let (pc, sp) = redirect(ctx, RETURN_PC.get(), RESUME_SP.get());
        FAULT.set(Some(Fault {
            signal,
            address,
            pc,
            sp,
        }));
    }
    IN_GUEST.set(false);
}

/// Hand a fault that is not a guest trap to the previous disposition
///
/// An ignored synchronous fault would repeat forever, so it gets the default
/// disposition like an unset one.
unsafe fn chain(signal: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    match previous_action(signal) {
        Some(action)
            if action.sa_sigaction != libc::SIG_DFL && action.sa_sigaction != libc::SIG_IGN =>
        {
            if action.sa_flags & SA_SIGINFO != 0 {
                let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                    std::mem::transmute(action.sa_sigaction);
                handler(signal, info, ctx);
            } else {
                let handler: extern "C" fn(c_int) = std::mem::transmute(action.sa_sigaction);
                handler(signal);
            }
        }
        _ => restore_default(signal),
    }
}

unsafe fn restore_default(signal: c_int) {
    let mut sa: sigaction = std::mem::zeroed();
    sa.sa_sigaction = libc::SIG_DFL;
    sigaction(signal, &sa, std::ptr::null_mut());
}

/// Point the interrupted context back at the trampoline (Linux x86_64)
///
/// Returns the faulting PC and SP.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn redirect(ctx: *mut c_void, pc: u64, sp: u64) -> (usize, usize) {
    let uctx = ctx as *mut libc::ucontext_t;
    let gregs = &mut (*uctx).uc_mcontext.gregs;
    let fault_pc = gregs[libc::REG_RIP as usize] as usize;
    let fault_sp = gregs[libc::REG_RSP as usize] as usize;
    gregs[libc::REG_RIP as usize] = pc as i64;
    gregs[libc::REG_RSP as usize] = sp as i64;
    (fault_pc, fault_sp)
}

/// Point the interrupted context back at the trampoline (Linux aarch64)
///
/// Returns the faulting PC and SP.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn redirect(ctx: *mut c_void, pc: u64, sp: u64) -> (usize, usize) {
    let uctx = ctx as *mut libc::ucontext_t;
    let mcontext = &mut (*uctx).uc_mcontext;
    let fault = (mcontext.pc as usize, mcontext.sp as usize);
    mcontext.pc = pc;
    mcontext.sp = sp;
    fault
}

/// Fallback for unsupported platforms (compile-time error prevention)
#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
unsafe fn redirect(_ctx: *mut c_void, _pc: u64, _sp: u64) -> (usize, usize) {
    panic!("unsupported platform for trap handler");
}
