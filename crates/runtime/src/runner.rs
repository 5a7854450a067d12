// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One live execution instance of a program
//!
//! # Regions
//!
//! ```text
//! text          code, execute-only once loaded
//! ro data       read-only once loaded, below 4 GiB when code embeds its address
//! globals+mem   [ globals block | linear memory .............. grow limit ]
//!               0   globals_offset  memory_offset               region end
//! stack         grows down from its end
//! ```
//!
//! Regions are exclusively owned by the runner and released when it is
//! dropped. Distinct runners share nothing mutable and can run concurrently on
//! different threads.

use std::{fmt, sync::Arc};

use libc::c_int;
use tracing::{debug, info, warn};

use crate::{
    config::{round_up, RunnerConfig, MEMORY_INCREMENT, PAGE_SIZE},
    error::{RuntimeError, RuntimeResult},
    exec::{self, ExecArgs, Outcome, HOST_FRAME_SIZE},
    imports,
    program::Program,
    region::{Guard, MmapAllocator, Placement, Protection, Region, RegionAllocator},
    snapshot::{Snapshot, SnapshotRequest},
    store::{SnapshotId, SnapshotStore},
    trap::Fault,
    unwind::{NativeStack, StackTrace},
};

/// Span beyond the linear memory base a 32-bit index plus offset can reach
const MEMORY_RESERVATION: usize = 1 << 33;

/// Why guest execution stopped abnormally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapCause {
    StackOverflow,
    /// Access outside linear memory, at this offset from its base
    MemoryOutOfBounds { offset: usize },
    Unreachable,
    IntegerDivision,
    /// Any other fault
    Fault { signal: c_int, address: usize },
}

impl fmt::Display for TrapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => f.write_str("call stack exhausted"),
            Self::MemoryOutOfBounds { offset } => {
                write!(f, "out of bounds memory access at offset {offset:#x}")
            }
            Self::Unreachable => f.write_str("unreachable"),
            Self::IntegerDivision => f.write_str("integer divide by zero or overflow"),
            Self::Fault { signal, address } => {
                write!(f, "signal {signal} at address {address:#x}")
            }
        }
    }
}

/// Result of running a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The entry function returned `result`
    Completed { result: u64 },
    /// The guest faulted; `trace` is a best-effort diagnostic
    Trapped { cause: TrapCause, trace: StackTrace },
}

/// Live execution instance
pub struct Runner {
    program: Arc<Program>,
    text: Region,
    ro_data: Region,
    globals_memory: Region,
    stack: Region,
    globals_offset: usize,
    memory_offset: usize,
    memory_limit: usize,
    grow_memory_size: usize,
}

impl Runner {
    /// Map a fresh instance of `program`
    pub fn new(program: Arc<Program>, config: RunnerConfig) -> RuntimeResult<Self> {
        Self::with_allocator(program, config, &MmapAllocator)
    }

    /// Like [`Runner::new`], mapping regions through `allocator`
    pub fn with_allocator(
        program: Arc<Program>,
        config: RunnerConfig,
        allocator: &impl RegionAllocator,
    ) -> RuntimeResult<Self> {
        Self::build(&program, program.globals(), program.data(), config, allocator)
    }

    /// Map an instance of `program` initialized from `globals` and `data`
    ///
    /// Every size check happens before the first allocation.
    pub(crate) fn build(
        program: &Arc<Program>,
        globals: &[u8],
        data: &[u8],
        config: RunnerConfig,
        allocator: &impl RegionAllocator,
    ) -> RuntimeResult<Self> {
        config.validate()?;

        let memory_offset = program.memory_offset();
        if data.len() > config.init_memory_size {
            return Err(RuntimeError::configuration(format!(
                "{} bytes of initial data exceed initial memory size {}",
                data.len(),
                config.init_memory_size
            )));
        }
        if globals.len() > memory_offset {
            return Err(RuntimeError::configuration(format!(
                "{} bytes of globals exceed globals block size {memory_offset}",
                globals.len()
            )));
        }
        let globals_offset = memory_offset - globals.len();

        let placement = if program.ro_data_fixups().is_empty() {
            Placement::Anywhere
        } else {
            Placement::Low32
        };
        let mut ro_data = allocator.allocate(
            round_up(program.ro_data().len(), PAGE_SIZE),
            Protection::READ_WRITE,
            placement,
        )?;
        ro_data.write_at(0, program.ro_data())?;
        allocator.retag(&mut ro_data, Protection::READ)?;

        let mut text = allocator.allocate(
            round_up(program.code().len(), PAGE_SIZE),
            Protection::all(),
            Placement::Anywhere,
        )?;
        text.write_at(0, program.code())?;
        for fixup in program.ro_data_fixups() {
            let address = u32::try_from(ro_data.base() + fixup.addend as usize).map_err(|_| {
                RuntimeError::Allocation {
                    size: ro_data.size(),
                    reason: "read-only data mapped above 4 GiB".into(),
                }
            })?;
            text.write_at(fixup.code_offset as usize, &address.to_le_bytes())?;
        }
        allocator.retag(&mut text, Protection::EXEC)?;

        let mut globals_memory = allocator.allocate_guarded(
            memory_offset + round_up(config.grow_memory_size, MEMORY_INCREMENT),
            Protection::READ_WRITE,
            Guard::Above,
        )?;
        globals_memory.write_at(globals_offset, globals)?;
        globals_memory.write_at(memory_offset, data)?;

        let stack =
            allocator.allocate_guarded(config.stack_size, Protection::READ_WRITE, Guard::Below)?;

        let memory_limit = globals_memory.base() + memory_offset + config.init_memory_size;

        debug!(
            text = format_args!("{:#x}", text.base()),
            ro_data = format_args!("{:#x}", ro_data.base()),
            globals_memory = format_args!("{:#x}", globals_memory.base()),
            stack = format_args!("{:#x}", stack.base()),
            init_memory_size = config.init_memory_size,
            grow_memory_size = config.grow_memory_size,
            "created runner"
        );

        Ok(Self {
            program: Arc::clone(program),
            text,
            ro_data,
            globals_memory,
            stack,
            globals_offset,
            memory_offset,
            memory_limit,
            grow_memory_size: config.grow_memory_size,
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn text(&self) -> &Region {
        &self.text
    }

    pub fn ro_data(&self) -> &Region {
        &self.ro_data
    }

    pub fn globals_memory(&self) -> &Region {
        &self.globals_memory
    }

    pub fn stack(&self) -> &Region {
        &self.stack
    }

    /// Offset of the first initialized global within the globals+memory region
    pub fn globals_offset(&self) -> usize {
        self.globals_offset
    }

    /// Offset of linear memory within the globals+memory region
    pub fn memory_offset(&self) -> usize {
        self.memory_offset
    }

    /// Absolute address of linear memory
    pub fn memory_base(&self) -> usize {
        self.globals_memory.base() + self.memory_offset
    }

    /// Absolute end address of the initial linear memory
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn grow_memory_size(&self) -> usize {
        self.grow_memory_size
    }

    /// Addresses handed to the guest on entry
    pub fn exec_args(&self) -> ExecArgs {
        ExecArgs {
            text_base: self.text.base(),
            stack_limit: self.stack.base(),
            memory_base: self.memory_base(),
            memory_init_end: self.memory_limit,
            memory_grow_end: self.memory_base() + self.grow_memory_size,
            stack_end: self.stack.end(),
        }
    }

    /// Run the program from its entry point
    ///
    /// Blocks until the guest returns or traps. Snapshots the guest requests
    /// along the way are appended to `store`.
    pub fn run(&mut self, store: &SnapshotStore) -> RuntimeResult<ExecutionResult> {
        let entry = self.text.base() + self.program.entry_offset() as usize;
        let args = self.exec_args();
        debug!(
            entry = self.program.entry(),
            address = format_args!("{entry:#x}"),
            "entering guest"
        );

        // Safety: entry and every address in `args` come from regions owned
        // by `self`, which stay mapped for the duration of the call.
        let outcome = imports::with_session(self, store, || unsafe { exec::execute(entry, &args) })?;

        Ok(match outcome {
            Outcome::Returned(result) => {
                debug!(result, "guest completed");
                ExecutionResult::Completed { result }
            }
            Outcome::Faulted(fault) => {
                let cause = self.classify(&fault);
                let trace = self.fault_trace(&fault);
                warn!(%cause, pc = format_args!("{:#x}", fault.pc), "guest trapped");
                ExecutionResult::Trapped { cause, trace }
            }
        })
    }

    /// Freeze the current state into a new snapshot in `store`
    ///
    /// Fails without side effects if the request does not describe this
    /// runner's memory and stack. Failing to encode the portable stack is
    /// not an error: the snapshot then carries the native stack only.
    pub fn capture(
        &self,
        request: SnapshotRequest,
        store: &SnapshotStore,
    ) -> RuntimeResult<SnapshotId> {
        info!("--- snapshotting ---");
        info!(
            memory_limit = format_args!("{:#x}", request.memory_limit),
            stack_ptr = format_args!("{:#x}", request.stack_ptr),
            "snapshot request"
        );

        let region_size = self.globals_memory.size();
        let globals_memory_size = (request.memory_limit as usize).wrapping_sub(self.globals_memory.base());
        if globals_memory_size >= region_size {
            return Err(RuntimeError::OutOfBounds {
                memory_size: globals_memory_size,
                region_size,
            });
        }

        let memory_size = globals_memory_size
            .checked_sub(self.memory_offset)
            .ok_or(RuntimeError::OutOfBounds {
                memory_size: globals_memory_size,
                region_size,
            })?;
        if memory_size % MEMORY_INCREMENT != 0 {
            return Err(RuntimeError::MisalignedSize {
                size: memory_size,
                increment: MEMORY_INCREMENT,
            });
        }

        let stack_offset = (request.stack_ptr as usize).wrapping_sub(self.stack.base());
        if stack_offset >= self.stack.size() {
            return Err(RuntimeError::StackOutOfBounds {
                offset: stack_offset,
                stack_size: self.stack.size(),
            });
        }

        info!(
            globals_memory = format_args!("{:#x}", self.globals_memory.base()),
            stack = format_args!("{:#x}", self.stack.base()),
            globals_memory_size,
            memory_size,
            stack_offset,
            "snapshot layout"
        );

        let live_stack = self.stack.slice_from(stack_offset);
        let native = self.native_stack(live_stack);
        info!("stacktrace:\n{}", self.program.stacktrace(native));

        let portable_stack = match self.program.export_stack(native) {
            Ok(portable) => Some(portable),
            Err(e) => {
                warn!(error = %e, "portable stack encoding failed, keeping native stack only");
                None
            }
        };

        let memory = self.globals_memory.as_slice();
        let snapshot = Snapshot::new(
            Arc::clone(&self.program),
            memory_size,
            memory[self.globals_offset..self.memory_offset].to_vec(),
            memory[self.memory_offset..globals_memory_size].to_vec(),
            portable_stack,
            live_stack.to_vec(),
        );

        let id = store.push(snapshot);
        info!(%id, "--- shot snapped ---");
        Ok(id)
    }

    fn native_stack<'a>(&self, bytes: &'a [u8]) -> NativeStack<'a> {
        let text_base = self.text.base() as u64;
        let text_end = text_base + self.program.code().len() as u64;
        NativeStack::new(bytes, text_base..text_end, HOST_FRAME_SIZE)
    }

    fn classify(&self, fault: &Fault) -> TrapCause {
        match fault.signal {
            libc::SIGILL | libc::SIGTRAP => TrapCause::Unreachable,
            libc::SIGFPE => TrapCause::IntegerDivision,
            libc::SIGSEGV | libc::SIGBUS => {
                let stack_base = self.stack.base();
                let below_stack = fault.address < stack_base
                    && fault.address >= stack_base.saturating_sub(self.stack.size());
                let memory_base = self.memory_base();
                if below_stack || fault.sp < stack_base {
                    TrapCause::StackOverflow
                } else if fault.address >= memory_base
                    && fault.address - memory_base < MEMORY_RESERVATION
                {
                    TrapCause::MemoryOutOfBounds {
                        offset: fault.address - memory_base,
                    }
                } else {
                    TrapCause::Fault {
                        signal: fault.signal,
                        address: fault.address,
                    }
                }
            }
            signal => TrapCause::Fault {
                signal,
                address: fault.address,
            },
        }
    }

    fn fault_trace(&self, fault: &Fault) -> StackTrace {
        if !self.stack.contains(fault.sp) {
            return StackTrace::default();
        }
        let live_stack = self.stack.slice_from(fault.sp - self.stack.base());
        self.program.unwind().scan_stacktrace(self.native_stack(live_stack))
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("text", &self.text)
            .field("ro_data", &self.ro_data)
            .field("globals_memory", &self.globals_memory)
            .field("stack", &self.stack)
            .field("globals_offset", &self.globals_offset)
            .field("memory_offset", &self.memory_offset)
            .field("memory_limit", &format_args!("{:#x}", self.memory_limit))
            .field("grow_memory_size", &self.grow_memory_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Runner, TrapCause};
    use crate::{
        codec::decode_portable,
        config::{RunnerConfig, DEFAULT_STACK_SIZE, MEMORY_INCREMENT, PAGE_SIZE},
        exec::HOST_FRAME_SIZE,
        program::{returning_code, Program, RoDataFixup},
        region::{mock::CountingAllocator, Placement, Protection},
        snapshot::SnapshotRequest,
        store::{SnapshotId, SnapshotStore},
        trap::Fault,
        RuntimeError,
    };

    /// Program with one page of globals and some initial memory
    fn program_with_state() -> Arc<Program> {
        let program = Program::builder(returning_code(7))
            .entry_point("main", 0)
            .globals(vec![0x11; 64], PAGE_SIZE)
            .data(b"initial memory contents".to_vec())
            .build()
            .expect("program should be valid");
        Arc::new(program)
    }

    /// Request describing a runner that has not executed anything yet
    fn idle_request(runner: &Runner) -> SnapshotRequest {
        SnapshotRequest {
            memory_limit: runner.memory_limit() as u64,
            stack_ptr: (runner.stack().end() - HOST_FRAME_SIZE - 8) as u64,
        }
    }

    fn request_with_memory_size(runner: &Runner, memory_size: usize) -> SnapshotRequest {
        SnapshotRequest {
            memory_limit: (runner.memory_base() + memory_size) as u64,
            ..idle_request(runner)
        }
    }

    #[test]
    fn test_region_layout() {
        let program = program_with_state();
        for grow in [MEMORY_INCREMENT, 3 * MEMORY_INCREMENT, 16 * MEMORY_INCREMENT] {
            let config = RunnerConfig::new(MEMORY_INCREMENT, grow, DEFAULT_STACK_SIZE);
            let runner = Runner::new(Arc::clone(&program), config).expect("runner should build");

            assert_eq!(runner.globals_memory().size(), PAGE_SIZE + grow);
            assert_eq!(runner.memory_offset(), PAGE_SIZE);
            assert_eq!(runner.globals_offset(), PAGE_SIZE - 64);
            assert_eq!(runner.memory_limit(), runner.memory_base() + MEMORY_INCREMENT);
            assert_eq!(runner.stack().size(), DEFAULT_STACK_SIZE);
            assert_eq!(runner.text().protection(), Protection::EXEC);
            assert_eq!(runner.ro_data().protection(), Protection::READ);
        }
    }

    #[test]
    fn test_initial_state_copied() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");

        let memory = runner.globals_memory().as_slice();
        assert!(memory[..PAGE_SIZE - 64].iter().all(|&b| b == 0));
        assert!(memory[PAGE_SIZE - 64..PAGE_SIZE].iter().all(|&b| b == 0x11));
        assert_eq!(
            &memory[PAGE_SIZE..PAGE_SIZE + 23],
            b"initial memory contents"
        );
    }

    #[test]
    fn test_exec_args() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");

        let args = runner.exec_args();
        assert_eq!(args.text_base, runner.text().base());
        assert_eq!(args.stack_limit, runner.stack().base());
        assert_eq!(args.stack_end, runner.stack().end());
        assert_eq!(args.memory_base, runner.globals_memory().base() + PAGE_SIZE);
        assert_eq!(args.memory_init_end, args.memory_base + MEMORY_INCREMENT);
        assert_eq!(args.memory_grow_end, runner.globals_memory().end());
    }

    #[test]
    fn test_zero_stack_never_allocates() {
        let allocator = CountingAllocator::new();
        let result = Runner::with_allocator(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, MEMORY_INCREMENT, 0),
            &allocator,
        );
        assert!(matches!(result, Err(RuntimeError::Configuration { .. })));
        assert_eq!(allocator.allocations(), 0);
    }

    #[test]
    fn test_bad_memory_sizes_never_allocate() {
        let allocator = CountingAllocator::new();
        let configs = [
            RunnerConfig::new(2 * MEMORY_INCREMENT, MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
            RunnerConfig::new(100, MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
            // initial data does not fit in zero pages
            RunnerConfig::new(0, MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        ];
        for config in configs {
            let result = Runner::with_allocator(program_with_state(), config, &allocator);
            assert!(matches!(result, Err(RuntimeError::Configuration { .. })));
        }
        assert_eq!(allocator.allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        let allocator = CountingAllocator::failing();
        let err = Runner::with_allocator(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
            &allocator,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Allocation { .. }));
        assert!(err.is_fatal());
        assert_eq!(allocator.allocations(), 1);
    }

    #[test]
    fn test_ro_data_fixups_use_low_placement() {
        let mut code = returning_code(0);
        let fixup_offset = code.len() as u32;
        code.extend_from_slice(&[0; 4]);
        let program = Program::builder(code)
            .entry_point("main", 0)
            .ro_data(
                b"constant".to_vec(),
                vec![RoDataFixup {
                    code_offset: fixup_offset,
                    addend: 4,
                }],
            )
            .build()
            .expect("program should be valid");

        let allocator = CountingAllocator::new();
        let runner = Runner::with_allocator(
            Arc::new(program),
            RunnerConfig::new(0, MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
            &allocator,
        )
        .expect("runner should build");

        assert_eq!(allocator.placements()[0], (PAGE_SIZE, Placement::Low32));
        assert!(runner.ro_data().end() <= 1 << 32);
        assert_eq!(&runner.ro_data().as_slice()[..8], b"constant");
    }

    #[test]
    fn test_capture_idle_runner() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        let id = runner
            .capture(idle_request(&runner), &store)
            .expect("capture should succeed");
        assert_eq!(id, SnapshotId::new(0));

        let snapshot = store.get(id).expect("snapshot stored");
        assert_eq!(snapshot.memory_size(), MEMORY_INCREMENT);
        assert_eq!(snapshot.globals(), &[0x11; 64][..]);
        assert_eq!(snapshot.data().len(), MEMORY_INCREMENT);
        assert_eq!(&snapshot.data()[..23], b"initial memory contents");
        assert_eq!(snapshot.native_stack().len(), HOST_FRAME_SIZE + 8);

        let portable = snapshot.portable_stack().expect("empty stack is encodable");
        assert!(decode_portable(portable).expect("decodes").is_empty());
    }

    #[test]
    fn test_capture_memory_limit_boundary() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();
        let region_end = runner.globals_memory().end() as u64;

        let at_end = SnapshotRequest {
            memory_limit: region_end,
            ..idle_request(&runner)
        };
        assert!(matches!(
            runner.capture(at_end, &store),
            Err(RuntimeError::OutOfBounds { .. })
        ));

        // One byte less passes the bounds check; it then fails alignment.
        let below_end = SnapshotRequest {
            memory_limit: region_end - 1,
            ..idle_request(&runner)
        };
        assert!(matches!(
            runner.capture(below_end, &store),
            Err(RuntimeError::MisalignedSize { .. })
        ));

        let below_region = SnapshotRequest {
            memory_limit: runner.globals_memory().base() as u64 - 1,
            ..idle_request(&runner)
        };
        assert!(matches!(
            runner.capture(below_region, &store),
            Err(RuntimeError::OutOfBounds { .. })
        ));

        let inside_globals = SnapshotRequest {
            memory_limit: runner.globals_memory().base() as u64 + 16,
            ..idle_request(&runner)
        };
        assert!(matches!(
            runner.capture(inside_globals, &store),
            Err(RuntimeError::OutOfBounds { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_capture_memory_size_alignment() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 4 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        let err = runner
            .capture(request_with_memory_size(&runner, 65537), &store)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::MisalignedSize {
                size: 65537,
                increment: MEMORY_INCREMENT
            }
        );
        assert!(err.is_fatal());

        let id = runner
            .capture(request_with_memory_size(&runner, 131072), &store)
            .expect("aligned size should be accepted");
        let snapshot = store.get(id).expect("snapshot stored");
        assert_eq!(snapshot.memory_size(), 131072);
        assert_eq!(snapshot.data().len(), 131072);
    }

    #[test]
    fn test_capture_empty_memory() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        let id = runner
            .capture(request_with_memory_size(&runner, 0), &store)
            .expect("zero memory is aligned");
        let snapshot = store.get(id).expect("snapshot stored");
        assert_eq!(snapshot.memory_size(), 0);
        assert!(snapshot.data().is_empty());
    }

    #[test]
    fn test_capture_stack_bounds() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        for stack_ptr in [runner.stack().end(), runner.stack().base() - 8] {
            let request = SnapshotRequest {
                stack_ptr: stack_ptr as u64,
                ..idle_request(&runner)
            };
            assert!(matches!(
                runner.capture(request, &store),
                Err(RuntimeError::StackOutOfBounds { .. })
            ));
        }

        let deepest = SnapshotRequest {
            stack_ptr: runner.stack().base() as u64,
            ..idle_request(&runner)
        };
        let id = runner.capture(deepest, &store).expect("stack base is in bounds");
        let snapshot = store.get(id).expect("snapshot stored");
        assert_eq!(snapshot.native_stack().len(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_capture_keeps_native_stack_when_encoding_fails() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        // Zeroed stack with no host frame shape: not walkable
        let request = SnapshotRequest {
            stack_ptr: (runner.stack().end() - 128) as u64,
            ..idle_request(&runner)
        };
        let id = runner.capture(request, &store).expect("capture still succeeds");
        let snapshot = store.get(id).expect("snapshot stored");
        assert!(snapshot.portable_stack().is_none());
        assert_eq!(snapshot.native_stack(), &[0u8; 128][..]);
    }

    #[test]
    fn test_capture_ids_are_sequential() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let store = SnapshotStore::new();

        let ids: Vec<_> = (0..5)
            .map(|_| runner.capture(idle_request(&runner), &store).expect("capture"))
            .map(SnapshotId::get)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_classify_faults() {
        let runner = Runner::new(
            program_with_state(),
            RunnerConfig::new(MEMORY_INCREMENT, 2 * MEMORY_INCREMENT, DEFAULT_STACK_SIZE),
        )
        .expect("runner should build");
        let inside_stack = runner.stack().end() - 64;
        let fault = |signal, address, sp| Fault {
            signal,
            address,
            pc: 0,
            sp,
        };

        assert_eq!(
            runner.classify(&fault(libc::SIGILL, 0, inside_stack)),
            TrapCause::Unreachable
        );
        assert_eq!(
            runner.classify(&fault(libc::SIGFPE, 0, inside_stack)),
            TrapCause::IntegerDivision
        );
        assert_eq!(
            runner.classify(&fault(libc::SIGSEGV, runner.stack().base() - 8, runner.stack().base())),
            TrapCause::StackOverflow
        );
        assert_eq!(
            runner.classify(&fault(
                libc::SIGSEGV,
                runner.memory_base() + 4 * MEMORY_INCREMENT,
                inside_stack
            )),
            TrapCause::MemoryOutOfBounds {
                offset: 4 * MEMORY_INCREMENT
            }
        );
        assert!(matches!(
            runner.classify(&fault(libc::SIGSEGV, 8, inside_stack)),
            TrapCause::Fault { address: 8, .. }
        ));
    }
}
