// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the runtime crate
//!
//! Runs small hand-assembled guests through the full pipeline: build program →
//! map runner → execute natively → capture and restore snapshots.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::{sync::Arc, thread};

use runtime::{
    decode_portable, resolve_import, ExecutionResult, Program, Runner, RunnerConfig, SnapshotId,
    SnapshotStore, TrapCause, DEFAULT_STACK_SIZE, MEMORY_INCREMENT, SNAPSHOT_IMPORT,
};

const STACK_SIZE: usize = DEFAULT_STACK_SIZE;

const GROW_MEMORY_SIZE: usize = 4 * MEMORY_INCREMENT;

/// Locals of the deep guest frame, leaving about 4 KiB of the default stack
const DEEP_FRAME_SIZE: u32 = 60 * 1024;

/// `return value`
#[cfg(target_arch = "x86_64")]
fn returning(value: u32) -> Vec<u8> {
    let mut code = vec![0xb8]; // mov eax, imm32
    code.extend_from_slice(&value.to_le_bytes());
    code.push(0xc3); // ret
    code
}

#[cfg(target_arch = "aarch64")]
fn returning(value: u32) -> Vec<u8> {
    words(&[
        movz(0, value as u16, 0),
        movk(0, (value >> 16) as u16, 1),
        0xd65f03c0, // ret
    ])
}

/// `return snapshot(memory_init_end, <own return address slot>)`
#[cfg(target_arch = "x86_64")]
fn snapshotting() -> Vec<u8> {
    let import = resolve_import(SNAPSHOT_IMPORT).expect("snapshot import exists") as u64;
    let mut code = vec![
        0x48, 0x83, 0xec, 0x08, // sub rsp, 8
        0x48, 0x89, 0xf7, // mov rdi, rsi
        0x48, 0x8d, 0x74, 0x24, 0x08, // lea rsi, [rsp + 8]
        0x48, 0xb8, // movabs rax, imm64
    ];
    code.extend_from_slice(&import.to_le_bytes());
    code.extend_from_slice(&[
        0xff, 0xd0, // call rax
        0x48, 0x83, 0xc4, 0x08, // add rsp, 8
        0xc3, // ret
    ]);
    code
}

#[cfg(target_arch = "aarch64")]
fn snapshotting() -> Vec<u8> {
    let import = resolve_import(SNAPSHOT_IMPORT).expect("snapshot import exists") as u64;
    words(&[
        0xa9bf7bfd, // stp x29, x30, [sp, #-16]!
        0xaa0103e0, // mov x0, x1
        0x910023e1, // add x1, sp, #8
        movz(16, import as u16, 0),
        movk(16, (import >> 16) as u16, 1),
        movk(16, (import >> 32) as u16, 2),
        movk(16, (import >> 48) as u16, 3),
        0xd63f0200, // blr x16
        0xa8c17bfd, // ldp x29, x30, [sp], #16
        0xd65f03c0, // ret
    ])
}

/// Like [`snapshotting`], from a frame that fills most of the stack
#[cfg(target_arch = "x86_64")]
fn snapshotting_deep() -> Vec<u8> {
    let import = resolve_import(SNAPSHOT_IMPORT).expect("snapshot import exists") as u64;
    let frame = (DEEP_FRAME_SIZE + 8).to_le_bytes();
    let mut code = vec![0x48, 0x89, 0xf7]; // mov rdi, rsi
    code.extend_from_slice(&[0x48, 0x81, 0xec]); // sub rsp, imm32
    code.extend_from_slice(&frame);
    code.extend_from_slice(&[0x48, 0x8d, 0xb4, 0x24]); // lea rsi, [rsp + disp32]
    code.extend_from_slice(&frame);
    code.extend_from_slice(&[0x48, 0xb8]); // movabs rax, imm64
    code.extend_from_slice(&import.to_le_bytes());
    code.extend_from_slice(&[0xff, 0xd0]); // call rax
    code.extend_from_slice(&[0x48, 0x81, 0xc4]); // add rsp, imm32
    code.extend_from_slice(&frame);
    code.push(0xc3); // ret
    code
}

#[cfg(target_arch = "aarch64")]
fn snapshotting_deep() -> Vec<u8> {
    assert_eq!(DEEP_FRAME_SIZE, 15 << 12);
    let import = resolve_import(SNAPSHOT_IMPORT).expect("snapshot import exists") as u64;
    words(&[
        0xa9bf7bfd, // stp x29, x30, [sp, #-16]!
        0xd1403fff, // sub sp, sp, #15, lsl #12
        0xaa0103e0, // mov x0, x1
        0x91403fe1, // add x1, sp, #15, lsl #12
        0x91002021, // add x1, x1, #8
        movz(16, import as u16, 0),
        movk(16, (import >> 16) as u16, 1),
        movk(16, (import >> 32) as u16, 2),
        movk(16, (import >> 48) as u16, 3),
        0xd63f0200, // blr x16
        0x91403fff, // add sp, sp, #15, lsl #12
        0xa8c17bfd, // ldp x29, x30, [sp], #16
        0xd65f03c0, // ret
    ])
}

/// Calls itself until the stack runs out
#[cfg(target_arch = "x86_64")]
fn recursing() -> Vec<u8> {
    vec![0xe8, 0xfb, 0xff, 0xff, 0xff] // call <self>
}

#[cfg(target_arch = "aarch64")]
fn recursing() -> Vec<u8> {
    words(&[
        0xa9bf7bfd, // stp x29, x30, [sp, #-16]!
        0x97ffffff, // bl <self>
    ])
}

/// Loads the first byte past the grow limit
#[cfg(target_arch = "x86_64")]
fn loading_past_grow_limit() -> Vec<u8> {
    vec![
        0x8a, 0x02, // mov al, [rdx]
        0xc3, // ret
    ]
}

#[cfg(target_arch = "aarch64")]
fn loading_past_grow_limit() -> Vec<u8> {
    words(&[
        0x39400040, // ldrb w0, [x2]
        0xd65f03c0, // ret
    ])
}

/// Executes an undefined instruction
#[cfg(target_arch = "x86_64")]
fn unreachable() -> Vec<u8> {
    vec![0x0f, 0x0b] // ud2
}

#[cfg(target_arch = "aarch64")]
fn unreachable() -> Vec<u8> {
    words(&[0x0000_0000]) // udf #0
}

#[cfg(target_arch = "aarch64")]
fn movz(rd: u32, imm: u16, hw: u32) -> u32 {
    0xd2800000 | (hw << 21) | ((imm as u32) << 5) | rd
}

#[cfg(target_arch = "aarch64")]
fn movk(rd: u32, imm: u16, hw: u32) -> u32 {
    0xf2800000 | (hw << 21) | ((imm as u32) << 5) | rd
}

#[cfg(target_arch = "aarch64")]
fn words(instructions: &[u32]) -> Vec<u8> {
    instructions.iter().flat_map(|i| i.to_le_bytes()).collect()
}

fn program(code: Vec<u8>) -> Arc<Program> {
    Arc::new(Program::with_single_entry(code, "main").expect("program should be valid"))
}

fn config() -> RunnerConfig {
    RunnerConfig::new(MEMORY_INCREMENT, GROW_MEMORY_SIZE, STACK_SIZE)
}

#[test]
fn test_run_returns_value() {
    let mut runner = Runner::new(program(returning(42)), config()).expect("runner should build");
    let store = SnapshotStore::new();

    let result = runner.run(&store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 42 });
    assert!(store.is_empty());
}

#[test]
fn test_run_twice() {
    let mut runner = Runner::new(program(returning(7)), config()).expect("runner should build");
    let store = SnapshotStore::new();

    for _ in 0..2 {
        let result = runner.run(&store).expect("run should succeed");
        assert_eq!(result, ExecutionResult::Completed { result: 7 });
    }
}

#[test]
fn test_guest_snapshot() {
    let program = Arc::new(
        Program::builder(snapshotting())
            .entry_point("main", 0)
            .data(b"hello snapshot".to_vec())
            .build()
            .expect("program should be valid"),
    );
    let mut runner = Runner::new(program, config()).expect("runner should build");
    let store = SnapshotStore::new();

    let result = runner.run(&store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 0 });
    assert_eq!(store.len(), 1);

    let snapshot = store.get(SnapshotId::new(0)).expect("snapshot stored");
    assert_eq!(snapshot.memory_size(), MEMORY_INCREMENT);
    assert_eq!(&snapshot.data()[..14], b"hello snapshot");

    // The guest called the import straight from its entry point: no guest
    // frames sit between it and the trampoline.
    let portable = snapshot.portable_stack().expect("stack is walkable");
    assert!(decode_portable(portable).expect("decodes").is_empty());

    let result = runner.run(&store).expect("second run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 1 });
    assert_eq!(store.len(), 2);
}

#[test]
fn test_restored_runner() {
    let mut runner = Runner::new(program(snapshotting()), config()).expect("runner should build");
    let store = SnapshotStore::new();
    runner.run(&store).expect("run should succeed");
    let snapshot = store.get(SnapshotId::new(0)).expect("snapshot stored");

    let mut restored = snapshot
        .new_runner(GROW_MEMORY_SIZE, STACK_SIZE)
        .expect("restore should succeed");
    let fresh_store = SnapshotStore::new();
    let result = restored.run(&fresh_store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 0 });
    assert_eq!(fresh_store.len(), 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_trap_is_reported() {
    let mut runner = Runner::new(program(unreachable()), config()).expect("runner should build");
    let store = SnapshotStore::new();

    match runner.run(&store).expect("trap is not a runtime error") {
        ExecutionResult::Trapped { cause, .. } => assert_eq!(cause, TrapCause::Unreachable),
        other => panic!("expected a trap, got {other:?}"),
    }

    // The thread is still usable for guest code after a trap
    let mut runner = Runner::new(program(returning(3)), config()).expect("runner should build");
    let result = runner.run(&store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 3 });
}

#[test]
fn test_snapshot_from_deep_frame() {
    let mut runner =
        Runner::new(program(snapshotting_deep()), config()).expect("runner should build");
    let store = SnapshotStore::new();

    // Capture runs on the host stack: the little guest stack left is enough
    let result = runner.run(&store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 0 });
    assert_eq!(store.len(), 1);

    let snapshot = store.get(SnapshotId::new(0)).expect("snapshot stored");
    let portable = snapshot.portable_stack().expect("stack is walkable");
    assert!(decode_portable(portable).expect("decodes").is_empty());
}

#[test]
fn test_stack_overflow_is_reported() {
    let mut runner = Runner::new(program(recursing()), config()).expect("runner should build");
    let store = SnapshotStore::new();

    match runner.run(&store).expect("trap is not a runtime error") {
        ExecutionResult::Trapped { cause, .. } => assert_eq!(cause, TrapCause::StackOverflow),
        other => panic!("expected a trap, got {other:?}"),
    }

    let mut runner = Runner::new(program(returning(5)), config()).expect("runner should build");
    let result = runner.run(&store).expect("run should succeed");
    assert_eq!(result, ExecutionResult::Completed { result: 5 });
}

#[test]
fn test_load_past_grow_limit_is_reported() {
    let mut runner =
        Runner::new(program(loading_past_grow_limit()), config()).expect("runner should build");
    let store = SnapshotStore::new();

    match runner.run(&store).expect("trap is not a runtime error") {
        ExecutionResult::Trapped { cause, .. } => assert_eq!(
            cause,
            TrapCause::MemoryOutOfBounds {
                offset: GROW_MEMORY_SIZE
            }
        ),
        other => panic!("expected a trap, got {other:?}"),
    }
}

#[test]
fn test_parallel_runners() {
    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            thread::spawn(move || {
                let mut runner =
                    Runner::new(program(returning(100 + i)), config()).expect("runner should build");
                let store = SnapshotStore::new();
                runner.run(&store).expect("run should succeed")
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.join().expect("thread should not panic");
        assert_eq!(
            result,
            ExecutionResult::Completed {
                result: 100 + i as u64
            }
        );
    }
}

#[test]
fn test_parallel_snapshots_share_store() {
    let program = program(snapshotting());
    let store = Arc::new(SnapshotStore::new());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let program = Arc::clone(&program);
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut runner = Runner::new(program, config()).expect("runner should build");
                match runner.run(&store).expect("run should succeed") {
                    ExecutionResult::Completed { result } => result,
                    other => panic!("unexpected result {other:?}"),
                }
            })
        })
        .collect();

    let mut ids: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().expect("thread should not panic"))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}
