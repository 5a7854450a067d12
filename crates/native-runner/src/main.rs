// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! CLI for running precompiled programs natively
//!
//! # Usage
//!
//! ```bash
//! # Run the `main` function of a compiled module
//! native-runner module.o
//!
//! # Run another function, keeping every snapshot it takes
//! native-runner --func start --dump-snapshots out/ module.o
//!
//! # Run, then run again from the first snapshot
//! native-runner --rerun-from-snapshot 0 module.o
//! ```

use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use runtime::{
    round_up, ExecutionResult, Runner, RunnerConfig, SnapshotId, SnapshotStore, DEFAULT_ENTRY,
    DEFAULT_RO_DATA_SIZE, DEFAULT_STACK_SIZE, DEFAULT_TEXT_SIZE, MEMORY_INCREMENT,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

mod dump;
mod image;

/// Grow limit used when none is given
const DEFAULT_GROW_MEMORY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "native-runner")]
#[command(about = "Run a precompiled WebAssembly module natively", long_about = None)]
struct Cli {
    /// Compiled module (relocatable object file)
    module: PathBuf,

    /// Maximum program text size
    #[arg(long, default_value_t = DEFAULT_TEXT_SIZE)]
    text_size: usize,

    /// Maximum read-only data size
    #[arg(long, default_value_t = DEFAULT_RO_DATA_SIZE)]
    rodata_size: usize,

    /// Call stack size
    #[arg(long, default_value_t = DEFAULT_STACK_SIZE)]
    stack_size: usize,

    /// Function to run
    #[arg(long, default_value = DEFAULT_ENTRY)]
    func: String,

    /// Initial linear memory size [default: initial data rounded up to 64 KiB]
    #[arg(long)]
    init_memory: Option<usize>,

    /// Linear memory grow limit [default: initial size, at least 16 MiB]
    #[arg(long)]
    grow_memory: Option<usize>,

    /// Write every snapshot taken into this directory
    #[arg(long, value_name = "DIR")]
    dump_snapshots: Option<PathBuf>,

    /// After the run, start a fresh runner from this snapshot and run it
    #[arg(long, value_name = "ID")]
    rerun_from_snapshot: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match try_main(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every run completed without trapping
fn try_main(cli: &Cli) -> Result<bool> {
    let bytes =
        fs::read(&cli.module).with_context(|| format!("read {}", cli.module.display()))?;
    let options = image::LoadOptions {
        text_size: cli.text_size,
        ro_data_size: cli.rodata_size,
        entry: cli.func.clone(),
    };
    let program = image::load(&bytes, &options)
        .with_context(|| format!("load {}", cli.module.display()))?;
    let program = Arc::new(program);

    let init_memory_size = cli
        .init_memory
        .unwrap_or_else(|| round_up(program.data().len(), MEMORY_INCREMENT));
    let grow_memory_size = cli
        .grow_memory
        .unwrap_or_else(|| init_memory_size.max(DEFAULT_GROW_MEMORY_SIZE));
    let config = RunnerConfig::new(init_memory_size, grow_memory_size, cli.stack_size);

    let store = SnapshotStore::new();
    let mut runner = Runner::new(program, config).context("create runner")?;
    let mut completed = report(runner.run(&store).context("run")?);

    if let Some(id) = cli.rerun_from_snapshot {
        let snapshot = store
            .get(SnapshotId::new(id))
            .with_context(|| format!("no snapshot with id {id}"))?;
        info!(id, "rerunning from snapshot");
        let mut runner = snapshot
            .new_runner(grow_memory_size, cli.stack_size)
            .with_context(|| format!("restore snapshot {id}"))?;
        completed &= report(runner.run(&store).context("rerun")?);
    }

    if let Some(dir) = &cli.dump_snapshots {
        let count = dump::dump_all(&store, dir)?;
        info!(count, dir = %dir.display(), "dumped snapshots");
    }

    Ok(completed)
}

fn report(result: ExecutionResult) -> bool {
    match result {
        ExecutionResult::Completed { result } => {
            println!("{result}");
            true
        }
        ExecutionResult::Trapped { cause, trace } => {
            eprintln!("trap: {cause}");
            eprint!("{trace}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["native-runner", "module.o"]).expect("should parse");
        assert_eq!(cli.func, "main");
        assert_eq!(cli.stack_size, 64 * 1024);
        assert_eq!(cli.text_size, 128 * 1024 * 1024);
        assert_eq!(cli.rodata_size, 4 * 1024 * 1024);
        assert!(cli.init_memory.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "native-runner",
            "--func",
            "start",
            "--stack-size",
            "8192",
            "--init-memory",
            "65536",
            "--grow-memory",
            "131072",
            "--dump-snapshots",
            "out",
            "--rerun-from-snapshot",
            "2",
            "-v",
            "module.o",
        ])
        .expect("should parse");
        assert_eq!(cli.func, "start");
        assert_eq!(cli.stack_size, 8192);
        assert_eq!(cli.init_memory, Some(65536));
        assert_eq!(cli.grow_memory, Some(131072));
        assert_eq!(cli.rerun_from_snapshot, Some(2));
        assert!(cli.verbose);
    }

    #[test]
    fn test_module_is_required() {
        assert!(Cli::try_parse_from(["native-runner"]).is_err());
    }
}
