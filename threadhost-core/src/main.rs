//! threadhost - run a shared-memory WebAssembly module as a multi-threaded process
//!
//! The module's `__wasm_mainStart` runs on the Main unit; every
//! `__workerStart` call it (or a worker) makes starts another unit running
//! `__wasm_workerStart`. The process ends when every unit has exited, or on
//! Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use threadhost_core::{init, FileSource, MainExitPolicy, ProcessConfig, ProcessSupervisor};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnMainExit {
    /// Let workers run to completion
    Detach,
    /// Interrupt workers once the main unit returns
    TerminateWorkers,
}

impl From<OnMainExit> for MainExitPolicy {
    fn from(value: OnMainExit) -> Self {
        match value {
            OnMainExit::Detach => MainExitPolicy::Detach,
            OnMainExit::TerminateWorkers => MainExitPolicy::TerminateWorkers,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "threadhost", version, about = "Run a shared-memory WebAssembly module across threads")]
struct Cli {
    /// Module to run (.wasm or .wat)
    module: PathBuf,

    /// Initial shared memory size in 64 KiB pages
    #[arg(long, default_value_t = ProcessConfig::default().initial_pages)]
    initial_pages: u32,

    /// Maximum shared memory size in 64 KiB pages
    #[arg(long, default_value_t = ProcessConfig::default().max_pages)]
    max_pages: u32,

    /// Parallelism reported to the module (defaults to the host's)
    #[arg(long)]
    cpu_count: Option<u32>,

    /// What to do with running workers when the main unit returns
    #[arg(long, value_enum, default_value_t = OnMainExit::Detach)]
    on_main_exit: OnMainExit,

    /// Print the process report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init()?;

    let config = ProcessConfig {
        initial_pages: cli.initial_pages,
        max_pages: cli.max_pages,
        cpu_count: cli.cpu_count,
        main_exit: cli.on_main_exit.into(),
    };
    let source = FileSource::new(&cli.module);

    let supervisor = ProcessSupervisor::start(config, &source)
        .await
        .with_context(|| format!("Failed to start {}", cli.module.display()))?;

    let shutdown = supervisor.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping units");
            shutdown.cancel();
        }
    });

    let report = supervisor.run().await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.metrics.print_report();
        for unit in &report.units {
            match &unit.failure {
                Some(reason) => println!("{} ({}): {} - {}", unit.id, unit.role, unit.state, reason),
                None => println!("{} ({}): {}", unit.id, unit.role, unit.state),
            }
        }
    }

    if report.main_closed() {
        info!("Main unit closed normally");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
