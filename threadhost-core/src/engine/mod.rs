//! Engine module - WebAssembly runtime plumbing
//!
//! This module holds everything a single execution unit needs to run module
//! code: the wasmtime engine configuration, the module bridge, module loading
//! and the unit lifecycle state machine.

pub mod bridge;
pub mod module;
pub mod state;

pub use bridge::UnitContext;
pub use module::{BytesSource, FileSource, ModuleSource};
pub use state::{StateCell, UnitState};

use anyhow::{Context, Result};
use wasmtime::{Config, Engine};

/// Build an engine that can host shared memories and be interrupted.
///
/// Every store created on this engine must set an epoch deadline; advancing
/// the engine epoch once interrupts all of them.
pub fn build_engine() -> Result<Engine> {
    let mut config = Config::new();
    config.wasm_threads(true);
    config.epoch_interruption(true);
    Engine::new(&config).context("Failed to configure wasmtime engine")
}
