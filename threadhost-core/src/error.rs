//! Host error taxonomy
//!
//! Every error here is local to the component that detects it. There is no
//! central error channel back to whoever started the process: failures end up
//! as a unit outcome, a trap inside the calling module, or a failed
//! [`ProcessSupervisor::start`](crate::ProcessSupervisor::start).

use thiserror::Error;

use crate::engine::state::UnitState;
use crate::messages::ModuleAddr;

/// Errors raised by the process host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The shared memory region could not be reserved or grown.
    #[error("shared memory allocation failed ({initial} initial / {maximum} max pages): {reason}")]
    Allocation {
        initial: u64,
        maximum: u64,
        reason: String,
    },

    /// A host-side access fell outside the current memory size.
    #[error("access of {len} bytes at {addr} is outside the shared memory ({size} bytes)")]
    OutOfBounds {
        addr: ModuleAddr,
        len: usize,
        size: usize,
    },

    /// The module could not be instantiated inside an execution unit.
    #[error("module instantiation failed: {0}")]
    Instantiation(String),

    /// The module is missing a required export.
    #[error("module does not export `{0}`")]
    MissingExport(&'static str),

    /// The entry point trapped.
    #[error("entry point `{entry}` trapped: {reason}")]
    Trap { entry: &'static str, reason: String },

    /// A spawn request carried arguments that do not refer to valid module state.
    #[error("invalid spawn parameters: {0}")]
    InvalidSpawnParameters(String),

    /// The unit was stopped by the supervisor before or while running.
    #[error("unit interrupted by supervisor shutdown")]
    Interrupted,

    /// The unit thread panicked.
    #[error("unit thread panicked")]
    Panicked,

    /// The unit never received its initialization message.
    #[error("initialization channel closed before the unit was initialized")]
    InitChannelClosed,

    /// A lifecycle edge that is not forward.
    #[error("invalid unit state transition {from} -> {to}")]
    InvalidTransition { from: UnitState, to: UnitState },

    /// The wasmtime engine could not be configured.
    #[error("engine setup failed: {0}")]
    Engine(String),

    /// The module bytes could not be fetched or compiled.
    #[error("failed to load module: {0}")]
    ModuleLoad(String),

    /// A unit thread could not be created.
    #[error("failed to create unit thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

pub type HostResult<T> = std::result::Result<T, HostError>;
