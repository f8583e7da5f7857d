//! threadhost Core - Shared-Memory WebAssembly Process Host
//!
//! Runs one WebAssembly module as a multi-threaded process: a Main unit and
//! any number of Worker units, each on its own OS thread, all bound to a
//! single shared linear memory. Module code asks for new workers through the
//! module bridge; the supervisor starts them and tracks their lifecycle.
//!
//! # Design:
//! - Memory is shared by identity; the host adds no locking around it
//! - Units and supervisor communicate only through typed messages
//! - The supervisor is a single reactive task and never runs module code
//! - Every unit handle is retained so the process can be stopped in order

pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod messages;
pub mod perf;
pub mod runtime;

pub use engine::{BytesSource, FileSource, ModuleSource, UnitState};
pub use error::{HostError, HostResult};
pub use memory::SharedMemoryRegion;
pub use messages::{HostMessage, LifecycleEvent, ModuleAddr, Role, SpawnRequest, UnitId};
pub use perf::{MetricsSnapshot, SupervisorMetrics};
pub use runtime::{MainExitPolicy, ProcessConfig, ProcessReport, ProcessSupervisor, UnitRecord};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize logging for the host.
///
/// Honors `RUST_LOG`, defaulting to `info`. Guest `log` output is emitted on
/// the `guest` target. Safe to call more than once.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by an earlier call (or a test harness) wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    info!("Initializing threadhost v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
