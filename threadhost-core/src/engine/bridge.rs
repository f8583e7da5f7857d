//! Module Bridge - host functions visible to the module
//!
//! The import surface is fixed; the module binary is compiled against it:
//!
//! | import                   | signature                          |
//! |--------------------------|------------------------------------|
//! | `js.__sysGetCoreCount`   | `() -> i32`                        |
//! | `js.__consoleLog`        | `(ptr: i32, len: i32)`             |
//! | `js.__workerStart`       | `(ctx: i32, entry: i32, data: i32, idx: i32)` |
//! | `env.memory`             | shared memory                      |
//!
//! Every call runs on the calling unit's own thread. Nothing here blocks on
//! another unit: a spawn request is queued for the supervisor and the call
//! returns immediately.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use wasmtime::{Caller, Linker};

use crate::error::HostError;
use crate::memory::SharedMemoryRegion;
use crate::messages::{HostMessage, ModuleAddr, Role, SpawnRequest, SupervisorEvent, UnitId};
use crate::perf::SupervisorMetrics;

pub const IMPORT_MODULE: &str = "js";
pub const CPU_COUNT: &str = "__sysGetCoreCount";
pub const CONSOLE_LOG: &str = "__consoleLog";
pub const WORKER_START: &str = "__workerStart";

pub const MEMORY_MODULE: &str = "env";
pub const MEMORY_NAME: &str = "memory";

pub const MAIN_ENTRY: &str = "__wasm_mainStart";
pub const WORKER_ENTRY: &str = "__wasm_workerStart";

/// Optional export used to validate spawn entry indices.
pub const FUNCTION_TABLE: &str = "__indirect_function_table";

/// Per-unit store data the bridge functions run against.
pub struct UnitContext {
    pub(crate) unit: UnitId,
    pub(crate) role: Role,
    pub(crate) memory: SharedMemoryRegion,
    pub(crate) outbox: UnboundedSender<SupervisorEvent>,
    pub(crate) cpu_count: u32,
    pub(crate) metrics: Arc<SupervisorMetrics>,
}

impl UnitContext {
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// `cpuCount()`
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// `log(ptr, len)`
    pub fn log(&self, ptr: i32, len: i32) {
        let text = decode_text(&self.memory, ModuleAddr::from_wasm(ptr), len);
        self.metrics.record_guest_log();
        info!(target: "guest", unit = %self.unit, role = %self.role, "{}", text);
    }

    /// `requestSpawn(...)`, once the arguments have been validated.
    pub fn request_spawn(&self, request: SpawnRequest) {
        debug!(
            unit = %self.unit,
            context = %request.context,
            entry = %request.entry,
            data = %request.data,
            index = request.index,
            "Forwarding spawn request"
        );

        let event = SupervisorEvent::Message {
            from: self.unit,
            message: HostMessage::WorkerStart(request),
        };
        if self.outbox.send(event).is_err() {
            warn!(unit = %self.unit, "Supervisor is gone, spawn request dropped");
        }
    }
}

/// Register the bridge functions on `linker`.
pub fn add_to_linker(linker: &mut Linker<UnitContext>) -> Result<()> {
    linker.func_wrap(IMPORT_MODULE, CPU_COUNT, |caller: Caller<'_, UnitContext>| -> i32 {
        caller.data().cpu_count() as i32
    })?;

    linker.func_wrap(
        IMPORT_MODULE,
        CONSOLE_LOG,
        |caller: Caller<'_, UnitContext>, ptr: i32, len: i32| {
            caller.data().log(ptr, len);
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        WORKER_START,
        |mut caller: Caller<'_, UnitContext>,
         context: i32,
         entry: i32,
         data: i32,
         index: i32|
         -> Result<()> {
            match validate_spawn(&mut caller, context, entry, data, index) {
                Ok(request) => {
                    caller.data().request_spawn(request);
                    Ok(())
                }
                Err(err) => {
                    let ctx = caller.data();
                    ctx.metrics.record_spawn_rejected();
                    warn!(unit = %ctx.unit, error = %err, "Rejected spawn request");
                    Err(err.into())
                }
            }
        },
    )?;

    Ok(())
}

/// Copy `len` bytes at `addr` out of shared memory and decode them as UTF-8.
///
/// The range is clamped to the region; invalid sequences are replaced.
pub fn decode_text(memory: &SharedMemoryRegion, addr: ModuleAddr, len: i32) -> String {
    let len = usize::try_from(len).unwrap_or(0);
    let bytes = memory.read(addr, len);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Turn raw `__workerStart` arguments into a [`SpawnRequest`], rejecting
/// anything that does not point into the calling module.
fn validate_spawn(
    caller: &mut Caller<'_, UnitContext>,
    context: i32,
    entry: i32,
    data: i32,
    index: i32,
) -> Result<SpawnRequest, HostError> {
    let request = SpawnRequest {
        context: ModuleAddr::from_wasm(context),
        entry: ModuleAddr::from_wasm(entry),
        data: ModuleAddr::from_wasm(data),
        // Opaque to the host; reinterpreted bit for bit.
        index: index as u32,
    };

    let memory = &caller.data().memory;
    for (name, addr) in [("context", request.context), ("data", request.data)] {
        if !memory.contains(addr) {
            return Err(HostError::InvalidSpawnParameters(format!(
                "{name} pointer {addr} is outside the shared memory ({} bytes)",
                memory.size_bytes()
            )));
        }
    }

    let table = caller
        .get_export(FUNCTION_TABLE)
        .and_then(|export| export.into_table());
    if let Some(table) = table {
        let slots = u64::from(table.size(&*caller));
        if u64::from(request.entry.raw()) >= slots {
            return Err(HostError::InvalidSpawnParameters(format!(
                "entry index {} is outside the function table ({slots} slots)",
                request.entry
            )));
        }
    }

    Ok(request)
}
