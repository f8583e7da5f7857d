//! Execution Units - one module instance per OS thread
//!
//! An execution unit is a dedicated thread that owns one wasmtime `Store` and
//! one instantiation of the process module, bound to the shared memory.
//!
//! # Bootstrap
//! 1. `Created`: the thread exists and blocks on its one-shot init channel.
//!    No module code can run before the supervisor sends [`InitMessage`].
//! 2. `Initializing`: the module is instantiated against the shared memory
//!    and the module bridge.
//! 3. `Running`: `__wasm_mainStart` or `__wasm_workerStart` is invoked.
//! 4. `Closed`: the entry point returned; the unit sends its one closure
//!    notification and ends.
//!
//! Any failure along the way ends the unit in `Failed` without a closure
//! notification. Either way the thread's last act is an
//! [`SupervisorEvent::Exited`] carrying the outcome, which is the completion
//! channel the supervisor reaps handles from.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wasmtime::{Engine, Linker, Module, Store, Trap, TypedFunc};

use crate::engine::bridge::{self, UnitContext, MAIN_ENTRY, MEMORY_MODULE, MEMORY_NAME, WORKER_ENTRY};
use crate::engine::state::{StateCell, UnitState};
use crate::error::{HostError, HostResult};
use crate::memory::SharedMemoryRegion;
use crate::messages::{HostMessage, InitMessage, Role, SpawnRequest, SupervisorEvent, UnitId};
use crate::perf::{ScopedTimer, SupervisorMetrics, TimerType};

/// Everything a unit thread shares with its siblings.
#[derive(Clone)]
pub struct UnitRuntime {
    pub engine: Engine,
    pub module: Module,
    pub outbox: UnboundedSender<SupervisorEvent>,
    pub cpu_count: u32,
    pub metrics: Arc<SupervisorMetrics>,
    /// Cancelled once the supervisor stops the process; checked before an
    /// entry point is invoked, the engine epoch covers units already inside one.
    pub halt: CancellationToken,
}

/// Supervisor-side handle to one unit.
pub struct UnitHandle {
    id: UnitId,
    role: Role,
    entry_args: Option<SpawnRequest>,
    state: StateCell,
    init: Option<oneshot::Sender<InitMessage>>,
    thread: Option<JoinHandle<()>>,
    closure_seen: bool,
    failure: Option<String>,
}

impl UnitHandle {
    /// Start a unit thread in `Created`. It idles until [`initialize`](Self::initialize).
    pub fn spawn(
        id: UnitId,
        role: Role,
        entry_args: Option<SpawnRequest>,
        runtime: UnitRuntime,
    ) -> HostResult<Self> {
        let state = StateCell::new();
        let (init_tx, init_rx) = oneshot::channel();

        let unit_state = state.clone();
        let thread = std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || run_unit(id, unit_state, init_rx, runtime))?;

        debug!(unit = %id, role = %role, "Unit created");
        Ok(Self {
            id,
            role,
            entry_args,
            state,
            init: Some(init_tx),
            thread: Some(thread),
            closure_seen: false,
            failure: None,
        })
    }

    /// Send the unit its one initialization message.
    pub fn initialize(&mut self, memory: &SharedMemoryRegion) {
        let message = match (self.role, self.entry_args) {
            (Role::Main, _) => InitMessage::Main {
                memory: memory.clone(),
            },
            (Role::Worker, Some(args)) => InitMessage::Worker {
                memory: memory.clone(),
                args,
            },
            (Role::Worker, None) => {
                error!(unit = %self.id, "Worker has no entry arguments, not initializing");
                self.init = None;
                return;
            }
        };

        match self.init.take() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    warn!(unit = %self.id, "Unit ended before it was initialized");
                }
            }
            None => warn!(unit = %self.id, "Unit already initialized"),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn entry_args(&self) -> Option<SpawnRequest> {
        self.entry_args
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    /// `true` until the unit's thread has been reaped.
    pub fn is_live(&self) -> bool {
        self.thread.is_some()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Note a closure notification. Returns `false` if one was already seen.
    pub fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closure_seen, true)
    }

    /// Join the finished thread and record how it ended.
    ///
    /// A failed unit ends in `Failed` even if its thread died before it
    /// could record that itself.
    fn reap(&mut self, outcome: Result<(), HostError>) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                self.failure.get_or_insert_with(|| HostError::Panicked.to_string());
            }
        }
        if let Err(err) = outcome {
            self.failure = Some(err.to_string());
        }
        if self.failure.is_some() && !self.state.get().is_terminal() {
            let _ = self.state.transition(UnitState::Failed);
        }
    }
}

/// Registry of every unit the process has created.
///
/// Handles are never removed: reaped units keep their final state and
/// failure for the process report.
pub struct UnitRegistry {
    units: BTreeMap<UnitId, UnitHandle>,
    next_id: u64,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            units: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Create and register a unit. The first unit created gets [`UnitId::MAIN`].
    pub fn create(
        &mut self,
        role: Role,
        entry_args: Option<SpawnRequest>,
        runtime: &UnitRuntime,
    ) -> HostResult<&mut UnitHandle> {
        let id = UnitId(self.next_id);
        let handle = UnitHandle::spawn(id, role, entry_args, runtime.clone())?;
        self.next_id += 1;
        Ok(self.units.entry(id).or_insert(handle))
    }

    pub fn get(&self, id: UnitId) -> Option<&UnitHandle> {
        self.units.get(&id)
    }

    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut UnitHandle> {
        self.units.get_mut(&id)
    }

    /// Join a unit that reported its exit.
    pub fn reap(&mut self, id: UnitId, outcome: Result<(), HostError>) -> Option<&UnitHandle> {
        let handle = self.units.get_mut(&id)?;
        handle.reap(outcome);
        Some(handle)
    }

    pub fn live_count(&self) -> usize {
        self.units.values().filter(|u| u.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitHandle> {
        self.units.values()
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends the unit's exit event however the thread ends, including by panic.
struct ExitGuard {
    unit: UnitId,
    outbox: UnboundedSender<SupervisorEvent>,
    outcome: Option<Result<(), HostError>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(Err(HostError::Panicked));
        // A closed inbox means the supervisor is gone; nobody is left to tell.
        let _ = self.outbox.send(SupervisorEvent::Exited {
            unit: self.unit,
            outcome,
        });
    }
}

fn run_unit(
    id: UnitId,
    state: StateCell,
    init_rx: oneshot::Receiver<InitMessage>,
    runtime: UnitRuntime,
) {
    let mut guard = ExitGuard {
        unit: id,
        outbox: runtime.outbox.clone(),
        outcome: None,
    };

    let outcome = bootstrap(id, &state, init_rx, &runtime);
    if let Err(err) = &outcome {
        // Already terminal only if the failure was itself a bad transition.
        let _ = state.transition(UnitState::Failed);
        runtime.metrics.record_unit_failure();
        warn!(unit = %id, error = %err, "Unit failed");
    }
    guard.outcome = Some(outcome);
}

enum Entry {
    Main(TypedFunc<(), ()>),
    Worker(TypedFunc<(i32, i32, i32, i32), ()>, SpawnRequest),
}

fn bootstrap(
    id: UnitId,
    state: &StateCell,
    init_rx: oneshot::Receiver<InitMessage>,
    runtime: &UnitRuntime,
) -> HostResult<()> {
    let init = init_rx
        .blocking_recv()
        .map_err(|_| HostError::InitChannelClosed)?;
    state.transition(UnitState::Initializing)?;

    let role = init.role();
    let memory = init.memory().clone();
    debug!(unit = %id, role = %role, memory_pages = memory.size_pages(), "Unit initializing");

    let mut store = Store::new(
        &runtime.engine,
        UnitContext {
            unit: id,
            role,
            memory: memory.clone(),
            outbox: runtime.outbox.clone(),
            cpu_count: runtime.cpu_count,
            metrics: runtime.metrics.clone(),
        },
    );
    store.set_epoch_deadline(1);

    let instantiation = |e: anyhow::Error| HostError::Instantiation(format!("{e:#}"));
    let mut linker = Linker::new(&runtime.engine);
    bridge::add_to_linker(&mut linker).map_err(instantiation)?;
    linker
        .define(&store, MEMORY_MODULE, MEMORY_NAME, memory.handle().clone())
        .map_err(instantiation)?;

    let timer = ScopedTimer::new(&runtime.metrics, TimerType::Instantiation);
    let instance = match linker.instantiate(&mut store, &runtime.module) {
        Ok(instance) => instance,
        Err(e) => {
            timer.discard();
            return Err(instantiation(e));
        }
    };
    drop(timer);

    let entry = match init {
        InitMessage::Main { .. } => Entry::Main(
            instance
                .get_typed_func(&mut store, MAIN_ENTRY)
                .map_err(|_| HostError::MissingExport(MAIN_ENTRY))?,
        ),
        InitMessage::Worker { args, .. } => Entry::Worker(
            instance
                .get_typed_func(&mut store, WORKER_ENTRY)
                .map_err(|_| HostError::MissingExport(WORKER_ENTRY))?,
            args,
        ),
    };

    if runtime.halt.is_cancelled() {
        return Err(HostError::Interrupted);
    }

    state.transition(UnitState::Running)?;
    info!(unit = %id, role = %role, "Unit running");

    let timer = ScopedTimer::new(&runtime.metrics, TimerType::EntryPoint);
    let (name, result) = match entry {
        Entry::Main(func) => (MAIN_ENTRY, func.call(&mut store, ())),
        Entry::Worker(func, args) => (
            WORKER_ENTRY,
            func.call(
                &mut store,
                (
                    args.context.to_wasm(),
                    args.entry.to_wasm(),
                    args.data.to_wasm(),
                    args.index as i32,
                ),
            ),
        ),
    };

    if let Err(e) = result {
        timer.discard();
        if e.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
            return Err(HostError::Interrupted);
        }
        if let Some(HostError::InvalidSpawnParameters(reason)) = e.downcast_ref::<HostError>() {
            return Err(HostError::InvalidSpawnParameters(reason.clone()));
        }
        return Err(HostError::Trap {
            entry: name,
            reason: format!("{e:#}"),
        });
    }
    drop(timer);

    state.transition(UnitState::Closed)?;
    debug!(unit = %id, role = %role, "Entry point returned");
    // Same channel as the exit event, so the supervisor sees the closure first.
    let _ = runtime.outbox.send(SupervisorEvent::Message {
        from: id,
        message: HostMessage::closed(role),
    });
    Ok(())
}
