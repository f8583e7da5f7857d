//! Process Supervisor - owner of the shared memory and every unit
//!
//! The supervisor creates the shared memory, starts the Main unit, and from
//! then on only reacts: it starts a Worker for every spawn request, records
//! closures, and reaps unit threads as they exit. It never executes module
//! code and never touches the shared memory on behalf of a unit.
//!
//! # Message handling
//! ```text
//! worker:start  ──► create Worker, send init:worker (args passed through as-is)
//! worker:closed ──► record
//! main:closed   ──► record, then apply the main-exit policy
//! unknown       ──► log and ignore
//! exited        ──► join the unit thread, keep its outcome for the report
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wasmtime::Engine;

use crate::engine::module::{self, ModuleSource};
use crate::engine::{build_engine, UnitState};
use crate::error::{HostError, HostResult};
use crate::executor::{UnitRegistry, UnitRuntime};
use crate::memory::SharedMemoryRegion;
use crate::messages::{HostMessage, LifecycleEvent, Role, SpawnRequest, SupervisorEvent, UnitId};
use crate::perf::{MetricsSnapshot, SupervisorMetrics};

/// What happens to running workers when the Main unit closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MainExitPolicy {
    /// Workers keep running; the process ends with its last unit.
    #[default]
    Detach,
    /// Stop honoring spawn requests and interrupt every running unit.
    TerminateWorkers,
}

/// Configuration for a supervised process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Initial shared memory size in 64 KiB pages
    pub initial_pages: u32,
    /// Hard maximum shared memory size in pages
    pub max_pages: u32,
    /// Value reported to the module by `cpuCount()`; hardware parallelism if unset
    pub cpu_count: Option<u32>,
    pub main_exit: MainExitPolicy,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            initial_pages: 3000,
            // 1 GiB
            max_pages: 16384,
            cpu_count: None,
            main_exit: MainExitPolicy::Detach,
        }
    }
}

impl ProcessConfig {
    fn resolved_cpu_count(&self) -> u32 {
        self.cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }
}

/// Final view of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: UnitId,
    pub role: Role,
    pub state: UnitState,
    pub entry_args: Option<SpawnRequest>,
    pub failure: Option<String>,
}

/// One recorded lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub unit: UnitId,
    pub event: LifecycleEvent,
}

/// Everything the supervisor observed over the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub units: Vec<UnitRecord>,
    pub events: Vec<LifecycleRecord>,
    pub memory_pages: u64,
    /// `true` if the process was stopped rather than left to finish.
    pub halted: bool,
    pub metrics: MetricsSnapshot,
}

impl ProcessReport {
    /// `true` if the Main unit returned from its entry point.
    pub fn main_closed(&self) -> bool {
        self.events
            .iter()
            .any(|r| r.unit == UnitId::MAIN && r.event == LifecycleEvent::MainClosed)
    }

    pub fn workers(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|u| u.role == Role::Worker)
    }

    pub fn unit(&self, id: UnitId) -> Option<&UnitRecord> {
        self.units.iter().find(|u| u.id == id)
    }
}

enum Wake {
    Event(Option<SupervisorEvent>),
    Shutdown,
}

/// The process-wide owner of memory and units.
///
/// Constructed explicitly by [`start`](Self::start), driven by
/// [`run`](Self::run), torn down by cancelling [`shutdown_token`](Self::shutdown_token)
/// or by letting every unit finish.
pub struct ProcessSupervisor {
    config: ProcessConfig,
    engine: Engine,
    memory: SharedMemoryRegion,
    runtime: UnitRuntime,
    registry: UnitRegistry,
    inbox: UnboundedReceiver<SupervisorEvent>,
    events: Vec<LifecycleRecord>,
    metrics: Arc<SupervisorMetrics>,
    shutdown: CancellationToken,
    halted: bool,
}

impl ProcessSupervisor {
    /// Create the shared memory, load the module and start the Main unit.
    pub async fn start(config: ProcessConfig, source: &dyn ModuleSource) -> HostResult<Self> {
        let engine = build_engine().map_err(|e| HostError::Engine(format!("{e:#}")))?;

        let memory = SharedMemoryRegion::create(&engine, config.initial_pages, config.max_pages)?;
        info!(
            initial_pages = config.initial_pages,
            max_pages = config.max_pages,
            "Shared memory created"
        );

        let module = module::load(&engine, source).await?;

        let (outbox, inbox) = mpsc::unbounded_channel();
        let metrics = SupervisorMetrics::new();
        let runtime = UnitRuntime {
            engine: engine.clone(),
            module,
            outbox,
            cpu_count: config.resolved_cpu_count(),
            metrics: metrics.clone(),
            halt: CancellationToken::new(),
        };

        let mut supervisor = Self {
            config,
            engine,
            memory,
            runtime,
            registry: UnitRegistry::new(),
            inbox,
            events: Vec::new(),
            metrics,
            shutdown: CancellationToken::new(),
            halted: false,
        };
        supervisor.start_main()?;
        Ok(supervisor)
    }

    fn start_main(&mut self) -> HostResult<()> {
        let main = self.registry.create(Role::Main, None, &self.runtime)?;
        debug_assert_eq!(main.id(), UnitId::MAIN);
        main.initialize(&self.memory);
        info!(unit = %UnitId::MAIN, "Main unit started");
        Ok(())
    }

    /// The process memory. Clones share storage with every unit.
    pub fn memory(&self) -> &SharedMemoryRegion {
        &self.memory
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SupervisorMetrics> {
        self.metrics.clone()
    }

    /// Cancel to stop the process: no new workers, running units interrupted.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle messages until every unit has exited.
    pub async fn run(mut self) -> ProcessReport {
        while self.registry.live_count() > 0 {
            let wake = tokio::select! {
                event = self.inbox.recv() => Wake::Event(event),
                _ = self.shutdown.cancelled(), if !self.halted => Wake::Shutdown,
            };

            match wake {
                Wake::Event(Some(event)) => self.handle_event(event),
                // The runtime holds a sender, so this only happens if it was dropped.
                Wake::Event(None) => break,
                Wake::Shutdown => self.halt("shutdown requested"),
            }
        }

        info!(units = self.registry.len(), "All units exited");
        self.report()
    }

    fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Message { from, message } => self.handle_message(from, message),
            SupervisorEvent::Exited { unit, outcome } => {
                if let Some(handle) = self.registry.reap(unit, outcome) {
                    match handle.failure() {
                        Some(reason) => warn!(unit = %unit, state = %handle.state(), reason, "Unit exited with failure"),
                        None => debug!(unit = %unit, "Unit exited"),
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, from: UnitId, message: HostMessage) {
        match message {
            HostMessage::WorkerStart(request) => self.spawn_worker(from, request),
            HostMessage::WorkerClosed => {
                self.record_closure(from, Role::Worker);
            }
            HostMessage::MainClosed => {
                if self.record_closure(from, Role::Main)
                    && self.config.main_exit == MainExitPolicy::TerminateWorkers
                {
                    self.halt("main unit closed");
                }
            }
            HostMessage::Unknown => {
                self.metrics.record_unknown_message();
                warn!(unit = %from, "Unknown unit message, ignoring");
            }
        }
    }

    fn spawn_worker(&mut self, from: UnitId, request: SpawnRequest) {
        if self.halted {
            warn!(unit = %from, index = request.index, "Process is stopping, spawn request ignored");
            return;
        }

        match self.registry.create(Role::Worker, Some(request), &self.runtime) {
            Ok(worker) => {
                worker.initialize(&self.memory);
                let id = worker.id();
                self.metrics.record_worker_spawned();
                self.events.push(LifecycleRecord {
                    unit: id,
                    event: LifecycleEvent::WorkerStarted,
                });
                info!(
                    unit = %id,
                    parent = %from,
                    index = request.index,
                    data = %request.data,
                    "Worker started"
                );
            }
            Err(err) => error!(unit = %from, error = %err, "Failed to start worker"),
        }
    }

    /// Returns `true` if the closure was accepted.
    fn record_closure(&mut self, from: UnitId, claimed: Role) -> bool {
        let Some(handle) = self.registry.get_mut(from) else {
            warn!(unit = %from, "Closure from unknown unit, ignoring");
            return false;
        };
        if handle.role() != claimed {
            warn!(unit = %from, role = %handle.role(), claimed = %claimed, "Closure does not match unit role, ignoring");
            return false;
        }
        if !handle.mark_closed() {
            warn!(unit = %from, "Duplicate closure, ignoring");
            return false;
        }

        let event = match claimed {
            Role::Main => {
                self.metrics.record_main_closed();
                LifecycleEvent::MainClosed
            }
            Role::Worker => {
                self.metrics.record_worker_closed();
                LifecycleEvent::WorkerClosed
            }
        };
        self.events.push(LifecycleRecord { unit: from, event });
        info!(unit = %from, role = %claimed, "Unit closed");
        true
    }

    /// Stop honoring spawn requests and interrupt every running unit.
    fn halt(&mut self, reason: &str) {
        if self.halted {
            return;
        }
        self.halted = true;
        info!(reason, live = self.registry.live_count(), "Stopping process");

        // Token first: a unit that misses it is guaranteed to see the epoch.
        self.runtime.halt.cancel();
        self.engine.increment_epoch();
    }

    fn report(&self) -> ProcessReport {
        ProcessReport {
            units: self
                .registry
                .iter()
                .map(|u| UnitRecord {
                    id: u.id(),
                    role: u.role(),
                    state: u.state(),
                    entry_args: u.entry_args(),
                    failure: u.failure().map(str::to_owned),
                })
                .collect(),
            events: self.events.clone(),
            memory_pages: self.memory.size_pages(),
            halted: self.halted,
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BytesSource;

    const TRIVIAL_WAT: &str = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (func (export "__wasm_mainStart"))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)))
    "#;

    fn small_config() -> ProcessConfig {
        ProcessConfig {
            initial_pages: 1,
            max_pages: 4,
            cpu_count: Some(4),
            ..ProcessConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ProcessConfig::default();
        assert_eq!(config.initial_pages, 3000);
        assert_eq!(config.max_pages, 16384);
        assert_eq!(config.main_exit, MainExitPolicy::Detach);
        assert!(config.resolved_cpu_count() >= 1);
    }

    #[tokio::test]
    async fn test_main_only_process() {
        let source = BytesSource::new("trivial", TRIVIAL_WAT);
        let supervisor = ProcessSupervisor::start(small_config(), &source)
            .await
            .unwrap();
        assert_eq!(supervisor.memory().size_pages(), 1);

        let report = supervisor.run().await;
        assert!(report.main_closed());
        assert!(!report.halted);
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].state, UnitState::Closed);
        assert_eq!(report.workers().count(), 0);
        assert_eq!(report.metrics.mains_closed, 1);
    }

    #[tokio::test]
    async fn test_allocation_error() {
        let source = BytesSource::new("trivial", TRIVIAL_WAT);
        let config = ProcessConfig {
            initial_pages: 8,
            max_pages: 4,
            ..ProcessConfig::default()
        };
        let err = ProcessSupervisor::start(config, &source).await.err().unwrap();
        assert!(matches!(err, HostError::Allocation { .. }));
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let source = BytesSource::new("trivial", TRIVIAL_WAT);
        let mut supervisor = ProcessSupervisor::start(small_config(), &source)
            .await
            .unwrap();

        supervisor.handle_message(UnitId::MAIN, HostMessage::Unknown);
        supervisor.handle_message(UnitId(99), HostMessage::WorkerClosed);
        assert!(supervisor.events.is_empty());

        let report = supervisor.run().await;
        assert_eq!(report.metrics.unknown_messages, 1);
        assert_eq!(report.metrics.workers_closed, 0);
    }

    #[tokio::test]
    async fn test_closure_role_mismatch_is_ignored() {
        let source = BytesSource::new("trivial", TRIVIAL_WAT);
        let mut supervisor = ProcessSupervisor::start(small_config(), &source)
            .await
            .unwrap();

        assert!(!supervisor.record_closure(UnitId::MAIN, Role::Worker));
        let report = supervisor.run().await;

        assert_eq!(report.metrics.workers_closed, 0);
        assert_eq!(report.metrics.mains_closed, 1);
    }

    #[tokio::test]
    async fn test_worker_closure_message_from_main_is_ignored() {
        let source = BytesSource::new("trivial", TRIVIAL_WAT);
        let mut supervisor = ProcessSupervisor::start(small_config(), &source)
            .await
            .unwrap();

        supervisor.handle_message(UnitId::MAIN, HostMessage::WorkerClosed);
        assert!(supervisor.events.is_empty());

        let report = supervisor.run().await;
        assert_eq!(report.events.len(), 1);
        assert!(report.main_closed());
    }
}
