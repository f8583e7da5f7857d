//! End-to-end process tests: real modules, real unit threads.

use std::collections::BTreeSet;
use std::time::Duration;

use threadhost_core::{
    BytesSource, LifecycleEvent, MainExitPolicy, ModuleAddr, ProcessConfig, ProcessReport,
    ProcessSupervisor, Role, UnitId, UnitState,
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn config() -> ProcessConfig {
    ProcessConfig {
        initial_pages: 1,
        max_pages: 16,
        cpu_count: Some(3),
        main_exit: MainExitPolicy::Detach,
    }
}

async fn run(name: &str, wat: &str, config: ProcessConfig) -> (ProcessReport, threadhost_core::SharedMemoryRegion) {
    let source = BytesSource::new(name, wat);
    let supervisor = ProcessSupervisor::start(config, &source).await.unwrap();
    let memory = supervisor.memory().clone();
    let report = tokio::time::timeout(TIMEOUT, supervisor.run())
        .await
        .expect("process did not finish");
    (report, memory)
}

fn read_u32(memory: &threadhost_core::SharedMemoryRegion, addr: u32) -> u32 {
    let bytes = memory.read(ModuleAddr::new(addr), 4);
    u32::from_le_bytes(bytes.try_into().unwrap())
}

fn count_events(report: &ProcessReport, event: LifecycleEvent) -> usize {
    report.events.iter().filter(|r| r.event == event).count()
}

fn assert_single_main(report: &ProcessReport) {
    let mains: Vec<_> = report.units.iter().filter(|u| u.role == Role::Main).collect();
    assert_eq!(mains.len(), 1);
    assert_eq!(mains[0].id, UnitId::MAIN);
    assert!(mains[0].entry_args.is_none());
}

#[tokio::test]
async fn test_single_worker_lifecycle() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0x1000) (i32.const 0) (i32.const 0x2000) (i32.const 0)))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.store (local.get $data) (local.get $ctx))))
    "#;
    let config = ProcessConfig {
        initial_pages: 3000,
        max_pages: 16384,
        ..config()
    };
    let (report, memory) = run("single-worker", wat, config).await;

    assert_single_main(&report);
    assert!(report.main_closed());
    assert!(!report.halted);
    assert_eq!(report.memory_pages, 3000);

    let workers: Vec<_> = report.workers().collect();
    assert_eq!(workers.len(), 1);
    let args = workers[0].entry_args.unwrap();
    assert_eq!(args.context, ModuleAddr::new(0x1000));
    assert_eq!(args.data, ModuleAddr::new(0x2000));
    assert_eq!(workers[0].state, UnitState::Closed);

    assert_eq!(count_events(&report, LifecycleEvent::WorkerStarted), 1);
    assert_eq!(count_events(&report, LifecycleEvent::WorkerClosed), 1);
    assert_eq!(count_events(&report, LifecycleEvent::MainClosed), 1);
    assert_eq!(read_u32(&memory, 0x2000), 0x1000);
}

#[tokio::test]
async fn test_two_workers_keep_their_own_args() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0x40) (i32.const 0) (i32.const 0x100) (i32.const 0))
            (call $spawn (i32.const 0x40) (i32.const 0) (i32.const 0x200) (i32.const 1)))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.store (local.get $data) (i32.add (local.get $idx) (i32.const 100)))))
    "#;
    let (report, memory) = run("two-workers", wat, config()).await;

    assert_single_main(&report);
    let workers: Vec<_> = report.workers().collect();
    assert_eq!(workers.len(), 2);

    for worker in &workers {
        let args = worker.entry_args.unwrap();
        let expected_data = match args.index {
            0 => 0x100,
            1 => 0x200,
            other => panic!("unexpected index {other}"),
        };
        assert_eq!(args.data, ModuleAddr::new(expected_data));
        assert_eq!(args.context, ModuleAddr::new(0x40));
        assert_eq!(worker.state, UnitState::Closed);
    }
    let indices: BTreeSet<u32> = workers.iter().map(|w| w.entry_args.unwrap().index).collect();
    assert_eq!(indices, BTreeSet::from([0, 1]));

    assert_eq!(read_u32(&memory, 0x100), 100);
    assert_eq!(read_u32(&memory, 0x200), 101);
}

#[tokio::test]
async fn test_worker_index_high_bit_passes_through() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x100) (i32.const 0x80000001)))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.store (local.get $data) (local.get $idx))))
    "#;
    let (report, memory) = run("high-index", wat, config()).await;

    assert!(report.main_closed());
    let workers: Vec<_> = report.workers().collect();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].entry_args.unwrap().index, 0x8000_0001);
    assert_eq!(workers[0].state, UnitState::Closed);
    assert_eq!(read_u32(&memory, 0x100), 0x8000_0001);
}

#[tokio::test]
async fn test_every_request_yields_one_worker() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart") (local $i i32)
            (loop $next
              (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x800) (local.get $i))
              (local.set $i (i32.add (local.get $i) (i32.const 1)))
              (br_if $next (i32.lt_u (local.get $i) (i32.const 16)))))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (drop (i32.atomic.rmw.add (local.get $data) (i32.const 1)))))
    "#;
    let (report, memory) = run("many-workers", wat, config()).await;

    let indices: Vec<u32> = report
        .workers()
        .map(|w| w.entry_args.unwrap().index)
        .collect();
    assert_eq!(indices.len(), 16);
    assert_eq!(indices.iter().copied().collect::<BTreeSet<_>>(), (0..16).collect());
    assert!(report.workers().all(|w| w.state == UnitState::Closed));
    assert_eq!(report.metrics.workers_spawned, 16);
    assert_eq!(report.metrics.workers_closed, 16);
    assert_eq!(read_u32(&memory, 0x800), 16);
}

#[tokio::test]
async fn test_workers_can_spawn_workers() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x100) (i32.const 0)))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.store (local.get $data) (i32.const 1))
            (if (i32.eqz (local.get $idx))
              (then
                (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x200) (i32.const 1))))))
    "#;
    let (report, memory) = run("nested", wat, config()).await;

    assert_eq!(report.workers().count(), 2);
    assert_eq!(count_events(&report, LifecycleEvent::WorkerClosed), 2);
    assert_eq!(read_u32(&memory, 0x100), 1);
    assert_eq!(read_u32(&memory, 0x200), 1);
}

#[tokio::test]
async fn test_worker_instantiation_failure_is_contained() {
    // The start function traps once main has raised the flag at 0x10, so
    // only workers fail to instantiate.
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func $check
            (if (i32.load (i32.const 0x10)) (then unreachable)))
          (start $check)
          (func (export "__wasm_mainStart")
            (i32.store (i32.const 0x10) (i32.const 1))
            (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x100) (i32.const 0)))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)
            (i32.store (i32.const 0x100) (i32.const 7))))
    "#;
    let (report, memory) = run("bad-worker", wat, config()).await;

    assert!(report.main_closed());
    let workers: Vec<_> = report.workers().collect();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].state, UnitState::Failed);
    assert!(workers[0]
        .failure
        .as_deref()
        .unwrap()
        .contains("instantiation failed"));

    assert_eq!(count_events(&report, LifecycleEvent::WorkerStarted), 1);
    assert_eq!(count_events(&report, LifecycleEvent::WorkerClosed), 0);
    assert_eq!(report.metrics.unit_failures, 1);
    assert_eq!(read_u32(&memory, 0x100), 0);
}

#[tokio::test]
async fn test_units_observe_each_others_writes() {
    // Main spins until the worker publishes a value, then copies it.
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x400) (i32.const 0))
            (loop $wait
              (br_if $wait (i32.eqz (i32.atomic.load (i32.const 0x400)))))
            (i32.store (i32.const 0x408) (i32.atomic.load (i32.const 0x404))))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.atomic.store (i32.const 0x404) (i32.const 99))
            (i32.atomic.store (local.get $data) (i32.const 1))))
    "#;
    let (report, memory) = run("visibility", wat, config()).await;

    assert!(report.main_closed());
    assert_eq!(read_u32(&memory, 0x408), 99);
}

#[tokio::test]
async fn test_bridge_cpu_count_and_log() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__sysGetCoreCount" (func $cpus (result i32)))
          (import "js" "__consoleLog" (func $log (param i32 i32)))
          (data (i32.const 0x700) "hello from main")
          (func (export "__wasm_mainStart")
            (i32.store (i32.const 0x600) (call $cpus))
            (call $log (i32.const 0x700) (i32.const 15))
            (call $log (i32.const 0x700) (i32.const 0x40000000)))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)))
    "#;
    let (report, memory) = run("bridge", wat, config()).await;

    assert!(report.main_closed());
    assert_eq!(read_u32(&memory, 0x600), 3);
    assert_eq!(report.metrics.guest_log_lines, 2);
}

#[tokio::test]
async fn test_invalid_spawn_rejected_at_bridge() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 0x7fffffff) (i32.const 0) (i32.const 0) (i32.const 0)))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)))
    "#;
    let (report, _memory) = run("invalid-spawn", wat, config()).await;

    assert!(!report.main_closed());
    assert_eq!(report.workers().count(), 0);
    let main = report.unit(UnitId::MAIN).unwrap();
    assert_eq!(main.state, UnitState::Failed);
    assert!(main
        .failure
        .as_deref()
        .unwrap()
        .contains("invalid spawn parameters"));
    assert_eq!(report.metrics.spawn_rejected, 1);
}

#[tokio::test]
async fn test_module_grows_shared_memory() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (drop (memory.grow (i32.const 2)))
            (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x20000) (i32.const 0)))
          (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
            (i32.store (local.get $data) (i32.const 5))))
    "#;
    let (report, memory) = run("grow", wat, config()).await;

    assert_eq!(report.memory_pages, 3);
    assert_eq!(memory.size_pages(), 3);
    assert_eq!(report.workers().next().unwrap().state, UnitState::Closed);
    assert_eq!(read_u32(&memory, 0x20000), 5);
}

const SPIN_WORKER_WAT: &str = r#"
    (module
      (import "env" "memory" (memory 1 65536 shared))
      (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
      (func (export "__wasm_mainStart")
        (call $spawn (i32.const 0) (i32.const 0) (i32.const 0x100) (i32.const 0))
        (loop $wait
          (br_if $wait (i32.eqz (i32.atomic.load (i32.const 0x100)))))
        (i32.atomic.store (i32.const 0x200) (i32.const 1)))
      (func (export "__wasm_workerStart") (param $ctx i32) (param $entry i32) (param $data i32) (param $idx i32)
        (i32.atomic.store (local.get $data) (i32.const 1))
        ;; Runs until told to stop through 0x204, which nothing in the module sets.
        (loop $spin
          (br_if $spin (i32.eqz (i32.atomic.load (i32.const 0x204)))))))
"#;

#[tokio::test]
async fn test_terminate_workers_policy_interrupts_workers() {
    let config = ProcessConfig {
        main_exit: MainExitPolicy::TerminateWorkers,
        ..config()
    };
    let (report, _memory) = run("terminate", SPIN_WORKER_WAT, config).await;

    assert!(report.halted);
    assert!(report.main_closed());
    let worker = report.workers().next().unwrap();
    assert_eq!(worker.state, UnitState::Failed);
    assert!(worker.failure.as_deref().unwrap().contains("interrupted"));
    assert_eq!(count_events(&report, LifecycleEvent::WorkerClosed), 0);
}

#[tokio::test]
async fn test_detach_policy_lets_workers_outlive_main() {
    let source = BytesSource::new("detach", SPIN_WORKER_WAT);
    let supervisor = ProcessSupervisor::start(config(), &source).await.unwrap();
    let memory = supervisor.memory().clone();
    let process = tokio::spawn(supervisor.run());

    // Main has returned once it raised 0x200; the worker must still be spinning.
    for _ in 0..500 {
        if read_u32(&memory, 0x200) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process.is_finished());

    memory.write(ModuleAddr::new(0x204), &1u32.to_le_bytes()).unwrap();
    let report = tokio::time::timeout(TIMEOUT, process).await.unwrap().unwrap();

    assert!(!report.halted);
    assert!(report.main_closed());
    assert_eq!(report.workers().next().unwrap().state, UnitState::Closed);
    assert_eq!(count_events(&report, LifecycleEvent::WorkerClosed), 1);
}

#[tokio::test]
async fn test_shutdown_token_interrupts_main() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (func (export "__wasm_mainStart")
            (loop $forever (br $forever)))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)))
    "#;
    let source = BytesSource::new("forever", wat);
    let supervisor = ProcessSupervisor::start(config(), &source).await.unwrap();
    let shutdown = supervisor.shutdown_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });
    let report = tokio::time::timeout(TIMEOUT, supervisor.run()).await.unwrap();

    assert!(report.halted);
    assert!(!report.main_closed());
    let main = report.unit(UnitId::MAIN).unwrap();
    assert_eq!(main.state, UnitState::Failed);
    assert!(main.failure.as_deref().unwrap().contains("interrupted"));
}

#[tokio::test]
async fn test_report_serializes() {
    let wat = r#"
        (module
          (import "env" "memory" (memory 1 65536 shared))
          (import "js" "__workerStart" (func $spawn (param i32 i32 i32 i32)))
          (func (export "__wasm_mainStart")
            (call $spawn (i32.const 8) (i32.const 0) (i32.const 16) (i32.const 2)))
          (func (export "__wasm_workerStart") (param i32 i32 i32 i32)))
    "#;
    let (report, _memory) = run("json", wat, config()).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["units"][0]["role"], "main");
    assert_eq!(json["units"][1]["entry_args"]["index"], 2);
    assert_eq!(json["units"][1]["entry_args"]["data"], 16);

    let back: ProcessReport = serde_json::from_value(json).unwrap();
    assert_eq!(back, report);
}
