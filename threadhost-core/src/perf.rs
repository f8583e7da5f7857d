//! Supervisor Metrics
//!
//! Lock-free counters for unit lifecycle transitions and bridge traffic.
//! These are the supervisor's only shared bookkeeping: units bump them from
//! their own threads, the supervisor snapshots them into the process report.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide lifecycle counters
pub struct SupervisorMetrics {
    // Unit bootstrap
    pub instantiations: AtomicU64,
    pub instantiate_time_ns: AtomicU64,
    pub entry_returns: AtomicU64,
    pub entry_time_ns: AtomicU64,
    pub unit_failures: AtomicU64,

    // Supervisor message handling
    pub workers_spawned: AtomicU64,
    pub workers_closed: AtomicU64,
    pub mains_closed: AtomicU64,
    pub unknown_messages: AtomicU64,

    // Module bridge
    pub spawn_rejected: AtomicU64,
    pub guest_log_lines: AtomicU64,
}

impl SupervisorMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a completed module instantiation
    pub fn record_instantiation(&self, duration: Duration) {
        self.instantiations.fetch_add(1, Ordering::Relaxed);
        self.instantiate_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record an entry point returning control to the host
    pub fn record_entry_return(&self, duration: Duration) {
        self.entry_returns.fetch_add(1, Ordering::Relaxed);
        self.entry_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_unit_failure(&self) {
        self.unit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_closed(&self) {
        self.workers_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_main_closed(&self) {
        self.mains_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_message(&self) {
        self.unknown_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spawn_rejected(&self) {
        self.spawn_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guest_log(&self) {
        self.guest_log_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instantiations: self.instantiations.load(Ordering::Relaxed),
            avg_instantiate_ms: avg_duration_ms(&self.instantiations, &self.instantiate_time_ns),
            entry_returns: self.entry_returns.load(Ordering::Relaxed),
            avg_entry_ms: avg_duration_ms(&self.entry_returns, &self.entry_time_ns),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_closed: self.workers_closed.load(Ordering::Relaxed),
            mains_closed: self.mains_closed.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            spawn_rejected: self.spawn_rejected.load(Ordering::Relaxed),
            guest_log_lines: self.guest_log_lines.load(Ordering::Relaxed),
        }
    }
}

impl Default for SupervisorMetrics {
    fn default() -> Self {
        Self {
            instantiations: AtomicU64::new(0),
            instantiate_time_ns: AtomicU64::new(0),
            entry_returns: AtomicU64::new(0),
            entry_time_ns: AtomicU64::new(0),
            unit_failures: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
            workers_closed: AtomicU64::new(0),
            mains_closed: AtomicU64::new(0),
            unknown_messages: AtomicU64::new(0),
            spawn_rejected: AtomicU64::new(0),
            guest_log_lines: AtomicU64::new(0),
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    let total = total_ns.load(Ordering::Relaxed);
    (total as f64) / (c as f64) / 1_000_000.0
}

/// A point-in-time snapshot of supervisor metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub instantiations: u64,
    pub avg_instantiate_ms: f64,
    pub entry_returns: u64,
    pub avg_entry_ms: f64,
    pub unit_failures: u64,
    pub workers_spawned: u64,
    pub workers_closed: u64,
    pub mains_closed: u64,
    pub unknown_messages: u64,
    pub spawn_rejected: u64,
    pub guest_log_lines: u64,
}

impl MetricsSnapshot {
    /// Print a human-readable report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║         threadhost Process Report                         ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Units                                                     ║");
        println!("║   Instantiated: {:>7} (avg: {:>8.3} ms)              ║",
                 self.instantiations, self.avg_instantiate_ms);
        println!("║   Returned:     {:>7} (avg: {:>8.3} ms)              ║",
                 self.entry_returns, self.avg_entry_ms);
        println!("║   Failed:       {:>7}                                   ║",
                 self.unit_failures);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Lifecycle                                                 ║");
        println!("║   Workers spawned: {:>7}                                ║",
                 self.workers_spawned);
        println!("║   Workers closed:  {:>7}                                ║",
                 self.workers_closed);
        println!("║   Main closed:     {:>7}                                ║",
                 self.mains_closed);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Bridge                                                    ║");
        println!("║   Log lines:       {:>7}                                ║",
                 self.guest_log_lines);
        println!("║   Spawns rejected: {:>7}                                ║",
                 self.spawn_rejected);
        println!("║   Unknown msgs:    {:>7}                                ║",
                 self.unknown_messages);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// A scoped timer that records its duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a SupervisorMetrics,
    metric_type: TimerType,
}

pub enum TimerType {
    Instantiation,
    EntryPoint,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a SupervisorMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }

    /// Stop without recording anything.
    pub fn discard(self) {
        std::mem::forget(self);
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Instantiation => self.metrics.record_instantiation(duration),
            TimerType::EntryPoint => self.metrics.record_entry_return(duration),
        }
    }
}
