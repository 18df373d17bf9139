//! # Runtime State
//!
//! Lifecycle and maintenance counters for a running [`VoidRuntime`](super::VoidRuntime).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Runtime lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InitState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
    Stopped = 5,
    Error = 255,
}

impl From<u32> for InitState {
    fn from(v: u32) -> Self {
        match v {
            0 => InitState::Uninitialized,
            1 => InitState::Initializing,
            2 => InitState::Running,
            3 => InitState::Paused,
            4 => InitState::Stopping,
            5 => InitState::Stopped,
            _ => InitState::Error,
        }
    }
}

/// Health of one subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemStatus {
    Stopped,
    Running,
    /// Running but under memory pressure
    Degraded,
}

/// Subsystems whose status is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Memory,
    Bridge,
    Callbacks,
}

pub struct RuntimeState {
    state: AtomicU32,
    start_time: Instant,

    gc_runs: AtomicU64,
    stats_refreshes: AtomicU64,
    health_checks: AtomicU64,
    task_failures: AtomicU64,

    memory: RwLock<SubsystemStatus>,
    bridge: RwLock<SubsystemStatus>,
    callbacks: RwLock<SubsystemStatus>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(InitState::Uninitialized as u32),
            start_time: Instant::now(),
            gc_runs: AtomicU64::new(0),
            stats_refreshes: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            task_failures: AtomicU64::new(0),
            memory: RwLock::new(SubsystemStatus::Stopped),
            bridge: RwLock::new(SubsystemStatus::Stopped),
            callbacks: RwLock::new(SubsystemStatus::Stopped),
        }
    }

    pub fn get_state(&self) -> InitState {
        InitState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: InitState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    /// Move `from` -> `to`; false if the state was something else
    pub fn transition(&self, from: InitState, to: InitState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn slot(&self, subsystem: Subsystem) -> &RwLock<SubsystemStatus> {
        match subsystem {
            Subsystem::Memory => &self.memory,
            Subsystem::Bridge => &self.bridge,
            Subsystem::Callbacks => &self.callbacks,
        }
    }

    pub fn status(&self, subsystem: Subsystem) -> SubsystemStatus {
        *self.slot(subsystem).read()
    }

    /// Set a subsystem status, returning the previous one
    pub fn set_status(&self, subsystem: Subsystem, status: SubsystemStatus) -> SubsystemStatus {
        std::mem::replace(&mut *self.slot(subsystem).write(), status)
    }

    pub(crate) fn record_gc(&self) {
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stats_refresh(&self) {
        self.stats_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_failure(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gc_runs(&self) -> u64 {
        self.gc_runs.load(Ordering::Relaxed)
    }

    pub fn stats_refreshes(&self) -> u64 {
        self.stats_refreshes.load(Ordering::Relaxed)
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }

    /// Maintenance task runs that panicked
    pub fn task_failures(&self) -> u64 {
        self.task_failures.load(Ordering::Relaxed)
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
