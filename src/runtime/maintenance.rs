//! # Maintenance Thread
//!
//! Runs periodic tasks (GC sweep, stats refresh, health check) on one
//! background thread. A task that fails or panics is logged and scheduled
//! again as usual.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use super::state::RuntimeState;
use crate::bridge::callback::panic_message;

/// Name of the maintenance thread
pub const THREAD_NAME: &str = "libs-maintenance";

type TaskFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// A named task run every `interval`
pub struct MaintenanceTask {
    name: &'static str,
    interval: Duration,
    run: TaskFn,
    next_due: Instant,
}

impl MaintenanceTask {
    pub fn new<F>(name: &'static str, interval: Duration, run: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name,
            interval,
            run: Box::new(run),
            next_due: Instant::now() + interval,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&mut self, state: &RuntimeState) {
        let span = tracing::debug_span!("void.maintenance", task = self.name);
        let _enter = span.enter();

        match catch_unwind(AssertUnwindSafe(|| (self.run)())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Maintenance task {} failed: {:#}", self.name, e),
            Err(panic) => {
                state.record_task_failure();
                log::error!(
                    "Maintenance task {} panicked: {}",
                    self.name,
                    panic_message(&*panic)
                );
            }
        }
    }
}

/// Handle to the running maintenance thread
pub struct Maintenance {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the thread running `tasks`
    pub fn start(mut tasks: Vec<MaintenanceTask>, state: Arc<RuntimeState>) -> anyhow::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let names: Vec<&str> = tasks.iter().map(|t| t.name).collect();
        log::debug!("Starting maintenance tasks: {}", names.join(", "));

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || loop {
                let now = Instant::now();
                for task in tasks.iter_mut().filter(|t| t.next_due <= now) {
                    task.execute(&state);
                    task.next_due = Instant::now() + task.interval;
                }

                let wait = tasks
                    .iter()
                    .map(|t| t.next_due)
                    .min()
                    .map(|due| due.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_secs(1));

                match stopped.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("spawning maintenance thread")?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Signal the thread and wait for it. Repeated calls are no-ops.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Maintenance thread panicked");
            }
            log::debug!("Maintenance thread stopped");
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_tasks_survive_panics() {
        let state = Arc::new(RuntimeState::new());
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let tasks = vec![
            MaintenanceTask::new("count", Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            MaintenanceTask::new("explode", Duration::from_millis(5), || panic!("boom")),
        ];

        let mut maintenance = Maintenance::start(tasks, state.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        maintenance.stop();

        assert!(runs.load(Ordering::Relaxed) >= 3);
        assert!(state.task_failures() >= 1);
        assert!(!maintenance.is_running());
    }
}
