//! # Runtime
//!
//! [`VoidRuntime`] owns one complete memory subsystem: the manager, the
//! asset cache, callback dispatch, the bridge over a [`HeadlessEngine`] and
//! the maintenance thread. Components are handed to collaborators by `Arc`;
//! there is no process-wide instance.

pub mod config;
pub mod maintenance;
pub mod state;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};

use crate::bridge::{CallbackHandler, HeadlessContext, HeadlessEngine, NativeBridge};
use crate::diagnostics::MemoryReport;
use crate::memory::{AssetCache, VoidManager};

pub use config::{CoreConfig, MaintenanceConfig, MemoryConfig};
pub use maintenance::{Maintenance, MaintenanceTask};
pub use state::{InitState, RuntimeState, Subsystem, SubsystemStatus};

/// Bridge type the runtime drives
pub type HeadlessBridge = NativeBridge<HeadlessEngine>;

pub struct VoidRuntime {
    config: CoreConfig,
    state: Arc<RuntimeState>,
    manager: Arc<VoidManager>,
    assets: Arc<AssetCache>,
    callbacks: Arc<CallbackHandler>,
    bridge: Arc<HeadlessBridge>,
    last_report: Arc<RwLock<Option<MemoryReport>>>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl VoidRuntime {
    /// Build every component, initialize the bridge and start maintenance
    pub fn start(config: CoreConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid runtime configuration")?;

        let state = Arc::new(RuntimeState::new());
        state.set_state(InitState::Initializing);

        log::info!("Void runtime v{} starting", crate::VERSION);
        log::info!("Platform: {} {}", std::env::consts::OS, std::env::consts::ARCH);
        log::info!("CPU Cores: {}", num_cpus::get());

        let manager = VoidManager::new(&config.memory);
        let assets = AssetCache::new(manager.clone());
        let callbacks = CallbackHandler::new(config.callback_threads)
            .context("starting callback workers")?;

        let sink = callbacks.clone();
        manager.set_warning_callback(move |warning| sink.send_memory_warning(warning));

        let bridge = NativeBridge::new(
            HeadlessContext::new(manager.clone(), assets.clone()),
            callbacks.clone(),
        );
        if let Err(e) = bridge.initialize(&[], &[], &config.to_bytes()) {
            state.set_state(InitState::Error);
            callbacks.shutdown();
            manager.shutdown();
            return Err(e).context("initializing native bridge");
        }

        state.set_status(Subsystem::Memory, SubsystemStatus::Running);
        state.set_status(Subsystem::Bridge, SubsystemStatus::Running);
        state.set_status(Subsystem::Callbacks, SubsystemStatus::Running);

        let last_report = Arc::new(RwLock::new(None));
        let tasks = maintenance_tasks(&config, &state, &manager, &assets, &bridge, &last_report);
        let maintenance = match Maintenance::start(tasks, state.clone()) {
            Ok(maintenance) => maintenance,
            Err(e) => {
                state.set_state(InitState::Error);
                bridge.shutdown();
                callbacks.shutdown();
                manager.shutdown();
                return Err(e);
            }
        };

        state.set_state(InitState::Running);
        log::info!(
            "Void runtime running ({} ceiling)",
            crate::diagnostics::format_bytes(manager.ceiling() as u64)
        );

        Ok(Self {
            config,
            state,
            manager,
            assets,
            callbacks,
            bridge,
            last_report,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Start from a JSON config file
    pub fn from_config_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::start(CoreConfig::from_file(path)?)
    }

    pub fn pause(&self) {
        if self.state.transition(InitState::Running, InitState::Paused) {
            self.bridge.pause();
            log::info!("Void runtime paused");
        }
    }

    pub fn resume(&self) {
        if self.state.transition(InitState::Paused, InitState::Running) {
            self.bridge.resume();
            log::info!("Void runtime resumed");
        }
    }

    /// Stop maintenance, the bridge, the cache, the manager and callbacks,
    /// in that order. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        match self.state.get_state() {
            InitState::Stopping | InitState::Stopped => return,
            _ => self.state.set_state(InitState::Stopping),
        }

        log::info!("Void runtime shutting down...");

        if let Some(mut maintenance) = self.maintenance.lock().take() {
            maintenance.stop();
        }

        self.bridge.shutdown();
        self.state.set_status(Subsystem::Bridge, SubsystemStatus::Stopped);

        self.assets.clear();
        self.manager.clear_warning_callback();
        self.manager.shutdown();
        self.state.set_status(Subsystem::Memory, SubsystemStatus::Stopped);

        self.callbacks.shutdown();
        self.state.set_status(Subsystem::Callbacks, SubsystemStatus::Stopped);

        self.state.set_state(InitState::Stopped);
        log::info!(
            "Void runtime shutdown complete (uptime {:.1}s)",
            self.state.uptime_secs()
        );
    }

    pub fn is_running(&self) -> bool {
        self.state.get_state() == InitState::Running
    }

    /// Fresh snapshot of the memory subsystem
    pub fn memory_report(&self) -> MemoryReport {
        MemoryReport::capture(&self.manager, Some(&self.assets))
    }

    /// Snapshot taken by the last stats refresh
    pub fn last_report(&self) -> Option<MemoryReport> {
        self.last_report.read().clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    pub fn manager(&self) -> &Arc<VoidManager> {
        &self.manager
    }

    pub fn assets(&self) -> &Arc<AssetCache> {
        &self.assets
    }

    pub fn callbacks(&self) -> &Arc<CallbackHandler> {
        &self.callbacks
    }

    pub fn bridge(&self) -> &Arc<HeadlessBridge> {
        &self.bridge
    }
}

impl Drop for VoidRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn maintenance_tasks(
    config: &CoreConfig,
    state: &Arc<RuntimeState>,
    manager: &Arc<VoidManager>,
    assets: &Arc<AssetCache>,
    bridge: &Arc<HeadlessBridge>,
    last_report: &Arc<RwLock<Option<MemoryReport>>>,
) -> Vec<MaintenanceTask> {
    let gc = {
        let (state, manager, bridge) = (state.clone(), manager.clone(), bridge.clone());
        MaintenanceTask::new(
            "gc",
            Duration::from_millis(config.memory.gc_sync_interval_ms),
            move || {
                if bridge.is_paused() {
                    return Ok(());
                }
                let drained = manager.collect_garbage();
                bridge.sync_memory();
                state.record_gc();
                log::trace!("GC sweep drained {} deferred frees", drained);
                Ok(())
            },
        )
    };

    let stats = {
        let (state, manager, assets, last_report) =
            (state.clone(), manager.clone(), assets.clone(), last_report.clone());
        MaintenanceTask::new(
            "stats",
            Duration::from_millis(config.maintenance.stats_interval_ms),
            move || {
                let report = MemoryReport::capture(&manager, Some(&assets));
                log::trace!("Memory: {}", report.summary());
                *last_report.write() = Some(report);
                state.record_stats_refresh();
                Ok(())
            },
        )
    };

    let health = {
        let (state, manager) = (state.clone(), manager.clone());
        MaintenanceTask::new(
            "health",
            Duration::from_millis(config.maintenance.health_check_interval_ms),
            move || {
                let status = if manager.is_healthy() {
                    SubsystemStatus::Running
                } else {
                    SubsystemStatus::Degraded
                };

                let previous = state.set_status(Subsystem::Memory, status);
                if previous != status {
                    match status {
                        SubsystemStatus::Degraded => log::warn!(
                            "Memory subsystem degraded ({:.1}% used)",
                            manager.usage_percent()
                        ),
                        _ => log::info!("Memory subsystem healthy again"),
                    }
                }
                state.record_health_check();
                Ok(())
            },
        )
    };

    vec![gc, stats, health]
}
