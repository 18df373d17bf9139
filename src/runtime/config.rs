//! # Runtime Configuration
//!
//! Configuration parsed from Java-provided JSON. Keys follow the mod's
//! `libs.json` layout.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{VoidError, VoidResult};

/// Off-heap memory options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Allocation ceiling in MB
    pub off_heap_max_mb: u64,

    /// Serve small requests from block pools first
    pub pool_small_objects: bool,

    /// Allow bump arenas to be carved from the budget
    pub arena_allocator: bool,

    /// Interval of the periodic GC sweep
    pub gc_sync_interval_ms: u64,

    /// Texture payload budget for the headless engine
    pub texture_budget_mb: u64,

    /// Chunk payload budget for the headless engine
    pub mesh_budget_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            off_heap_max_mb: 4096,
            pool_small_objects: true,
            arena_allocator: true,
            gc_sync_interval_ms: 5000,
            texture_budget_mb: 2048,
            mesh_budget_mb: 1024,
        }
    }
}

impl MemoryConfig {
    /// Default options with a different ceiling
    pub fn with_max_mb(off_heap_max_mb: u64) -> Self {
        Self {
            off_heap_max_mb,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> VoidResult<()> {
        if self.off_heap_max_mb == 0 {
            return Err(VoidError::Config("off_heap_max_mb must be at least 1".into()));
        }
        if self.gc_sync_interval_ms == 0 {
            return Err(VoidError::Config("gc_sync_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Periodic task intervals
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub stats_interval_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 1000,
            health_check_interval_ms: 5000,
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    pub memory: MemoryConfig,
    pub maintenance: MaintenanceConfig,

    /// Callback worker threads
    pub callback_threads: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            maintenance: MaintenanceConfig::default(),
            callback_threads: 2,
        }
    }
}

impl CoreConfig {
    /// Parse config from bytes (JSON); empty input yields defaults
    pub fn from_bytes(data: &[u8]) -> VoidResult<Self> {
        if data.is_empty() {
            log::warn!("Empty config data, using defaults");
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_slice(data)
            .map_err(|e| VoidError::Config(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_bytes(&data).with_context(|| format!("loading config {}", path.display()))
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn validate(&self) -> VoidResult<()> {
        self.memory.validate()?;

        if self.callback_threads == 0 {
            return Err(VoidError::Config("callback_threads must be at least 1".into()));
        }
        if self.maintenance.stats_interval_ms == 0 || self.maintenance.health_check_interval_ms == 0 {
            return Err(VoidError::Config("maintenance intervals must be positive".into()));
        }
        Ok(())
    }
}
