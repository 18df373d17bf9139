//! # Diagnostics
//!
//! Read-only statistics over the memory subsystem: snapshots, per-tag usage,
//! leak reports and the stats string. Nothing here feeds back into
//! allocation decisions.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::memory::{AssetCache, AssetStats, PoolStats, VoidManager, VoidStats};

/// Live bytes held under one allocation tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUsage {
    pub tag: String,
    pub bytes: usize,
    pub allocations: usize,
}

impl TagUsage {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            bytes: 0,
            allocations: 0,
        }
    }
}

/// Allocations still outstanding, grouped by tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub tag: String,
    pub bytes: usize,
    pub allocations: usize,
}

/// Point-in-time view of the whole subsystem
#[derive(Debug, Clone)]
pub struct MemoryReport {
    pub captured_at: DateTime<Utc>,
    pub memory: VoidStats,
    pub pools: Vec<PoolStats>,
    pub assets: Option<AssetStats>,
    pub tags: Vec<TagUsage>,
}

impl MemoryReport {
    /// Snapshot the manager and, if given, the asset cache
    pub fn capture(manager: &VoidManager, assets: Option<&AssetCache>) -> Self {
        Self {
            captured_at: Utc::now(),
            memory: manager.stats(),
            pools: manager.pool_stats(),
            assets: assets.map(AssetCache::stats),
            tags: manager.tag_usage(),
        }
    }

    /// Deduplication ratio, 0 when no cache was captured
    pub fn deduplication_ratio(&self) -> f64 {
        self.assets
            .as_ref()
            .map(|a| a.deduplication_ratio)
            .unwrap_or(0.0)
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        self.to_string()
    }

    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        format!(
            "{} / {} ({:.1}%), peak {}, {} active, dedup {:.1}%",
            format_bytes(self.memory.allocated_bytes as u64),
            format_bytes(self.memory.ceiling as u64),
            self.memory.usage_percent(),
            format_bytes(self.memory.peak_bytes as u64),
            self.memory.active_allocations,
            self.deduplication_ratio() * 100.0
        )
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.memory;
        writeln!(f, "Off-Heap Memory ({})", self.captured_at.format("%H:%M:%S"))?;
        writeln!(f, "  Allocated:     {} / {} ({:.1}%)",
            format_bytes(m.allocated_bytes as u64),
            format_bytes(m.ceiling as u64),
            m.usage_percent()
        )?;
        writeln!(f, "  Peak:          {}", format_bytes(m.peak_bytes as u64))?;
        writeln!(f, "  Active:        {}", m.active_allocations)?;
        writeln!(f, "  Allocations:   {}", m.allocation_count)?;
        writeln!(f, "  Deallocations: {}", m.deallocation_count)?;
        writeln!(f, "  Pending frees: {}", m.pending_frees)?;
        writeln!(f, "  GC runs:       {}", m.gc_runs)?;
        writeln!(f, "  Healthy:       {}", m.healthy)?;

        if !self.pools.is_empty() {
            writeln!(f, "Pools:")?;
            for pool in &self.pools {
                writeln!(
                    f,
                    "  {:>6} B: {} in use / {} blocks",
                    pool.block_size, pool.in_use, pool.total_blocks
                )?;
            }
        }

        if let Some(assets) = &self.assets {
            writeln!(f, "Assets:")?;
            writeln!(f, "  Cached:        {} ({} paths)", assets.cache_size, assets.path_count)?;
            writeln!(f, "  Stored:        {}", format_bytes(assets.bytes_stored))?;
            writeln!(f, "  Saved:         {}", format_bytes(assets.bytes_saved))?;
            writeln!(f, "  Dedup ratio:   {:.1}%", assets.deduplication_ratio * 100.0)?;
        }

        if !self.tags.is_empty() {
            writeln!(f, "Tags:")?;
            for tag in &self.tags {
                writeln!(f, "  {}: {} ({} allocations)", tag.tag, format_bytes(tag.bytes as u64), tag.allocations)?;
            }
        }

        Ok(())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
