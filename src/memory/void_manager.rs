//! # Void Manager - Off-Heap Memory Management
//!
//! Moves assets outside Java's GC-managed heap:
//! - Textures, sounds, models and chunk payloads in native RAM
//! - Java keeps only 8-byte addresses
//! - Eliminates GC pauses
//!
//! Small requests are served from fixed-size block pools, larger ones from
//! the raw allocator. Every allocation, pooled or not, is reserved against
//! the byte ceiling before memory is obtained, so the sum of live
//! allocations never exceeds the ceiling.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;

use super::arena::Arena;
use super::buffer::ZeroCopyBuffer;
use super::pool::{Pool, PoolStats};
use super::{
    align_up, poison, RawAllocator, SystemAllocator, ALIGNMENT, CRITICAL_THRESHOLD,
    MAX_ALLOC_SIZE, POOL_BLOCK_SIZES, WARNING_THRESHOLD,
};
use crate::diagnostics::{LeakReport, TagUsage};
use crate::error::{VoidError, VoidResult};
use crate::runtime::config::MemoryConfig;

const MB: usize = 1024 * 1024;

/// Where an allocation's memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    General,
    Pool,
    Arena,
}

/// A tracked off-heap allocation
#[derive(Debug, Clone)]
pub struct Allocation {
    pub address: usize,
    /// Charged size, a multiple of 16
    pub size: usize,
    /// Logical size last requested (shrinks on in-place reallocate)
    pub requested: usize,
    pub tag: String,
    pub kind: AllocationKind,
    pub created_at: DateTime<Utc>,
}

/// Severity of a memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningLevel {
    /// Usage crossed 90%
    Warning,
    /// Usage crossed 95%; GC forced, manager unhealthy
    Critical,
    /// An allocation was refused
    Exhausted,
}

/// Event delivered to the warning observer
#[derive(Debug, Clone)]
pub struct MemoryWarning {
    pub level: WarningLevel,
    pub used: usize,
    pub ceiling: usize,
    pub message: String,
}

impl MemoryWarning {
    /// Usage in percent of the ceiling
    pub fn usage_percent(&self) -> f64 {
        if self.ceiling == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.ceiling as f64
    }
}

/// Point-in-time manager statistics
#[derive(Debug, Clone, Default)]
pub struct VoidStats {
    pub allocated_bytes: usize,
    pub peak_bytes: usize,
    pub ceiling: usize,
    pub allocation_count: u64,
    pub deallocation_count: u64,
    pub active_allocations: usize,
    pub pending_frees: usize,
    pub gc_runs: u64,
    pub healthy: bool,
}

impl VoidStats {
    pub fn usage_percent(&self) -> f64 {
        if self.ceiling == 0 {
            return 0.0;
        }
        self.allocated_bytes as f64 * 100.0 / self.ceiling as f64
    }
}

type WarningCallback = Arc<dyn Fn(&MemoryWarning) + Send + Sync>;

/// Void Manager - Off-heap memory allocator
pub struct VoidManager {
    config: MemoryConfig,
    ceiling: usize,
    raw: Arc<dyn RawAllocator>,
    /// All live allocations by address
    allocations: RwLock<HashMap<usize, Allocation>>,
    /// One pool per block size when pooling is on
    pools: RwLock<Vec<Pool>>,
    /// Arenas by backing base address
    arenas: RwLock<HashMap<usize, Arc<Arena>>>,
    /// Deferred frees awaiting the next GC pass
    pending: SegQueue<usize>,
    allocated: AtomicUsize,
    peak: AtomicUsize,
    allocation_count: AtomicU64,
    deallocation_count: AtomicU64,
    gc_runs: AtomicU64,
    healthy: AtomicBool,
    shut_down: AtomicBool,
    warning_callback: RwLock<Option<WarningCallback>>,
}

impl VoidManager {
    /// Create a manager over the system allocator
    pub fn new(config: &MemoryConfig) -> Arc<Self> {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    /// Create a manager over a custom raw allocator
    pub fn with_allocator(config: &MemoryConfig, raw: Arc<dyn RawAllocator>) -> Arc<Self> {
        let ceiling = (config.off_heap_max_mb as usize).saturating_mul(MB);

        let pools = if config.pool_small_objects {
            POOL_BLOCK_SIZES
                .iter()
                .map(|&size| Pool::new(size, Pool::initial_capacity(size), raw.clone()))
                .collect()
        } else {
            Vec::new()
        };

        log::info!(
            "Void Manager initialized: ceiling {} MB, pooling {}, arenas {}",
            config.off_heap_max_mb,
            if config.pool_small_objects { "on" } else { "off" },
            if config.arena_allocator { "on" } else { "off" },
        );

        Arc::new(Self {
            config: config.clone(),
            ceiling,
            raw,
            allocations: RwLock::new(HashMap::new()),
            pools: RwLock::new(pools),
            arenas: RwLock::new(HashMap::new()),
            pending: SegQueue::new(),
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocation_count: AtomicU64::new(0),
            deallocation_count: AtomicU64::new(0),
            gc_runs: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            warning_callback: RwLock::new(None),
        })
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Allocate `size` bytes (rounded up to 16) labelled with `tag`
    pub fn allocate(&self, size: usize, tag: &str) -> VoidResult<usize> {
        let aligned = self.admit(size)?;

        let placed = self.place_pooled(aligned).or_else(|| {
            self.raw
                .allocate(aligned, ALIGNMENT)
                .map(|ptr| (ptr.as_ptr() as usize, AllocationKind::General))
        });

        let Some((address, kind)) = placed else {
            self.allocated.fetch_sub(aligned, Ordering::SeqCst);
            log::error!("Native allocation of {} bytes failed ({})", aligned, tag);
            return Err(VoidError::OutOfMemory { size: aligned });
        };

        self.commit(address, aligned, size, tag, kind);
        log::trace!("Allocated {} bytes at {:#x} ({:?}, {})", aligned, address, kind, tag);
        Ok(address)
    }

    /// Allocate and zero the whole charged region
    pub fn allocate_zeroed(&self, size: usize, tag: &str) -> VoidResult<usize> {
        let address = self.allocate(size, tag)?;
        // SAFETY: freshly allocated region of at least align_up(size) bytes
        unsafe { std::ptr::write_bytes(address as *mut u8, 0, align_up(size)) };
        Ok(address)
    }

    /// Allocate an owning zero-copy buffer of exactly `size` bytes
    pub fn create_buffer(self: &Arc<Self>, size: usize) -> VoidResult<ZeroCopyBuffer<'static>> {
        ZeroCopyBuffer::allocate(self, size)
    }

    /// Carve a bump arena of `size` bytes out of the budget
    pub fn create_arena(&self, size: usize, tag: &str) -> VoidResult<Arc<Arena>> {
        if !self.config.arena_allocator {
            return Err(VoidError::InvalidArgument(
                "arena allocation is disabled".into(),
            ));
        }

        let aligned = self.admit(size)?;

        let Some(ptr) = self.raw.allocate(aligned, ALIGNMENT) else {
            self.allocated.fetch_sub(aligned, Ordering::SeqCst);
            return Err(VoidError::OutOfMemory { size: aligned });
        };
        let base = ptr.as_ptr() as usize;

        let arena = Arc::new(Arena::new(base, aligned, tag));
        self.arenas.write().insert(base, arena.clone());
        self.commit(base, aligned, size, tag, AllocationKind::Arena);

        log::debug!("Arena '{}' created: {} bytes at {:#x}", tag, aligned, base);
        Ok(arena)
    }

    /// Validate a request and reserve its aligned size against the ceiling
    fn admit(&self, size: usize) -> VoidResult<usize> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VoidError::ShutDown);
        }

        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(VoidError::InvalidArgument(format!(
                "allocation size {} outside 1..={}",
                size, MAX_ALLOC_SIZE
            )));
        }

        let aligned = align_up(size);

        if self.reserve(aligned) {
            return Ok(aligned);
        }

        log::debug!("Ceiling reached for {} bytes, running GC", aligned);
        self.collect_garbage();

        if self.reserve(aligned) {
            return Ok(aligned);
        }

        let used = self.allocated.load(Ordering::SeqCst);
        self.notify(MemoryWarning {
            level: WarningLevel::Exhausted,
            used,
            ceiling: self.ceiling,
            message: format!("Cannot allocate {} bytes", aligned),
        });

        Err(VoidError::MemoryExhausted {
            requested: aligned,
            used,
            ceiling: self.ceiling,
        })
    }

    /// Atomically add `aligned` to the running total if it fits
    fn reserve(&self, aligned: usize) -> bool {
        let ceiling = self.ceiling;
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(aligned).filter(|total| *total <= ceiling)
            })
            .is_ok()
    }

    fn place_pooled(&self, aligned: usize) -> Option<(usize, AllocationKind)> {
        let pools = self.pools.read();
        let pool = pools.iter().find(|p| p.block_size() >= aligned)?;
        pool.allocate().map(|address| (address, AllocationKind::Pool))
    }

    /// Record a placed allocation; budget already reserved
    fn commit(&self, address: usize, aligned: usize, requested: usize, tag: &str, kind: AllocationKind) {
        self.allocations.write().insert(
            address,
            Allocation {
                address,
                size: aligned,
                requested,
                tag: tag.to_string(),
                kind,
                created_at: Utc::now(),
            },
        );

        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        let current = self.allocated.load(Ordering::SeqCst);
        self.peak.fetch_max(current, Ordering::Relaxed);

        self.check_thresholds(current);
    }

    fn check_thresholds(&self, used: usize) {
        let usage = used as f64 / self.ceiling.max(1) as f64;

        if usage >= CRITICAL_THRESHOLD {
            self.healthy.store(false, Ordering::SeqCst);
            self.notify(MemoryWarning {
                level: WarningLevel::Critical,
                used,
                ceiling: self.ceiling,
                message: format!("Off-heap usage critical: {:.1}%", usage * 100.0),
            });
            self.collect_garbage();
        } else if usage >= WARNING_THRESHOLD {
            self.notify(MemoryWarning {
                level: WarningLevel::Warning,
                used,
                ceiling: self.ceiling,
                message: format!("Off-heap usage high: {:.1}%", usage * 100.0),
            });
        }
    }

    // ========================================================================
    // RELEASE
    // ========================================================================

    /// Free a tracked address. Address 0 is ignored; an unknown address is
    /// logged and reported as [`VoidError::UnknownHandle`].
    pub fn free(&self, address: usize) -> VoidResult<()> {
        if address == 0 {
            return Ok(());
        }

        let removed = self.allocations.write().remove(&address);

        let Some(allocation) = removed else {
            log::warn!("Free of unknown address {:#x}", address);
            return Err(VoidError::UnknownHandle { address });
        };

        self.release(allocation);
        Ok(())
    }

    /// Queue an address for the next GC pass
    pub fn defer_free(&self, address: usize) {
        if address != 0 {
            self.pending.push(address);
        }
    }

    fn release(&self, allocation: Allocation) {
        let Allocation { address, size, kind, .. } = allocation;

        // SAFETY: the allocation was live until removed from the table
        unsafe { poison(address, size) };

        match kind {
            AllocationKind::Pool => {
                let pools = self.pools.read();
                match pools.iter().find(|p| p.block_size() >= size) {
                    Some(pool) => {
                        if let Err(e) = pool.free(address) {
                            log::error!("Pool release failed: {}", e);
                        }
                    }
                    None => log::error!("No pool for {} byte block at {:#x}", size, address),
                }
            }
            AllocationKind::Arena => {
                if let Some(arena) = self.arenas.write().remove(&address) {
                    arena.mark_released();
                }
                self.free_raw(address, size);
            }
            AllocationKind::General => self.free_raw(address, size),
        }

        let remaining = self.allocated.fetch_sub(size, Ordering::SeqCst) - size;
        self.deallocation_count.fetch_add(1, Ordering::Relaxed);

        let usage = remaining as f64 / self.ceiling.max(1) as f64;
        if usage < WARNING_THRESHOLD && !self.healthy.swap(true, Ordering::SeqCst) {
            log::info!("Off-heap usage back to {:.1}%, manager healthy", usage * 100.0);
        }
    }

    fn free_raw(&self, address: usize, size: usize) {
        if let Some(ptr) = NonNull::new(address as *mut u8) {
            // SAFETY: obtained from `raw` with this size and ALIGNMENT
            unsafe { self.raw.free(ptr, size, ALIGNMENT) };
        }
    }

    /// Resize an allocation. Shrinking keeps the address; growing moves the
    /// contents to a new allocation and frees the old one.
    pub fn reallocate(&self, address: usize, new_size: usize) -> VoidResult<usize> {
        if address == 0 {
            return self.allocate(new_size, "realloc");
        }

        if new_size == 0 || new_size > MAX_ALLOC_SIZE {
            return Err(VoidError::InvalidArgument(format!(
                "reallocation size {} outside 1..={}",
                new_size, MAX_ALLOC_SIZE
            )));
        }

        let current = self
            .allocations
            .read()
            .get(&address)
            .map(|a| (a.size, a.tag.clone()));

        let Some((old_size, tag)) = current else {
            log::warn!("Reallocate of unknown address {:#x}, allocating fresh", address);
            return self.allocate(new_size, "realloc");
        };

        if new_size <= old_size {
            if let Some(allocation) = self.allocations.write().get_mut(&address) {
                allocation.requested = new_size;
            }
            return Ok(address);
        }

        let new_address = self.allocate(new_size, &tag)?;

        // SAFETY: both regions are live and at least old_size bytes long
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, new_address as *mut u8, old_size);
        }

        if let Err(e) = self.free(address) {
            log::warn!("Reallocate could not release {:#x}: {}", address, e);
        }

        Ok(new_address)
    }

    /// Drain deferred frees and compact pools. Returns the number of
    /// deferred addresses actually freed.
    pub fn collect_garbage(&self) -> usize {
        let mut freed = 0;
        while let Some(address) = self.pending.pop() {
            if self.free(address).is_ok() {
                freed += 1;
            }
        }

        let compacted: usize = self.pools.read().iter().map(Pool::compact).sum();
        self.gc_runs.fetch_add(1, Ordering::Relaxed);

        if freed > 0 || compacted > 0 {
            log::debug!("GC: {} deferred frees, {} pool blocks compacted", freed, compacted);
        }

        freed
    }

    /// Release everything. Outstanding allocations are reported as leaks.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.collect_garbage();

        let leaks = self.leak_report();
        for leak in &leaks {
            log::warn!(
                "Leak at shutdown: tag '{}' holds {} in {} allocations",
                leak.tag,
                crate::diagnostics::format_bytes(leak.bytes as u64),
                leak.allocations
            );
        }

        let outstanding: Vec<Allocation> = self.allocations.write().drain().map(|(_, a)| a).collect();
        for allocation in outstanding {
            self.release(allocation);
        }

        self.arenas.write().clear();
        self.pools.write().clear();

        log::info!(
            "Void Manager shutdown: peak {}, {} allocations, {} frees",
            crate::diagnostics::format_bytes(self.peak_bytes() as u64),
            self.allocation_count(),
            self.deallocation_count()
        );
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Install the observer for threshold and exhaustion events
    pub fn set_warning_callback<F>(&self, callback: F)
    where
        F: Fn(&MemoryWarning) + Send + Sync + 'static,
    {
        *self.warning_callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_warning_callback(&self) {
        *self.warning_callback.write() = None;
    }

    fn notify(&self, warning: MemoryWarning) {
        match warning.level {
            WarningLevel::Warning => log::warn!("{}", warning.message),
            WarningLevel::Critical | WarningLevel::Exhausted => log::error!("{}", warning.message),
        }

        let callback = self.warning_callback.read().clone();
        if let Some(callback) = callback {
            callback(&warning);
        }
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn usage_percent(&self) -> f64 {
        self.allocated_bytes() as f64 * 100.0 / self.ceiling.max(1) as f64
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    pub fn deallocation_count(&self) -> u64 {
        self.deallocation_count.load(Ordering::Relaxed)
    }

    pub fn active_allocations(&self) -> usize {
        self.allocations.read().len()
    }

    pub fn pending_frees(&self) -> usize {
        self.pending.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Whether `address` is a live tracked allocation
    pub fn contains(&self, address: usize) -> bool {
        self.allocations.read().contains_key(&address)
    }

    /// Copy of the tracking record for `address`
    pub fn allocation(&self, address: usize) -> Option<Allocation> {
        self.allocations.read().get(&address).cloned()
    }

    pub fn stats(&self) -> VoidStats {
        VoidStats {
            allocated_bytes: self.allocated_bytes(),
            peak_bytes: self.peak_bytes(),
            ceiling: self.ceiling,
            allocation_count: self.allocation_count(),
            deallocation_count: self.deallocation_count(),
            active_allocations: self.active_allocations(),
            pending_frees: self.pending_frees(),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.read().iter().map(Pool::stats).collect()
    }

    /// Live bytes grouped by tag, largest first
    pub fn tag_usage(&self) -> Vec<TagUsage> {
        let mut by_tag: HashMap<String, TagUsage> = HashMap::new();

        for allocation in self.allocations.read().values() {
            let usage = by_tag
                .entry(allocation.tag.clone())
                .or_insert_with(|| TagUsage::new(&allocation.tag));
            usage.bytes += allocation.size;
            usage.allocations += 1;
        }

        let mut usage: Vec<TagUsage> = by_tag.into_values().collect();
        usage.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.tag.cmp(&b.tag)));
        usage
    }

    /// Outstanding allocations grouped by tag
    pub fn leak_report(&self) -> Vec<LeakReport> {
        self.tag_usage()
            .into_iter()
            .map(|usage| LeakReport {
                tag: usage.tag,
                bytes: usage.bytes,
                allocations: usage.allocations,
            })
            .collect()
    }
}

impl std::fmt::Debug for VoidManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoidManager")
            .field("ceiling", &self.ceiling)
            .field("allocated", &self.allocated_bytes())
            .field("active", &self.active_allocations())
            .field("healthy", &self.is_healthy())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Drop for VoidManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn manager(max_mb: u64) -> Arc<VoidManager> {
        VoidManager::new(&MemoryConfig {
            off_heap_max_mb: max_mb,
            ..MemoryConfig::default()
        })
    }

    #[test]
    fn test_pool_kind_for_small_requests() {
        let manager = manager(16);
        let address = manager.allocate(48, "small").unwrap();
        let allocation = manager.allocation(address).unwrap();

        assert_eq!(allocation.kind, AllocationKind::Pool);
        assert_eq!(allocation.size, 48);
        assert_eq!(address % 64, 0);
    }

    #[test]
    fn test_general_kind_without_pooling() {
        let manager = VoidManager::new(&MemoryConfig {
            off_heap_max_mb: 16,
            pool_small_objects: false,
            ..MemoryConfig::default()
        });
        let address = manager.allocate(48, "small").unwrap();
        assert_eq!(manager.allocation(address).unwrap().kind, AllocationKind::General);
        assert!(manager.pool_stats().is_empty());
    }

    #[test]
    fn test_thresholds_fire_and_health_recovers() {
        let manager = manager(1);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.set_warning_callback(move |w| sink.lock().push(w.level));

        let big = manager.allocate(900 * 1024, "bulk").unwrap();
        assert!(events.lock().is_empty());

        let warn = manager.allocate(40 * 1024, "bulk").unwrap();
        assert_eq!(events.lock().as_slice(), &[WarningLevel::Warning]);
        assert!(manager.is_healthy());

        let crit = manager.allocate(60 * 1024, "bulk").unwrap();
        assert_eq!(events.lock().last(), Some(&WarningLevel::Critical));
        assert!(!manager.is_healthy());

        manager.free(crit).unwrap();
        manager.free(warn).unwrap();
        manager.free(big).unwrap();
        assert!(manager.is_healthy());
    }

    #[test]
    fn test_exhaustion_event() {
        let manager = manager(1);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.set_warning_callback(move |w| sink.lock().push((w.level, w.ceiling)));

        let err = manager.allocate(2 * MB, "too-big").unwrap_err();
        assert!(matches!(err, VoidError::MemoryExhausted { ceiling, .. } if ceiling == MB));
        assert_eq!(events.lock().as_slice(), &[(WarningLevel::Exhausted, MB)]);
    }

    #[test]
    fn test_tag_usage_sorted() {
        let manager = manager(16);
        manager.allocate(4096, "chunk").unwrap();
        manager.allocate(4096, "chunk").unwrap();
        manager.allocate(100, "entity").unwrap();

        let usage = manager.tag_usage();
        assert_eq!(usage[0].tag, "chunk");
        assert_eq!(usage[0].bytes, 8192);
        assert_eq!(usage[0].allocations, 2);
        assert_eq!(usage[1].tag, "entity");
        assert_eq!(usage[1].bytes, 112);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let manager = manager(16);
        manager.allocate(1000, "a").unwrap();
        manager.allocate(100_000, "b").unwrap();

        manager.shutdown();
        assert_eq!(manager.allocated_bytes(), 0);
        assert_eq!(manager.active_allocations(), 0);
        assert!(matches!(manager.allocate(16, "late"), Err(VoidError::ShutDown)));

        manager.shutdown();
        assert_eq!(manager.deallocation_count(), 2);
    }

    #[test]
    fn test_debug_output() {
        let manager = manager(16);
        let buffer = manager.create_buffer(64).unwrap();

        let text = format!("{:?}", manager);
        assert!(text.starts_with("VoidManager"));
        assert!(text.contains("allocated: 64"));
        assert!(text.contains("active: 1"));

        assert!(format!("{:?}", buffer).contains("VoidManager"));
    }
}
