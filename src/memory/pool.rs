//! # Block Pool
//!
//! Fixed-block-size sub-allocator. Blocks are carved from the raw allocator
//! aligned to their own size and recycled through a LIFO free-list.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::RawAllocator;
use crate::error::{VoidError, VoidResult};

/// A contiguous region owned by a pool
#[derive(Debug, Clone, Copy)]
struct Region {
    base: usize,
    len: usize,
    /// Carved on demand after the initial slab
    grown: bool,
}

impl Region {
    fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.len
    }
}

struct PoolInner {
    /// Free block addresses, most recently freed last
    free: Vec<usize>,
    /// Same addresses as `free`, for membership
    free_set: HashSet<usize>,
    /// Slabs and grown blocks
    regions: Vec<Region>,
    /// Blocks ever carved
    total_blocks: usize,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub in_use: usize,
    pub regions: usize,
}

/// Fixed-size block pool
pub struct Pool {
    block_size: usize,
    raw: Arc<dyn RawAllocator>,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Create a pool and pre-carve `initial_blocks` as one slab
    pub fn new(block_size: usize, initial_blocks: usize, raw: Arc<dyn RawAllocator>) -> Self {
        debug_assert!(block_size.is_power_of_two());

        let pool = Self {
            block_size,
            raw,
            inner: Mutex::new(PoolInner {
                free: Vec::with_capacity(initial_blocks),
                free_set: HashSet::with_capacity(initial_blocks),
                regions: Vec::new(),
                total_blocks: 0,
            }),
        };

        if initial_blocks > 0 {
            let len = block_size * initial_blocks;
            match pool.raw.allocate(len, block_size) {
                Some(ptr) => {
                    let base = ptr.as_ptr() as usize;
                    let mut inner = pool.inner.lock();
                    inner.regions.push(Region {
                        base,
                        len,
                        grown: false,
                    });
                    // Reverse so the lowest address is handed out first
                    let blocks: Vec<usize> =
                        (0..initial_blocks).rev().map(|i| base + i * block_size).collect();
                    inner.free_set.extend(blocks.iter().copied());
                    inner.free = blocks;
                    inner.total_blocks = initial_blocks;
                }
                None => {
                    log::warn!(
                        "Pool {}B: initial slab of {} blocks unavailable, growing on demand",
                        block_size,
                        initial_blocks
                    );
                }
            }
        }

        log::trace!("Pool {}B created with {} blocks", block_size, initial_blocks);
        pool
    }

    /// Initial capacity used by the manager for a given block size
    pub fn initial_capacity(block_size: usize) -> usize {
        (1024 / (block_size / 64).max(1)).max(16)
    }

    /// Block size served by this pool
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Take a block, growing by one raw block if the free-list is empty
    pub fn allocate(&self) -> Option<usize> {
        let mut inner = self.inner.lock();

        if let Some(address) = inner.free.pop() {
            inner.free_set.remove(&address);
            return Some(address);
        }

        let ptr = self.raw.allocate(self.block_size, self.block_size)?;
        let base = ptr.as_ptr() as usize;
        inner.regions.push(Region {
            base,
            len: self.block_size,
            grown: true,
        });
        inner.total_blocks += 1;

        log::trace!("Pool {}B grew to {} blocks", self.block_size, inner.total_blocks);
        Some(base)
    }

    /// Whether `address` is a block start carved by this pool
    pub fn owns(&self, address: usize) -> bool {
        let inner = self.inner.lock();
        Self::owns_locked(&inner, self.block_size, address)
    }

    fn owns_locked(inner: &PoolInner, block_size: usize, address: usize) -> bool {
        inner
            .regions
            .iter()
            .any(|r| r.contains(address) && (address - r.base) % block_size == 0)
    }

    /// Return a block to the free-list. A block already on the free-list
    /// is refused with [`VoidError::DoubleFree`].
    pub fn free(&self, address: usize) -> VoidResult<()> {
        let mut inner = self.inner.lock();

        if !Self::owns_locked(&inner, self.block_size, address) {
            return Err(VoidError::ForeignBlock {
                address,
                block_size: self.block_size,
            });
        }

        if !inner.free_set.insert(address) {
            log::error!("Pool {}B: double free of {:#x}", self.block_size, address);
            return Err(VoidError::DoubleFree { address });
        }

        inner.free.push(address);
        Ok(())
    }

    /// Release grown single-block regions that are currently free.
    ///
    /// Returns the number of blocks handed back to the raw allocator.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        let block_size = self.block_size;

        let releasable: Vec<usize> = inner
            .regions
            .iter()
            .filter(|r| r.grown && inner.free_set.contains(&r.base))
            .map(|r| r.base)
            .collect();

        if releasable.is_empty() {
            return 0;
        }

        inner.free.retain(|a| !releasable.contains(a));
        for base in &releasable {
            inner.free_set.remove(base);
        }
        inner
            .regions
            .retain(|r| !(r.grown && releasable.contains(&r.base)));
        inner.total_blocks -= releasable.len();

        for base in &releasable {
            if let Some(ptr) = NonNull::new(*base as *mut u8) {
                // SAFETY: region was obtained from `raw` with this size and alignment
                unsafe { self.raw.free(ptr, block_size, block_size) };
            }
        }

        log::trace!("Pool {}B compacted {} blocks", block_size, releasable.len());
        releasable.len()
    }

    /// Snapshot of pool occupancy
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            block_size: self.block_size,
            total_blocks: inner.total_blocks,
            free_blocks: inner.free.len(),
            in_use: inner.total_blocks - inner.free.len(),
            regions: inner.regions.len(),
        }
    }

    /// Number of blocks on the free-list
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for region in inner.regions.drain(..) {
            if let Some(ptr) = NonNull::new(region.base as *mut u8) {
                // SAFETY: region was obtained from `raw` with this size and alignment
                unsafe { self.raw.free(ptr, region.len, self.block_size) };
            }
        }
        inner.free.clear();
        inner.free_set.clear();
    }
}
