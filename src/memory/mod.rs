//! # Memory Management Module
//!
//! Off-heap memory management for avoiding GC pauses.
//!
//! Everything here sits on top of a [`RawAllocator`], the single primitive
//! that actually obtains and returns native memory.

pub mod arena;
pub mod assets;
pub mod buffer;
pub mod pool;
pub mod void_manager;

pub use arena::Arena;
pub use assets::{AssetCache, AssetHandle, AssetStats, AssetType};
pub use buffer::{BufferFlags, ZeroCopyBuffer};
pub use pool::{Pool, PoolStats};
pub use void_manager::{
    Allocation, AllocationKind, MemoryWarning, VoidManager, VoidStats, WarningLevel,
};

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment unit for every tracked allocation
pub const ALIGNMENT: usize = 16;

/// Largest single allocation (256 MiB)
pub const MAX_ALLOC_SIZE: usize = 256 * 1024 * 1024;

/// Default arena backing size (16 MiB)
pub const DEFAULT_ARENA_SIZE: usize = 16 * 1024 * 1024;

/// Fixed pool block sizes, ascending
pub const POOL_BLOCK_SIZES: [usize; 6] = [64, 256, 1024, 4096, 16384, 65536];

/// Usage fraction that raises a warning
pub const WARNING_THRESHOLD: f64 = 0.90;

/// Usage fraction that raises a critical event and forces GC
pub const CRITICAL_THRESHOLD: f64 = 0.95;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
/// `size` must be at most [`MAX_ALLOC_SIZE`]; see [`checked_align_up`].
#[inline]
pub fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// [`align_up`] for unvalidated sizes. `None` when rounding overflows.
#[inline]
pub fn checked_align_up(size: usize) -> Option<usize> {
    size.checked_add(ALIGNMENT - 1).map(|s| s & !(ALIGNMENT - 1))
}

/// Source of raw native memory
pub trait RawAllocator: Send + Sync {
    /// Obtain `size` bytes aligned to `align`, or `None` if the system refuses
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`RawAllocator::allocate`]
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `size` and `align`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Raw allocator backed by the global Rust allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let layout = Layout::from_size_align(size, align).ok()?;

        // SAFETY: layout has a non-zero size
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(size, align) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Overwrite memory that is about to be released
#[cfg(feature = "validation")]
#[inline]
pub(crate) unsafe fn poison(address: usize, size: usize) {
    std::ptr::write_bytes(address as *mut u8, 0xDD, size);
}

#[cfg(not(feature = "validation"))]
#[inline]
pub(crate) unsafe fn poison(_address: usize, _size: usize) {}
