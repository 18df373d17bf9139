//! # Arena
//!
//! Bump allocator over a single fixed backing region owned by the
//! [`VoidManager`](super::VoidManager). Individual bumps cannot be freed;
//! the whole arena is reset or released at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::checked_align_up;

/// Bump-pointer arena
#[derive(Debug)]
pub struct Arena {
    base: usize,
    capacity: usize,
    offset: AtomicUsize,
    released: AtomicBool,
    tag: String,
}

impl Arena {
    pub(crate) fn new(base: usize, capacity: usize, tag: &str) -> Self {
        Self {
            base,
            capacity,
            offset: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            tag: tag.to_string(),
        }
    }

    /// Bump `size` bytes (rounded up to 16). `None` when the arena is full
    /// or has been released; a refused bump leaves the offset untouched.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        if size == 0 || self.is_released() {
            return None;
        }

        let aligned = checked_align_up(size)?;
        let mut current = self.offset.load(Ordering::Acquire);

        loop {
            let end = current.checked_add(aligned)?;
            if end > self.capacity {
                log::trace!(
                    "Arena '{}' full: {} + {} > {}",
                    self.tag,
                    current,
                    aligned,
                    self.capacity
                );
                return None;
            }

            match self
                .offset
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(self.base + current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Invalidate every prior bump
    pub fn reset(&self) {
        self.offset.store(0, Ordering::Release);
    }

    /// Base address of the backing region (the address to `free`)
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether the backing region has been returned to the manager
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
        self.offset.store(self.capacity, Ordering::Release);
    }

    /// Whether `address` lies inside the backing region
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_alignment() {
        let arena = Arena::new(0x1000, 256, "test");
        assert_eq!(arena.allocate(1), Some(0x1000));
        assert_eq!(arena.allocate(17), Some(0x1010));
        assert_eq!(arena.used(), 48);
        assert_eq!(arena.remaining(), 208);
    }

    #[test]
    fn test_overflow_leaves_offset() {
        let arena = Arena::new(0x1000, 64, "test");
        assert!(arena.allocate(48).is_some());
        assert!(arena.allocate(32).is_none());
        assert_eq!(arena.used(), 48);
        assert!(arena.allocate(16).is_some());
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn test_reset() {
        let arena = Arena::new(0x1000, 64, "test");
        arena.allocate(64).unwrap();
        arena.reset();
        assert_eq!(arena.allocate(16), Some(0x1000));
    }

    #[test]
    fn test_released_refuses() {
        let arena = Arena::new(0x1000, 64, "test");
        arena.mark_released();
        assert!(arena.allocate(16).is_none());
        arena.reset();
        assert!(arena.allocate(16).is_none());
    }

    #[test]
    fn test_concurrent_bumps_never_overlap() {
        use std::sync::Arc;

        let arena = Arc::new(Arena::new(0, 16 * 1000, "test"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(a) = arena.allocate(16) {
                        got.push(a);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(arena.used(), arena.capacity());
    }
}
