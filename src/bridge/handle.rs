//! # Native Handles
//!
//! A `NativeHandle` owns one block allocated through the bridge. It is
//! released exactly once: by `close`, by `NativeBridge::free`, by `Drop`, or
//! by bridge shutdown, whichever comes first.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{VoidError, VoidResult};
use crate::memory::ZeroCopyBuffer;

/// Shared state of one handle. `freed` is only ever flipped while the slot
/// lock is held.
pub(crate) struct HandleSlot {
    pub(crate) address: usize,
    pub(crate) size: usize,
    pub(crate) freed: Mutex<bool>,
}

impl HandleSlot {
    pub(crate) fn new(address: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            address,
            size,
            freed: Mutex::new(false),
        })
    }
}

/// Whoever hands out handles and must hear about their release
pub(crate) trait HandleOwner: Send + Sync {
    fn release_slot(&self, slot: &HandleSlot);
}

/// Owned block of bridge memory
pub struct NativeHandle {
    slot: Arc<HandleSlot>,
    owner: Weak<dyn HandleOwner>,
}

impl NativeHandle {
    pub(crate) fn new(slot: Arc<HandleSlot>, owner: Weak<dyn HandleOwner>) -> Self {
        Self { slot, owner }
    }

    pub fn address(&self) -> usize {
        self.slot.address
    }

    pub fn size(&self) -> usize {
        self.slot.size
    }

    pub fn is_freed(&self) -> bool {
        *self.slot.freed.lock()
    }

    /// Run `f` over a buffer view of the block. The block cannot be freed
    /// while `f` runs: a `close` or `NativeBridge::free` from another thread
    /// waits for `f` to return.
    ///
    /// `f` must not close or free this same handle. The slot lock is held
    /// for the duration of `f` and is not reentrant, so doing so deadlocks.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut ZeroCopyBuffer<'_>) -> R) -> VoidResult<R> {
        let freed = self.slot.freed.lock();
        if *freed {
            return Err(VoidError::UseAfterFree {
                address: self.slot.address,
            });
        }

        let mut view = ZeroCopyBuffer::view(self.slot.address, self.slot.size, false);
        Ok(f(&mut view))
    }

    /// Release the block. Repeated calls are no-ops.
    pub fn close(&self) {
        match self.owner.upgrade() {
            Some(owner) => owner.release_slot(&self.slot),
            None => {
                // Bridge is gone; its shutdown already released the block
                *self.slot.freed.lock() = true;
            }
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("address", &format_args!("{:#x}", self.slot.address))
            .field("size", &self.slot.size)
            .field("freed", &self.is_freed())
            .finish()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.close();
    }
}
