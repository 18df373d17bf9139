//! # Error Types
//!
//! Error taxonomy shared by the allocator, buffers, asset cache and bridge.

use thiserror::Error;

/// Result alias used throughout the crate
pub type VoidResult<T> = Result<T, VoidError>;

/// Errors raised by the off-heap memory subsystem
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoidError {
    /// Malformed size, offset or length
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The ceiling would be exceeded even after a GC pass
    #[error("memory exhausted: requested {requested} bytes with {used}/{ceiling} bytes in use")]
    MemoryExhausted {
        requested: usize,
        used: usize,
        ceiling: usize,
    },

    /// The raw allocator returned null
    #[error("native allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    /// Access through a handle that was already freed
    #[error("use after free: handle {address:#x} was already released")]
    UseAfterFree { address: usize },

    /// Access outside of a region
    #[error("out of bounds: offset {offset} + length {length} exceeds size {size}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },

    /// Write through a read-only view
    #[error("buffer is read-only")]
    ReadOnly,

    /// Address or path never tracked (tolerated)
    #[error("unknown handle {address:#x}")]
    UnknownHandle { address: usize },

    /// Block returned to a pool while already free
    #[error("double free of {address:#x}")]
    DoubleFree { address: usize },

    /// Address handed to a pool that did not carve it
    #[error("address {address:#x} does not belong to the {block_size}-byte pool")]
    ForeignBlock { address: usize, block_size: usize },

    /// Native method catalog incomplete
    #[error("native link failure, missing methods: {}", missing.join(", "))]
    NativeLinkFailure { missing: Vec<String> },

    /// Engine not created or not initialized
    #[error("native engine is not initialized")]
    NotInitialized,

    /// Manager already shut down
    #[error("memory manager has been shut down")]
    ShutDown,

    /// Packet compression/decompression failed
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration rejected
    #[error("config error: {0}")]
    Config(String),
}

impl VoidError {
    /// Conditions a caller can degrade around (retry, re-fetch, ignore)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VoidError::MemoryExhausted { .. }
                | VoidError::OutOfMemory { .. }
                | VoidError::UnknownHandle { .. }
                | VoidError::NotInitialized
        )
    }

    /// Memory-safety violations that must abort the offending operation
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            VoidError::UseAfterFree { .. }
                | VoidError::OutOfBounds { .. }
                | VoidError::ReadOnly
                | VoidError::ForeignBlock { .. }
                | VoidError::DoubleFree { .. }
        )
    }

    pub(crate) fn out_of_bounds(offset: usize, length: usize, size: usize) -> Self {
        VoidError::OutOfBounds { offset, length, size }
    }
}
