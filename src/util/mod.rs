//! # Utilities

pub mod hash;

pub use hash::ContentHash;
