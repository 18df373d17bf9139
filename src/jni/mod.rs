//! # JNI Bindings
//!
//! Exports for `dev.libs.bridge.NativeBridge`. The Java side owns the
//! engine handle returned by `nativeCreateEngine` and must pass it back to
//! every call until `nativeDestroyEngine`.
//!
//! ## Safety
//!
//! All exports take raw pointers from the JVM. Handles of zero are treated
//! as absent; any other value must come from `nativeCreateEngine`.

pub mod bridge;
pub mod callback;
pub mod types;

pub use bridge::EngineInstance;
