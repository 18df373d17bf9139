//! # Void Core - Off-Heap Memory Engine
//!
//! Native memory subsystem for LIBS. Java hands bulk data (chunk payloads,
//! textures, packets) to native code instead of keeping it on the JVM heap.
//!
//! ## Modules
//!
//! - **Void Manager**: budgeted off-heap allocation with pools and arenas
//! - **Zero-Copy Buffers**: bounds-checked views over native memory
//! - **Asset Cache**: content-addressed deduplicated asset storage
//! - **Native Bridge**: engine lifecycle, readiness gating and callbacks
//! - **Runtime**: owns one subsystem and its maintenance thread
//!
//! The JNI exports in [`jni`] drive the same bridge types the Rust API does.

pub mod bridge;
pub mod diagnostics;
pub mod error;
pub mod jni;
pub mod memory;
pub mod runtime;
pub mod util;

pub use bridge::{CallbackHandler, HeadlessEngine, NativeBridge, NativeEngine, NativeHandle};
pub use diagnostics::MemoryReport;
pub use error::{VoidError, VoidResult};
pub use memory::{AssetCache, ZeroCopyBuffer};
pub use memory::void_manager::VoidManager;
pub use runtime::{CoreConfig, VoidRuntime};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "void_core";

/// Install the tracing subscriber. `log` records are forwarded to it and the
/// filter is read from `RUST_LOG` (default `info`). Later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init();
}
