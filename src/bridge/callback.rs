//! # Callback Dispatch
//!
//! Native-to-host notifications. Each callback kind has a default handler
//! that logs; a registered handler replaces it. Handlers run on a small
//! rayon pool so the thread raising the callback never waits on them, and a
//! panicking handler is contained and counted.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{VoidError, VoidResult};
use crate::memory::{MemoryWarning, WarningLevel};

/// Callback kinds shared with the Java side
pub mod callback_type {
    pub const ERROR: i32 = 0;
    pub const LOG: i32 = 1;
    pub const FRAME_READY: i32 = 10;
    pub const CHUNK_READY: i32 = 20;
    pub const CHUNK_MESH_READY: i32 = 21;
    pub const ENTITY_UPDATE: i32 = 30;
    pub const ENTITY_REMOVED: i32 = 31;
    pub const SOUND_COMPLETE: i32 = 40;
    pub const NETWORK_PACKET: i32 = 50;
    pub const MEMORY_WARNING: i32 = 60;
    pub const MEMORY_CRITICAL: i32 = 61;
    pub const PROFILING_DATA: i32 = 70;

    pub const ALL: [i32; 12] = [
        ERROR,
        LOG,
        FRAME_READY,
        CHUNK_READY,
        CHUNK_MESH_READY,
        ENTITY_UPDATE,
        ENTITY_REMOVED,
        SOUND_COMPLETE,
        NETWORK_PACKET,
        MEMORY_WARNING,
        MEMORY_CRITICAL,
        PROFILING_DATA,
    ];
}

/// Log levels carried by LOG callbacks
pub mod log_level {
    pub const TRACE: i32 = 0;
    pub const DEBUG: i32 = 1;
    pub const INFO: i32 = 2;
    pub const WARN: i32 = 3;
    pub const ERROR: i32 = 4;
}

/// A single payload value
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl CallbackValue {
    fn as_f64(&self) -> Option<f64> {
        match *self {
            CallbackValue::Int(v) => Some(v as f64),
            CallbackValue::Long(v) => Some(v as f64),
            CallbackValue::Float(v) => Some(v as f64),
            CallbackValue::Double(v) => Some(v),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match *self {
            CallbackValue::Int(v) => Some(v as i64),
            CallbackValue::Long(v) => Some(v),
            CallbackValue::Float(v) => Some(v as i64),
            CallbackValue::Double(v) => Some(v as i64),
            _ => None,
        }
    }
}

impl From<i32> for CallbackValue {
    fn from(v: i32) -> Self {
        CallbackValue::Int(v)
    }
}

impl From<i64> for CallbackValue {
    fn from(v: i64) -> Self {
        CallbackValue::Long(v)
    }
}

impl From<f32> for CallbackValue {
    fn from(v: f32) -> Self {
        CallbackValue::Float(v)
    }
}

impl From<f64> for CallbackValue {
    fn from(v: f64) -> Self {
        CallbackValue::Double(v)
    }
}

impl From<bool> for CallbackValue {
    fn from(v: bool) -> Self {
        CallbackValue::Bool(v)
    }
}

impl From<&str> for CallbackValue {
    fn from(v: &str) -> Self {
        CallbackValue::Str(v.to_string())
    }
}

impl From<String> for CallbackValue {
    fn from(v: String) -> Self {
        CallbackValue::Str(v)
    }
}

/// Key/value payload of a callback. Numeric getters convert between
/// numeric kinds; a missing or mistyped key yields the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackData {
    values: HashMap<String, CallbackValue>,
}

impl CallbackData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<CallbackValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<CallbackValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&CallbackValue> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.get(key)
            .and_then(CallbackValue::as_i64)
            .map(|v| v as i32)
            .unwrap_or(default)
    }

    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(CallbackValue::as_i64).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        self.get(key)
            .and_then(CallbackValue::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(CallbackValue::as_f64).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(CallbackValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn get_string<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            Some(CallbackValue::Str(v)) => v,
            _ => default,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Callback handler function
pub type Handler = Arc<dyn Fn(&CallbackData) + Send + Sync>;

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

/// Dispatches callbacks to handlers on a worker pool
pub struct CallbackHandler {
    handlers: RwLock<HashMap<i32, Handler>>,
    pool: RwLock<Option<rayon::ThreadPool>>,
    counters: Arc<Counters>,
}

impl CallbackHandler {
    /// Create a handler with `threads` workers and the default handlers
    pub fn new(threads: usize) -> VoidResult<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("libs-callback-{}", i))
            .build()
            .map_err(|e| VoidError::Config(format!("callback pool: {}", e)))?;

        let handlers = callback_type::ALL
            .iter()
            .filter_map(|&kind| default_handler(kind).map(|h| (kind, h)))
            .collect();

        log::debug!("Callback handler started with {} threads", pool.current_num_threads());

        Ok(Arc::new(Self {
            handlers: RwLock::new(handlers),
            pool: RwLock::new(Some(pool)),
            counters: Arc::new(Counters::default()),
        }))
    }

    /// Replace the handler for `kind`
    pub fn register_handler<F>(&self, kind: i32, handler: F)
    where
        F: Fn(&CallbackData) + Send + Sync + 'static,
    {
        self.handlers.write().insert(kind, Arc::new(handler));
        log::debug!("Registered handler for callback type {}", kind);
    }

    /// Drop a registered handler, restoring the default
    pub fn remove_handler(&self, kind: i32) {
        let mut handlers = self.handlers.write();
        match default_handler(kind) {
            Some(handler) => {
                handlers.insert(kind, handler);
            }
            None => {
                handlers.remove(&kind);
            }
        }
    }

    pub fn has_handler(&self, kind: i32) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Queue `data` for the handler of `kind`. Never blocks on the handler.
    pub fn dispatch(&self, kind: i32, data: CallbackData) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.handlers.read().get(&kind).cloned() else {
            log::debug!("No handler for callback type: {}", kind);
            return;
        };

        let pool = self.pool.read();
        let Some(pool) = pool.as_ref() else {
            log::debug!("Callback type {} discarded after shutdown", kind);
            return;
        };

        let counters = self.counters.clone();
        pool.spawn(move || {
            match catch_unwind(AssertUnwindSafe(|| handler(&data))) {
                Ok(()) => {
                    counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(panic) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Callback handler error for type {}: {}",
                        kind,
                        panic_message(&*panic)
                    );
                }
            }
        });
    }

    // ========================================================================
    // TYPED SENDERS
    // ========================================================================

    pub fn send_error(&self, code: i32, message: &str, details: &str) {
        self.dispatch(
            callback_type::ERROR,
            CallbackData::new()
                .with("code", code)
                .with("message", message)
                .with("details", details),
        );
    }

    pub fn send_log(&self, level: i32, module: &str, message: &str) {
        self.dispatch(
            callback_type::LOG,
            CallbackData::new()
                .with("level", level)
                .with("module", module)
                .with("message", message),
        );
    }

    /// MEMORY_WARNING or MEMORY_CRITICAL depending on the level
    pub fn send_memory_warning(&self, warning: &MemoryWarning) {
        let kind = match warning.level {
            WarningLevel::Warning => callback_type::MEMORY_WARNING,
            WarningLevel::Critical | WarningLevel::Exhausted => callback_type::MEMORY_CRITICAL,
        };
        self.dispatch(
            kind,
            CallbackData::new()
                .with("used", warning.used as i64)
                .with("max", warning.ceiling as i64)
                .with("message", warning.message.as_str()),
        );
    }

    pub fn send_chunk_ready(&self, x: i32, z: i32, handle: i64) {
        self.dispatch(
            callback_type::CHUNK_READY,
            CallbackData::new().with("x", x).with("z", z).with("handle", handle),
        );
    }

    /// Callback carrying one integer, stored as `id` for entity and sound
    /// kinds and `value` otherwise
    pub fn send_simple(&self, kind: i32, value: i32) {
        let key = match kind {
            callback_type::ENTITY_REMOVED | callback_type::SOUND_COMPLETE => "id",
            _ => "value",
        };
        self.dispatch(kind, CallbackData::new().with(key, value));
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Stop the worker pool. Queued jobs still run; later dispatches are
    /// discarded.
    pub fn shutdown(&self) {
        if self.pool.write().take().is_some() {
            log::info!(
                "Shutting down callback handler (processed {} callbacks)",
                self.received()
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.read().is_none()
    }

    /// Callbacks raised, including ones without a handler
    pub fn received(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
    }

    /// Handler runs that completed
    pub fn dispatched(&self) -> u64 {
        self.counters.dispatched.load(Ordering::Relaxed)
    }

    /// Handler runs that panicked
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

impl Drop for CallbackHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn default_handler(kind: i32) -> Option<Handler> {
    let handler: Handler = match kind {
        callback_type::ERROR => Arc::new(|data: &CallbackData| {
            log::error!(
                "Native error [{}]: {} - {}",
                data.get_int("code", 0),
                data.get_string("message", "Unknown error"),
                data.get_string("details", "")
            );
        }),
        callback_type::LOG => Arc::new(|data: &CallbackData| {
            let message = data.get_string("message", "");
            let module = data.get_string("module", "native");
            match data.get_int("level", log_level::INFO) {
                log_level::TRACE => log::trace!("[{}] {}", module, message),
                log_level::DEBUG => log::debug!("[{}] {}", module, message),
                log_level::WARN => log::warn!("[{}] {}", module, message),
                log_level::ERROR => log::error!("[{}] {}", module, message),
                _ => log::info!("[{}] {}", module, message),
            }
        }),
        callback_type::MEMORY_WARNING => Arc::new(|data: &CallbackData| {
            log::warn!(
                "Memory warning: {} (Used: {} / Max: {})",
                data.get_string("message", ""),
                data.get_long("used", 0),
                data.get_long("max", 0)
            );
        }),
        callback_type::MEMORY_CRITICAL => Arc::new(|data: &CallbackData| {
            log::error!(
                "CRITICAL MEMORY WARNING: {} (Used: {} / Max: {})",
                data.get_string("message", ""),
                data.get_long("used", 0),
                data.get_long("max", 0)
            );
        }),
        callback_type::FRAME_READY | callback_type::PROFILING_DATA => {
            Arc::new(move |data: &CallbackData| {
                log::trace!("Callback {}: {}", kind, data.get_long("value", 0));
            })
        }
        callback_type::CHUNK_READY
        | callback_type::CHUNK_MESH_READY
        | callback_type::ENTITY_UPDATE
        | callback_type::ENTITY_REMOVED
        | callback_type::SOUND_COMPLETE
        | callback_type::NETWORK_PACKET => Arc::new(move |data: &CallbackData| {
            log::debug!("Callback {} ({} values)", kind, data.len());
        }),
        _ => return None,
    };
    Some(handler)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
