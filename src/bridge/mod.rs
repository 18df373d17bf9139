//! # Native Bridge
//!
//! The boundary contract between the host and a native engine.
//!
//! [`NativeEngine`] is the catalog of entry points as a Rust trait; any
//! engine that implements it can sit behind a [`NativeBridge`]. The bridge
//! adds what the host expects regardless of engine:
//!
//! - readiness gating: while the engine is not initialized or is paused,
//!   operational calls are silent no-ops
//! - one lifecycle lock: lifecycle transitions take the write side, every
//!   operational call holds the read side for its duration
//! - link verification before the engine is created
//! - tracking of [`NativeHandle`]s so shutdown frees what callers leaked
//!
//! Lock order: engine lock, then a handle slot lock, then the handle map.

pub mod callback;
pub mod catalog;
pub mod codec;
pub mod handle;
pub mod headless;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::error::{VoidError, VoidResult};
use crate::memory::MAX_ALLOC_SIZE;

pub use callback::{callback_type, CallbackData, CallbackHandler, CallbackValue};
pub use catalog::{NativeMethod, NATIVE_METHODS};
pub use codec::Codec;
pub use handle::NativeHandle;
pub use headless::{HeadlessContext, HeadlessEngine};

use handle::{HandleOwner, HandleSlot};

/// The native method catalog as a trait.
///
/// Lifecycle methods take `&mut self` and run under the bridge's write lock;
/// everything else takes `&self` and may run concurrently.
pub trait NativeEngine: Send + Sync + Sized + 'static {
    /// Whatever the engine needs from its host to be created
    type Context: Send + Sync + 'static;

    /// `nativeCreateEngine`
    fn create(context: &Self::Context, config: &[u8]) -> VoidResult<Self>;

    /// `nativeDestroyEngine`
    fn destroy(self) {}

    /// Whether the engine provides catalog entry `method`
    fn supports(method: &str) -> bool {
        catalog::find(method).is_some()
    }

    // Lifecycle
    fn initialize(&mut self, hardware_info: &[u8], gpu_caps: &[u8], config: &[u8]) -> VoidResult<()>;
    fn shutdown(&mut self);
    fn pause(&self);
    fn resume(&self);

    // Frame
    fn on_tick(&self, tick: i64, delta_time: f32);
    fn prepare_frame(&self, partial_ticks: f32);
    fn render_world(&self, frame: i64, partial_ticks: f32, view: &[f32], projection: &[f32]);
    fn composite_frame(&self);

    // Memory
    fn allocate(&self, size: usize) -> VoidResult<usize>;
    fn free(&self, address: usize);
    fn sync_memory(&self);
    fn memory_usage(&self) -> u64;

    // Entities
    fn spawn_entity(&self, id: i32, kind: &str, x: f64, y: f64, z: f64);
    fn remove_entity(&self, id: i32);
    fn update_entity(&self, id: i32, x: f64, y: f64, z: f64, yaw: f32, pitch: f32);
    /// `positions` holds x, y, z, yaw, pitch per id
    fn batch_update_entities(&self, ids: &[i32], positions: &[f32]);

    // Chunks
    fn load_chunk(&self, x: i32, z: i32, data: &[u8]);
    fn unload_chunk(&self, x: i32, z: i32);
    fn update_chunk(&self, x: i32, z: i32, data: &[u8]);
    fn mark_chunk_dirty(&self, x: i32, z: i32);

    // Textures
    /// Returns a texture handle, 0 on failure
    fn upload_texture(&self, name: &str, data: &[u8], width: i32, height: i32, format: i32) -> u64;
    fn unload_texture(&self, handle: u64);

    // Audio
    fn play_sound(&self, sound: &str, x: f32, y: f32, z: f32, volume: f32, pitch: f32);
    fn stop_sound(&self, sound: &str);
    fn update_listener(&self, x: f32, y: f32, z: f32, yaw: f32, pitch: f32);

    // Network
    fn compress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>>;
    fn decompress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>>;
    fn predict_state(&self, tick: i64, state: &[u8]);
    fn reconcile_state(&self, tick: i64, server_state: &[u8]);

    // Debug
    fn debug_info(&self) -> String;
    fn set_debug_flag(&self, flag: &str, value: bool);
    fn profile_data(&self) -> u64;

    // Callbacks
    fn register_callbacks(&self, callbacks: Arc<CallbackHandler>);
}

/// Readiness-gated front of a [`NativeEngine`]
pub struct NativeBridge<E: NativeEngine> {
    context: E::Context,
    callbacks: Arc<CallbackHandler>,
    engine: RwLock<Option<E>>,
    initialized: AtomicBool,
    paused: AtomicBool,
    handles: Mutex<HashMap<usize, Arc<HandleSlot>>>,
    memory_usage: AtomicU64,
    self_ref: Weak<Self>,
}

impl<E: NativeEngine> NativeBridge<E> {
    pub fn new(context: E::Context, callbacks: Arc<CallbackHandler>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            context,
            callbacks,
            engine: RwLock::new(None),
            initialized: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            handles: Mutex::new(HashMap::new()),
            memory_usage: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Verify the link, create and initialize the engine, register
    /// callbacks. Initializing twice is a no-op.
    pub fn initialize(&self, hardware_info: &[u8], gpu_caps: &[u8], config: &[u8]) -> VoidResult<()> {
        let mut guard = self.engine.write();

        if self.initialized.load(Ordering::Acquire) {
            log::warn!("Engine already initialized");
            return Ok(());
        }

        log::info!("Initializing native engine...");
        catalog::verify_link(E::supports)?;

        let mut engine = E::create(&self.context, config).map_err(|e| {
            log::error!("Failed to create native engine instance: {}", e);
            e
        })?;

        if let Err(e) = engine.initialize(hardware_info, gpu_caps, config) {
            log::error!("Native engine initialization failed: {}", e);
            engine.destroy();
            return Err(e);
        }

        engine.register_callbacks(self.callbacks.clone());
        *guard = Some(engine);
        self.paused.store(false, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        log::info!("Native engine initialized successfully");
        Ok(())
    }

    /// Free tracked handles, shut down and destroy the engine
    pub fn shutdown(&self) {
        let mut guard = self.engine.write();

        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        log::info!("Shutting down native engine...");

        let slots: Vec<Arc<HandleSlot>> = self.handles.lock().drain().map(|(_, s)| s).collect();
        let mut leaked = 0usize;
        for slot in &slots {
            let mut freed = slot.freed.lock();
            if !*freed {
                *freed = true;
                leaked += slot.size;
                if let Some(engine) = guard.as_ref() {
                    engine.free(slot.address);
                }
            }
        }
        if !slots.is_empty() {
            log::warn!(
                "Freed {} outstanding native handles ({})",
                slots.len(),
                crate::diagnostics::format_bytes(leaked as u64)
            );
        }

        if let Some(mut engine) = guard.take() {
            engine.shutdown();
            engine.destroy();
        }

        self.paused.store(false, Ordering::Release);
        self.memory_usage.store(0, Ordering::Relaxed);
        log::info!("Native engine shutdown complete");
    }

    pub fn pause(&self) {
        if !self.is_initialized() || self.is_paused() {
            return;
        }

        if let Some(engine) = self.engine() {
            engine.pause();
            self.paused.store(true, Ordering::Release);
        }
    }

    pub fn resume(&self) {
        if !self.is_initialized() || !self.is_paused() {
            return;
        }

        if let Some(engine) = self.engine() {
            engine.resume();
            self.paused.store(false, Ordering::Release);
        }
    }

    /// Read access to the engine, ungated
    pub fn engine(&self) -> Option<MappedRwLockReadGuard<'_, E>> {
        RwLockReadGuard::try_map(self.engine.read(), |e| e.as_ref()).ok()
    }

    /// Engine under the read lock, if initialized and not paused
    fn ready(&self) -> Option<MappedRwLockReadGuard<'_, E>> {
        if !self.is_initialized() {
            log::trace!("Engine not initialized");
            return None;
        }
        if self.is_paused() {
            log::trace!("Engine is paused");
            return None;
        }
        self.engine()
    }

    // ========================================================================
    // TICK AND RENDER
    // ========================================================================

    pub fn on_tick(&self, tick: i64, delta_time: f32) {
        if let Some(engine) = self.ready() {
            engine.on_tick(tick, delta_time);
        }
    }

    pub fn prepare_frame(&self, partial_ticks: f32) {
        if let Some(engine) = self.ready() {
            engine.prepare_frame(partial_ticks);
        }
    }

    pub fn render_world(&self, frame: i64, partial_ticks: f32, view: &[f32], projection: &[f32]) {
        if let Some(engine) = self.ready() {
            engine.render_world(frame, partial_ticks, view, projection);
        }
    }

    pub fn composite_frame(&self) {
        if let Some(engine) = self.ready() {
            engine.composite_frame();
        }
    }

    // ========================================================================
    // MEMORY
    // ========================================================================

    /// Allocate a tracked block. Allowed while paused.
    pub fn allocate(&self, size: usize) -> VoidResult<NativeHandle> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(VoidError::InvalidArgument(format!(
                "invalid allocation size: {}",
                size
            )));
        }

        let engine = self.engine().ok_or(VoidError::NotInitialized)?;
        let address = engine.allocate(size)?;

        let slot = HandleSlot::new(address, size);
        self.handles.lock().insert(address, slot.clone());
        self.memory_usage.fetch_add(size as u64, Ordering::Relaxed);

        log::trace!("Allocated {} bytes at {:#x}", size, address);

        let owner: Weak<dyn HandleOwner> = self.self_ref.clone();
        Ok(NativeHandle::new(slot, owner))
    }

    /// Release a handle. Freed handles are ignored.
    pub fn free(&self, handle: &NativeHandle) {
        handle.close();
    }

    pub fn sync_memory(&self) {
        if let Some(engine) = self.ready() {
            engine.sync_memory();
            self.memory_usage.store(engine.memory_usage(), Ordering::Relaxed);
        }
    }

    /// Native memory usage as last tracked or synced
    pub fn native_memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn active_handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    pub fn spawn_entity(&self, id: i32, kind: &str, x: f64, y: f64, z: f64) {
        if let Some(engine) = self.ready() {
            engine.spawn_entity(id, kind, x, y, z);
        }
    }

    pub fn remove_entity(&self, id: i32) {
        if let Some(engine) = self.ready() {
            engine.remove_entity(id);
        }
    }

    pub fn update_entity(&self, id: i32, x: f64, y: f64, z: f64, yaw: f32, pitch: f32) {
        if let Some(engine) = self.ready() {
            engine.update_entity(id, x, y, z, yaw, pitch);
        }
    }

    /// `positions` must hold five values (x, y, z, yaw, pitch) per id
    pub fn batch_update_entities(&self, ids: &[i32], positions: &[f32]) -> VoidResult<()> {
        let Some(engine) = self.ready() else {
            return Ok(());
        };

        if ids.len() * 5 != positions.len() {
            return Err(VoidError::InvalidArgument(format!(
                "position array must have 5 values per entity ({} ids, {} values)",
                ids.len(),
                positions.len()
            )));
        }

        engine.batch_update_entities(ids, positions);
        Ok(())
    }

    // ========================================================================
    // CHUNKS
    // ========================================================================

    pub fn load_chunk(&self, x: i32, z: i32, data: &[u8]) {
        if let Some(engine) = self.ready() {
            engine.load_chunk(x, z, data);
        }
    }

    pub fn unload_chunk(&self, x: i32, z: i32) {
        if let Some(engine) = self.ready() {
            engine.unload_chunk(x, z);
        }
    }

    pub fn update_chunk(&self, x: i32, z: i32, data: &[u8]) {
        if let Some(engine) = self.ready() {
            engine.update_chunk(x, z, data);
        }
    }

    pub fn mark_chunk_dirty(&self, x: i32, z: i32) {
        if let Some(engine) = self.ready() {
            engine.mark_chunk_dirty(x, z);
        }
    }

    // ========================================================================
    // TEXTURES
    // ========================================================================

    /// Texture handle, 0 when not ready or refused
    pub fn upload_texture(&self, name: &str, data: &[u8], width: i32, height: i32, format: i32) -> u64 {
        match self.ready() {
            Some(engine) => engine.upload_texture(name, data, width, height, format),
            None => 0,
        }
    }

    pub fn unload_texture(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        if let Some(engine) = self.ready() {
            engine.unload_texture(handle);
        }
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    pub fn play_sound(&self, sound: &str, x: f32, y: f32, z: f32, volume: f32, pitch: f32) {
        if let Some(engine) = self.ready() {
            engine.play_sound(sound, x, y, z, volume, pitch);
        }
    }

    pub fn stop_sound(&self, sound: &str) {
        if let Some(engine) = self.ready() {
            engine.stop_sound(sound);
        }
    }

    pub fn update_listener(&self, x: f32, y: f32, z: f32, yaw: f32, pitch: f32) {
        if let Some(engine) = self.ready() {
            engine.update_listener(x, y, z, yaw, pitch);
        }
    }

    // ========================================================================
    // NETWORK
    // ========================================================================

    /// Compressed packet; the input unchanged when not ready
    pub fn compress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
        match self.ready() {
            Some(engine) => engine.compress_packet(data),
            None => Ok(data.to_vec()),
        }
    }

    /// Decompressed packet; the input unchanged when not ready
    pub fn decompress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
        match self.ready() {
            Some(engine) => engine.decompress_packet(data),
            None => Ok(data.to_vec()),
        }
    }

    pub fn predict_state(&self, tick: i64, state: &[u8]) {
        if let Some(engine) = self.ready() {
            engine.predict_state(tick, state);
        }
    }

    pub fn reconcile_state(&self, tick: i64, server_state: &[u8]) {
        if let Some(engine) = self.ready() {
            engine.reconcile_state(tick, server_state);
        }
    }

    // ========================================================================
    // DEBUG
    // ========================================================================

    pub fn debug_info(&self) -> String {
        match self.ready() {
            Some(engine) => engine.debug_info(),
            None => "Native engine not ready".to_string(),
        }
    }

    pub fn set_debug_flag(&self, flag: &str, value: bool) {
        if let Some(engine) = self.ready() {
            engine.set_debug_flag(flag, value);
        }
    }

    pub fn profile_data(&self) -> u64 {
        self.ready().map(|engine| engine.profile_data()).unwrap_or(0)
    }

    // ========================================================================
    // GETTERS
    // ========================================================================

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &E::Context {
        &self.context
    }

    pub fn callbacks(&self) -> &Arc<CallbackHandler> {
        &self.callbacks
    }
}

impl<E: NativeEngine> HandleOwner for NativeBridge<E> {
    fn release_slot(&self, slot: &HandleSlot) {
        let engine = self.engine.read();
        let mut freed = slot.freed.lock();
        if *freed {
            return;
        }
        *freed = true;

        if self.handles.lock().remove(&slot.address).is_none() {
            return;
        }

        if let Some(engine) = engine.as_ref() {
            engine.free(slot.address);
        }
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(slot.size as u64))
            });
        log::trace!("Freed {} bytes at {:#x}", slot.size, slot.address);
    }
}

impl<E: NativeEngine> Drop for NativeBridge<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
