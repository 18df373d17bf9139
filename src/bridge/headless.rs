//! # Headless Engine
//!
//! In-process implementation of the native catalog with no renderer or
//! audio device behind it. It keeps the bookkeeping a real engine would:
//! entities, chunk payloads in off-heap memory, textures in the asset
//! cache, playing sounds, the listener pose and a client prediction window.
//!
//! Chunk and texture payloads are held against the `mesh_budget_mb` and
//! `texture_budget_mb` budgets; uploads that would exceed them are refused.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::callback::{callback_type, CallbackHandler};
use super::codec::{self, Codec};
use super::NativeEngine;
use crate::error::VoidResult;
use crate::memory::{AssetCache, AssetType, VoidManager};
use crate::runtime::config::{CoreConfig, MemoryConfig};
use crate::util::ContentHash;

/// Client predictions kept for reconciliation
pub const PREDICTION_WINDOW: usize = 128;

/// Debug flag selecting lz4 for outgoing packets
pub const FAST_COMPRESSION_FLAG: &str = "fast_compression";

/// Allocation tag of chunk payloads
pub const CHUNK_TAG: &str = "chunk";

/// Allocation tag of blocks handed out through `allocate`
pub const NATIVE_TAG: &str = "native";

const MB: usize = 1024 * 1024;

/// What a [`HeadlessEngine`] needs from its host
#[derive(Clone)]
pub struct HeadlessContext {
    pub manager: Arc<VoidManager>,
    pub assets: Arc<AssetCache>,
}

impl HeadlessContext {
    pub fn new(manager: Arc<VoidManager>, assets: Arc<AssetCache>) -> Self {
        Self { manager, assets }
    }
}

/// Tracked entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub updates: u64,
}

struct ChunkSlot {
    address: usize,
    size: usize,
    dirty: bool,
}

/// Uploaded texture
#[derive(Debug, Clone, PartialEq)]
pub struct TextureInfo {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub format: i32,
    pub size: usize,
    pub hash: Option<ContentHash>,
}

impl TextureInfo {
    fn path(&self) -> String {
        texture_path(&self.name)
    }
}

/// Asset cache path of a texture
pub fn texture_path(name: &str) -> String {
    format!("texture:{}", name)
}

#[derive(Debug, Clone)]
struct PlayingSound {
    id: i32,
    name: String,
}

/// Listener pose
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Listener {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
}

/// Prediction outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    pub predicted: u64,
    pub confirmed: u64,
    pub mispredicted: u64,
    /// Server states for ticks outside the window
    pub unmatched: u64,
}

/// Bookkeeping engine behind the native catalog
pub struct HeadlessEngine {
    manager: Arc<VoidManager>,
    assets: Arc<AssetCache>,
    texture_budget: usize,
    mesh_budget: usize,
    callbacks: RwLock<Option<Arc<CallbackHandler>>>,

    initialized: AtomicBool,
    paused: AtomicBool,
    tick: AtomicI64,
    frames: AtomicU64,
    frame_open: AtomicBool,

    entities: RwLock<HashMap<i32, EntityState>>,
    chunks: RwLock<HashMap<(i32, i32), ChunkSlot>>,
    chunk_bytes: AtomicUsize,
    textures: RwLock<HashMap<u64, TextureInfo>>,
    next_texture: AtomicU64,
    texture_bytes: AtomicUsize,
    sounds: Mutex<Vec<PlayingSound>>,
    next_sound: AtomicI32,
    listener: Mutex<Listener>,

    predictions: Mutex<VecDeque<(i64, Vec<u8>)>>,
    prediction_stats: Mutex<PredictionStats>,
    debug_flags: RwLock<HashMap<String, bool>>,
}

impl HeadlessEngine {
    fn new(context: &HeadlessContext, memory: &MemoryConfig) -> Self {
        Self {
            manager: context.manager.clone(),
            assets: context.assets.clone(),
            texture_budget: budget_bytes(memory.texture_budget_mb),
            mesh_budget: budget_bytes(memory.mesh_budget_mb),
            callbacks: RwLock::new(None),
            initialized: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            tick: AtomicI64::new(0),
            frames: AtomicU64::new(0),
            frame_open: AtomicBool::new(false),
            entities: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            chunk_bytes: AtomicUsize::new(0),
            textures: RwLock::new(HashMap::new()),
            next_texture: AtomicU64::new(1),
            texture_bytes: AtomicUsize::new(0),
            sounds: Mutex::new(Vec::new()),
            next_sound: AtomicI32::new(1),
            listener: Mutex::new(Listener::default()),
            predictions: Mutex::new(VecDeque::with_capacity(PREDICTION_WINDOW)),
            prediction_stats: Mutex::new(PredictionStats::default()),
            debug_flags: RwLock::new(HashMap::new()),
        }
    }

    fn notify(&self, f: impl FnOnce(&CallbackHandler)) {
        let callbacks = self.callbacks.read().clone();
        if let Some(callbacks) = callbacks {
            f(&callbacks);
        }
    }

    fn packet_codec(&self) -> Codec {
        if self.debug_flag(FAST_COMPRESSION_FLAG) {
            Codec::Lz4
        } else {
            Codec::Zstd
        }
    }

    /// Copy `data` into a fresh chunk allocation, replacing any previous
    /// payload at (x, z)
    fn store_chunk(&self, x: i32, z: i32, data: &[u8]) -> bool {
        let mut chunks = self.chunks.write();

        let previous = chunks.get(&(x, z)).map(|c| c.size).unwrap_or(0);
        let projected = self.chunk_bytes.load(Ordering::Relaxed) - previous + data.len();
        if projected > self.mesh_budget {
            log::warn!(
                "Chunk ({}, {}) refused: {} bytes over mesh budget",
                x,
                z,
                projected - self.mesh_budget
            );
            return false;
        }

        let address = match self.manager.allocate(data.len(), CHUNK_TAG) {
            Ok(address) => address,
            Err(e) => {
                log::error!("Failed to store chunk ({}, {}): {}", x, z, e);
                return false;
            }
        };

        // SAFETY: fresh allocation of at least data.len() bytes
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }

        let slot = ChunkSlot {
            address,
            size: data.len(),
            dirty: false,
        };
        if let Some(old) = chunks.insert((x, z), slot) {
            self.release_chunk(&old);
        }
        self.chunk_bytes.fetch_add(data.len(), Ordering::Relaxed);
        true
    }

    fn release_chunk(&self, slot: &ChunkSlot) {
        if let Err(e) = self.manager.free(slot.address) {
            log::warn!("Chunk free failed: {}", e);
        }
        self.chunk_bytes.fetch_sub(slot.size, Ordering::Relaxed);
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn current_tick(&self) -> i64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Frames composited
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn entity(&self, id: i32) -> Option<EntityState> {
        self.entities.read().get(&id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes.load(Ordering::Relaxed)
    }

    /// Payload of chunk (x, z)
    pub fn chunk_data(&self, x: i32, z: i32) -> Option<Vec<u8>> {
        let chunks = self.chunks.read();
        let slot = chunks.get(&(x, z))?;
        // SAFETY: the slot's allocation lives while the chunks lock is held
        let bytes = unsafe { std::slice::from_raw_parts(slot.address as *const u8, slot.size) };
        Some(bytes.to_vec())
    }

    pub fn is_chunk_dirty(&self, x: i32, z: i32) -> bool {
        self.chunks.read().get(&(x, z)).map(|c| c.dirty).unwrap_or(false)
    }

    pub fn texture(&self, handle: u64) -> Option<TextureInfo> {
        self.textures.read().get(&handle).cloned()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.read().len()
    }

    pub fn texture_bytes(&self) -> usize {
        self.texture_bytes.load(Ordering::Relaxed)
    }

    /// Names of playing sounds, one per instance
    pub fn playing_sounds(&self) -> Vec<String> {
        self.sounds.lock().iter().map(|s| s.name.clone()).collect()
    }

    pub fn listener(&self) -> Listener {
        *self.listener.lock()
    }

    pub fn prediction_stats(&self) -> PredictionStats {
        *self.prediction_stats.lock()
    }

    pub fn pending_predictions(&self) -> usize {
        self.predictions.lock().len()
    }

    pub fn debug_flag(&self, flag: &str) -> bool {
        self.debug_flags.read().get(flag).copied().unwrap_or(false)
    }
}

fn budget_bytes(mb: u64) -> usize {
    usize::try_from(mb).unwrap_or(usize::MAX / MB).saturating_mul(MB)
}

impl NativeEngine for HeadlessEngine {
    type Context = HeadlessContext;

    fn create(context: &HeadlessContext, config: &[u8]) -> VoidResult<Self> {
        let config = CoreConfig::from_bytes(config)?;
        log::info!("Headless engine created");
        Ok(Self::new(context, &config.memory))
    }

    fn destroy(self) {
        log::debug!("Headless engine destroyed");
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    fn initialize(&mut self, hardware_info: &[u8], gpu_caps: &[u8], config: &[u8]) -> VoidResult<()> {
        if !config.is_empty() {
            let config = CoreConfig::from_bytes(config)?;
            self.texture_budget = budget_bytes(config.memory.texture_budget_mb);
            self.mesh_budget = budget_bytes(config.memory.mesh_budget_mb);
        }

        log::debug!(
            "Headless engine initializing (hardware info {} bytes, gpu caps {} bytes)",
            hardware_info.len(),
            gpu_caps.len()
        );
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&mut self) {
        let chunks: Vec<ChunkSlot> = self.chunks.write().drain().map(|(_, c)| c).collect();
        for chunk in &chunks {
            self.release_chunk(chunk);
        }

        let textures: Vec<TextureInfo> = self.textures.write().drain().map(|(_, t)| t).collect();
        for texture in &textures {
            self.assets.release(&texture.path());
        }
        self.texture_bytes.store(0, Ordering::Relaxed);

        self.entities.write().clear();
        self.sounds.lock().clear();
        self.predictions.lock().clear();
        *self.callbacks.write() = None;
        self.initialized.store(false, Ordering::Release);

        log::info!(
            "Headless engine shut down ({} chunks, {} textures released)",
            chunks.len(),
            textures.len()
        );
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        log::debug!("Headless engine paused");
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        log::debug!("Headless engine resumed");
    }

    // ========================================================================
    // FRAME
    // ========================================================================

    /// Advances the tick and re-announces dirty chunks
    fn on_tick(&self, tick: i64, _delta_time: f32) {
        self.tick.store(tick, Ordering::Relaxed);

        let rebuilt: Vec<(i32, i32, usize)> = {
            let mut chunks = self.chunks.write();
            chunks
                .iter_mut()
                .filter(|(_, c)| c.dirty)
                .map(|(&(x, z), c)| {
                    c.dirty = false;
                    (x, z, c.address)
                })
                .collect()
        };

        if !rebuilt.is_empty() {
            log::trace!("Tick {}: {} dirty chunks rebuilt", tick, rebuilt.len());
            self.notify(|cb| {
                for (x, z, address) in rebuilt {
                    cb.send_chunk_ready(x, z, address as i64);
                }
            });
        }
    }

    fn prepare_frame(&self, _partial_ticks: f32) {
        self.frame_open.store(true, Ordering::Release);
    }

    fn render_world(&self, frame: i64, _partial_ticks: f32, view: &[f32], projection: &[f32]) {
        if view.len() < 16 || projection.len() < 16 {
            log::warn!("Frame {}: matrices must have 16 elements", frame);
        }
    }

    fn composite_frame(&self) {
        if !self.frame_open.swap(false, Ordering::AcqRel) {
            log::trace!("Composite without prepared frame");
            return;
        }

        let frame = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.notify(|cb| cb.send_simple(callback_type::FRAME_READY, frame as i32));
    }

    // ========================================================================
    // MEMORY
    // ========================================================================

    fn allocate(&self, size: usize) -> VoidResult<usize> {
        self.manager.allocate(size, NATIVE_TAG)
    }

    fn free(&self, address: usize) {
        if let Err(e) = self.manager.free(address) {
            log::warn!("Native free failed: {}", e);
        }
    }

    fn sync_memory(&self) {
        let drained = self.manager.collect_garbage();
        log::trace!("Memory synced ({} deferred frees drained)", drained);
    }

    fn memory_usage(&self) -> u64 {
        self.manager.allocated_bytes() as u64
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    fn spawn_entity(&self, id: i32, kind: &str, x: f64, y: f64, z: f64) {
        let state = EntityState {
            kind: kind.to_string(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
            updates: 0,
        };
        if self.entities.write().insert(id, state).is_some() {
            log::debug!("Entity {} respawned as {}", id, kind);
        }
    }

    fn remove_entity(&self, id: i32) {
        if self.entities.write().remove(&id).is_some() {
            self.notify(|cb| cb.send_simple(callback_type::ENTITY_REMOVED, id));
        }
    }

    fn update_entity(&self, id: i32, x: f64, y: f64, z: f64, yaw: f32, pitch: f32) {
        let mut entities = self.entities.write();
        match entities.get_mut(&id) {
            Some(entity) => {
                entity.x = x;
                entity.y = y;
                entity.z = z;
                entity.yaw = yaw;
                entity.pitch = pitch;
                entity.updates += 1;
            }
            None => log::trace!("Update for unknown entity {}", id),
        }
    }

    fn batch_update_entities(&self, ids: &[i32], positions: &[f32]) {
        let mut entities = self.entities.write();
        for (id, p) in ids.iter().zip(positions.chunks_exact(5)) {
            if let Some(entity) = entities.get_mut(id) {
                entity.x = p[0] as f64;
                entity.y = p[1] as f64;
                entity.z = p[2] as f64;
                entity.yaw = p[3];
                entity.pitch = p[4];
                entity.updates += 1;
            }
        }
    }

    // ========================================================================
    // CHUNKS
    // ========================================================================

    fn load_chunk(&self, x: i32, z: i32, data: &[u8]) {
        if data.is_empty() {
            log::warn!("Chunk ({}, {}) has no data", x, z);
            return;
        }
        if self.store_chunk(x, z, data) {
            log::trace!("Chunk ({}, {}) loaded, {} bytes", x, z, data.len());
            self.notify(|cb| {
                let address = self.chunks.read().get(&(x, z)).map(|c| c.address).unwrap_or(0);
                cb.send_chunk_ready(x, z, address as i64);
            });
        }
    }

    fn unload_chunk(&self, x: i32, z: i32) {
        let removed = self.chunks.write().remove(&(x, z));
        if let Some(slot) = removed {
            self.release_chunk(&slot);
        }
    }

    fn update_chunk(&self, x: i32, z: i32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.store_chunk(x, z, data) {
            self.mark_chunk_dirty(x, z);
        }
    }

    fn mark_chunk_dirty(&self, x: i32, z: i32) {
        if let Some(chunk) = self.chunks.write().get_mut(&(x, z)) {
            chunk.dirty = true;
        }
    }

    // ========================================================================
    // TEXTURES
    // ========================================================================

    fn upload_texture(&self, name: &str, data: &[u8], width: i32, height: i32, format: i32) -> u64 {
        if data.is_empty() || width <= 0 || height <= 0 {
            log::warn!("Texture {} rejected: {}x{}, {} bytes", name, width, height, data.len());
            return 0;
        }

        let mut textures = self.textures.write();

        let replaced: Vec<u64> = textures
            .iter()
            .filter(|(_, t)| t.name == name)
            .map(|(&h, _)| h)
            .collect();
        let replaced_bytes: usize = replaced.iter().filter_map(|h| textures.get(h)).map(|t| t.size).sum();

        let projected = self.texture_bytes.load(Ordering::Relaxed) - replaced_bytes + data.len();
        if projected > self.texture_budget {
            log::warn!("Texture {} refused: over texture budget", name);
            return 0;
        }

        let asset = self.assets.store(&texture_path(name), data, AssetType::Texture);
        if !asset.is_valid() {
            return 0;
        }

        // The cache path now refers to the new content; replaced handles
        // gave up their reference in the store above
        for handle in replaced {
            textures.remove(&handle);
        }
        self.texture_bytes.store(projected, Ordering::Relaxed);

        let handle = self.next_texture.fetch_add(1, Ordering::Relaxed);
        textures.insert(
            handle,
            TextureInfo {
                name: name.to_string(),
                width,
                height,
                format,
                size: data.len(),
                hash: asset.hash(),
            },
        );

        log::debug!("Texture {} uploaded ({}x{}) as handle {}", name, width, height, handle);
        handle
    }

    fn unload_texture(&self, handle: u64) {
        let removed = self.textures.write().remove(&handle);
        match removed {
            Some(texture) => {
                self.assets.release(&texture.path());
                self.texture_bytes.fetch_sub(texture.size, Ordering::Relaxed);
            }
            None => log::debug!("Unload of unknown texture handle {}", handle),
        }
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    fn play_sound(&self, sound: &str, x: f32, y: f32, z: f32, volume: f32, pitch: f32) {
        let id = self.next_sound.fetch_add(1, Ordering::Relaxed);
        self.sounds.lock().push(PlayingSound {
            id,
            name: sound.to_string(),
        });
        log::trace!(
            "Sound {} #{} at ({}, {}, {}) volume {} pitch {}",
            sound,
            id,
            x,
            y,
            z,
            volume,
            pitch
        );
    }

    /// Stops every instance of `sound`, announcing each as complete
    fn stop_sound(&self, sound: &str) {
        let stopped: Vec<i32> = {
            let mut sounds = self.sounds.lock();
            let ids = sounds.iter().filter(|s| s.name == sound).map(|s| s.id).collect();
            sounds.retain(|s| s.name != sound);
            ids
        };

        if !stopped.is_empty() {
            self.notify(|cb| {
                for id in stopped {
                    cb.send_simple(callback_type::SOUND_COMPLETE, id);
                }
            });
        }
    }

    fn update_listener(&self, x: f32, y: f32, z: f32, yaw: f32, pitch: f32) {
        *self.listener.lock() = Listener { x, y, z, yaw, pitch };
    }

    // ========================================================================
    // NETWORK
    // ========================================================================

    fn compress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
        codec::compress(data, self.packet_codec())
    }

    fn decompress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
        codec::decompress(data)
    }

    fn predict_state(&self, tick: i64, state: &[u8]) {
        let mut predictions = self.predictions.lock();
        if predictions.len() == PREDICTION_WINDOW {
            predictions.pop_front();
        }
        predictions.push_back((tick, state.to_vec()));
        self.prediction_stats.lock().predicted += 1;
    }

    /// Compares the server state with the prediction for `tick` and drops
    /// every prediction up to it
    fn reconcile_state(&self, tick: i64, server_state: &[u8]) {
        let mut predictions = self.predictions.lock();
        let mut stats = self.prediction_stats.lock();

        match predictions.iter().find(|(t, _)| *t == tick) {
            Some((_, predicted)) if predicted.as_slice() == server_state => stats.confirmed += 1,
            Some(_) => {
                stats.mispredicted += 1;
                log::debug!("Misprediction at tick {}", tick);
            }
            None => stats.unmatched += 1,
        }

        predictions.retain(|(t, _)| *t > tick);
    }

    // ========================================================================
    // DEBUG
    // ========================================================================

    fn debug_info(&self) -> String {
        let stats = self.prediction_stats();
        format!(
            "Headless engine | tick {} | frames {} | entities {} | chunks {} ({}) | textures {} ({}) | sounds {} | predictions {}/{} confirmed | memory {}",
            self.current_tick(),
            self.frames(),
            self.entity_count(),
            self.chunk_count(),
            crate::diagnostics::format_bytes(self.chunk_bytes() as u64),
            self.texture_count(),
            crate::diagnostics::format_bytes(self.texture_bytes() as u64),
            self.sounds.lock().len(),
            stats.confirmed,
            stats.confirmed + stats.mispredicted,
            crate::diagnostics::format_bytes(self.memory_usage())
        )
    }

    fn set_debug_flag(&self, flag: &str, value: bool) {
        self.debug_flags.write().insert(flag.to_string(), value);
        log::debug!("Debug flag {} = {}", flag, value);
    }

    /// Frames composited
    fn profile_data(&self) -> u64 {
        self.frames()
    }

    fn register_callbacks(&self, callbacks: Arc<CallbackHandler>) {
        *self.callbacks.write() = Some(callbacks);
        log::debug!("Headless engine callbacks registered");
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        if self.chunk_count() > 0 || self.texture_count() > 0 {
            NativeEngine::shutdown(self);
        }
    }
}
