//! # Asset Cache
//!
//! Content-addressable storage for textures, models, sounds and other
//! payloads in off-heap memory.
//!
//! Payloads are hashed with SHA-256. Identical content stored under several
//! paths shares one allocation and one reference count. An entry leaves the
//! cache when its count reaches zero, and its allocation is freed as soon as
//! no reader still holds it. A path holds at most one reference.
//!
//! Reference counts only change while the entries map is write-locked, so a
//! concurrent `store` and `release` of the same content cannot resurrect an
//! entry that is being freed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::void_manager::VoidManager;
use crate::util::hash::ContentHash;

/// Asset categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetType {
    Texture,
    Model,
    Sound,
    Shader,
    Font,
    Other,
}

impl AssetType {
    pub const ALL: [AssetType; 6] = [
        AssetType::Texture,
        AssetType::Model,
        AssetType::Sound,
        AssetType::Shader,
        AssetType::Font,
        AssetType::Other,
    ];

    /// Allocation tag for payloads of this type
    pub fn tag(&self) -> &'static str {
        match self {
            AssetType::Texture => "asset:texture",
            AssetType::Model => "asset:model",
            AssetType::Sound => "asset:sound",
            AssetType::Shader => "asset:shader",
            AssetType::Font => "asset:font",
            AssetType::Other => "asset:other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag()["asset:".len()..])
    }
}

/// Reference to stored content. Invalid handles have no hash and address 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetHandle {
    hash: Option<ContentHash>,
    address: usize,
    size: usize,
    asset_type: AssetType,
}

impl AssetHandle {
    /// The handle returned when a store fails
    pub const INVALID: AssetHandle = AssetHandle {
        hash: None,
        address: 0,
        size: 0,
        asset_type: AssetType::Other,
    };

    pub fn is_valid(&self) -> bool {
        self.address != 0 && self.hash.is_some()
    }

    pub fn hash(&self) -> Option<ContentHash> {
        self.hash
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn asset_type(&self) -> AssetType {
        self.asset_type
    }
}

struct EntryState {
    ref_count: u32,
    last_access: Instant,
}

/// Cached content. The backing allocation is freed when the last clone of
/// the entry drops, so a reader holding one keeps the bytes alive.
struct AssetEntry {
    hash: ContentHash,
    address: usize,
    size: usize,
    asset_type: AssetType,
    created_at: Instant,
    state: Mutex<EntryState>,
    manager: Arc<VoidManager>,
}

impl AssetEntry {
    fn handle(&self) -> AssetHandle {
        AssetHandle {
            hash: Some(self.hash),
            address: self.address,
            size: self.size,
            asset_type: self.asset_type,
        }
    }

    fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    fn retain(&self) -> u32 {
        let mut state = self.state.lock();
        state.ref_count += 1;
        state.last_access = Instant::now();
        state.ref_count
    }

    fn release(&self) -> u32 {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        state.ref_count
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation is freed only when `self` drops
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.size) }
    }
}

impl Drop for AssetEntry {
    fn drop(&mut self) {
        // Manager shutdown already released every allocation
        if self.manager.is_shut_down() {
            return;
        }
        if let Err(e) = self.manager.free(self.address) {
            log::warn!("Asset {} free failed: {}", self.hash, e);
        }
        log::debug!("Asset freed: {} ({} bytes)", self.hash, self.size);
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetStats {
    pub total_assets_loaded: u64,
    pub total_deduplicated: u64,
    pub bytes_stored: u64,
    pub bytes_saved: u64,
    pub cache_size: usize,
    pub path_count: usize,
    pub deduplication_ratio: f64,
}

/// Snapshot of one cached entry
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub hash: ContentHash,
    pub size: usize,
    pub asset_type: AssetType,
    pub ref_count: u32,
    pub age_secs: f64,
    pub idle_secs: f64,
}

/// Content-addressable asset cache over a [`VoidManager`]
pub struct AssetCache {
    manager: Arc<VoidManager>,
    entries: RwLock<HashMap<ContentHash, Arc<AssetEntry>>>,
    paths: RwLock<HashMap<String, ContentHash>>,
    total_loaded: AtomicU64,
    total_deduplicated: AtomicU64,
    bytes_stored: AtomicU64,
    bytes_saved: AtomicU64,
}

impl AssetCache {
    pub fn new(manager: Arc<VoidManager>) -> Arc<Self> {
        log::debug!("Asset cache created");
        Arc::new(Self {
            manager,
            entries: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            total_loaded: AtomicU64::new(0),
            total_deduplicated: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        })
    }

    // ========================================================================
    // STORE
    // ========================================================================

    /// Store `data` under `path`. Returns [`AssetHandle::INVALID`] if the
    /// payload cannot be allocated.
    pub fn store(&self, path: &str, data: &[u8], asset_type: AssetType) -> AssetHandle {
        self.total_loaded.fetch_add(1, Ordering::Relaxed);
        let hash = ContentHash::of(data);

        // Same path, same content: already holds its reference
        if self.paths.read().get(path) == Some(&hash) {
            if let Some(entry) = self.entries.read().get(&hash).cloned() {
                entry.touch();
                self.record_dedup(path, data.len());
                return entry.handle();
            }
        }

        // Lock order: entries, then paths. The path mapping changes under
        // the same critical section as the reference it stands for.
        let (handle, previous) = {
            let mut entries = self.entries.write();
            let mut paths = self.paths.write();
            let previous = paths.get(path).copied();

            if let Some(entry) = entries.get(&hash) {
                if previous != Some(hash) {
                    entry.retain();
                } else {
                    entry.touch();
                }
                self.record_dedup(path, data.len());
                let handle = entry.handle();
                paths.insert(path.to_string(), hash);
                (handle, previous)
            } else {
                let address = match self.manager.allocate(data.len(), asset_type.tag()) {
                    Ok(address) => address,
                    Err(e) => {
                        log::error!(
                            "Failed to store asset {} ({} bytes): {}",
                            path,
                            data.len(),
                            e
                        );
                        return AssetHandle::INVALID;
                    }
                };

                // SAFETY: fresh allocation of at least data.len() bytes
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
                }

                let now = Instant::now();
                let entry = Arc::new(AssetEntry {
                    hash,
                    address,
                    size: data.len(),
                    asset_type,
                    created_at: now,
                    state: Mutex::new(EntryState {
                        ref_count: 1,
                        last_access: now,
                    }),
                    manager: self.manager.clone(),
                });
                let handle = entry.handle();
                entries.insert(hash, entry);
                paths.insert(path.to_string(), hash);
                self.bytes_stored.fetch_add(data.len() as u64, Ordering::Relaxed);

                log::debug!(
                    "Asset stored: {} ({} bytes) at {:#x}",
                    path,
                    data.len(),
                    address
                );
                (handle, previous)
            }
        };

        if let Some(previous) = previous.filter(|previous| *previous != hash) {
            log::debug!("Asset path {} re-stored with new content", path);
            self.release_hash(&previous);
        }

        handle
    }

    fn record_dedup(&self, path: &str, len: usize) {
        self.total_deduplicated.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved.fetch_add(len as u64, Ordering::Relaxed);
        log::debug!("Asset deduplicated: {} ({} bytes saved)", path, len);
    }

    /// Store each path whose provider returns data. Returns how many stored.
    pub fn preload<I, S, F>(&self, paths: I, mut provider: F, asset_type: AssetType) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&str) -> Option<Vec<u8>>,
    {
        let mut count = 0;

        for path in paths {
            let path = path.as_ref();
            if let Some(data) = provider(path) {
                if self.store(path, &data, asset_type).is_valid() {
                    count += 1;
                }
            }
        }

        log::info!("Preloaded {} {} assets", count, asset_type);
        count
    }

    /// Take one more reference on the handle's content
    pub fn retain(&self, handle: &AssetHandle) -> bool {
        let Some(hash) = handle.hash else {
            return false;
        };

        let entries = self.entries.write();
        match entries.get(&hash) {
            Some(entry) => {
                entry.retain();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Handle for `path`; a mapping to vanished content is dropped
    pub fn get(&self, path: &str) -> Option<AssetHandle> {
        let hash = self.paths.read().get(path).copied()?;

        let entry = self.entries.read().get(&hash).cloned();
        match entry {
            Some(entry) => {
                entry.touch();
                Some(entry.handle())
            }
            None => {
                let mut paths = self.paths.write();
                if paths.get(path) == Some(&hash) {
                    paths.remove(path);
                    log::debug!("Dropped stale asset path {}", path);
                }
                None
            }
        }
    }

    pub fn get_by_hash(&self, hash: &ContentHash) -> Option<AssetHandle> {
        let entry = self.entries.read().get(hash).cloned()?;
        entry.touch();
        Some(entry.handle())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.read().contains_key(path)
    }

    /// Run `f` over the stored bytes of `path`. The bytes stay valid while
    /// `f` runs, even if `f` releases the path. No cache lock is held, so `f`
    /// may call back into the cache.
    pub fn with_bytes<R>(&self, path: &str, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let hash = self.paths.read().get(path).copied()?;
        let entry = self.entries.read().get(&hash).cloned()?;
        entry.touch();

        Some(f(entry.bytes()))
    }

    /// Details of the entry holding `hash`
    pub fn info(&self, hash: &ContentHash) -> Option<AssetInfo> {
        let entry = self.entries.read().get(hash).cloned()?;
        let state = entry.state.lock();
        Some(AssetInfo {
            hash: entry.hash,
            size: entry.size,
            asset_type: entry.asset_type,
            ref_count: state.ref_count,
            age_secs: entry.created_at.elapsed().as_secs_f64(),
            idle_secs: state.last_access.elapsed().as_secs_f64(),
        })
    }

    // ========================================================================
    // RELEASE
    // ========================================================================

    /// Drop the reference held by `path`. Unknown paths are ignored.
    pub fn release(&self, path: &str) {
        let Some(hash) = self.paths.write().remove(path) else {
            log::trace!("Release of unknown asset path {}", path);
            return;
        };

        self.release_hash(&hash);
    }

    /// Drop one reference on the handle's content without touching paths
    pub fn release_handle(&self, handle: &AssetHandle) {
        if let Some(hash) = handle.hash.filter(|_| handle.is_valid()) {
            self.release_hash(&hash);
        }
    }

    fn release_hash(&self, hash: &ContentHash) {
        let freed = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get(hash) else {
                return;
            };

            if entry.release() > 0 {
                return;
            }
            entries.remove(hash)
        };

        if let Some(entry) = freed {
            self.bytes_stored.fetch_sub(entry.size as u64, Ordering::Relaxed);
        }
    }

    /// Free every entry regardless of reference counts
    pub fn clear(&self) {
        let drained: Vec<Arc<AssetEntry>> = {
            let mut entries = self.entries.write();
            self.paths.write().clear();
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        drop(drained);
        self.bytes_stored.store(0, Ordering::Relaxed);

        log::info!("Asset cache cleared ({} entries)", count);
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn cache_size(&self) -> usize {
        self.entries.read().len()
    }

    pub fn path_count(&self) -> usize {
        self.paths.read().len()
    }

    /// Deduplicated stores over all stores
    pub fn deduplication_ratio(&self) -> f64 {
        let loaded = self.total_loaded.load(Ordering::Relaxed);
        if loaded == 0 {
            return 0.0;
        }
        self.total_deduplicated.load(Ordering::Relaxed) as f64 / loaded as f64
    }

    pub fn stats(&self) -> AssetStats {
        AssetStats {
            total_assets_loaded: self.total_loaded.load(Ordering::Relaxed),
            total_deduplicated: self.total_deduplicated.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            cache_size: self.cache_size(),
            path_count: self.path_count(),
            deduplication_ratio: self.deduplication_ratio(),
        }
    }

    pub fn manager(&self) -> &Arc<VoidManager> {
        &self.manager
    }
}
