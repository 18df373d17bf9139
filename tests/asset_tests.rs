//! # Asset Cache Tests
//!
//! Deduplication, reference counting and release of cached assets.

use std::sync::{Arc, Barrier};

use void_core::memory::{align_up, AssetCache, AssetHandle, AssetType, VoidManager};
use void_core::runtime::MemoryConfig;
use void_core::util::ContentHash;

fn cache(max_mb: u64) -> Arc<AssetCache> {
    let _ = env_logger::builder().is_test(true).try_init();
    AssetCache::new(VoidManager::new(&MemoryConfig::with_max_mb(max_mb)))
}

fn texture(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[cfg(test)]
mod dedup_tests {
    use super::*;

    #[test]
    fn test_identical_content_shares_allocation() {
        let cache = cache(16);
        let bytes = texture(1, 1000);

        let a = cache.store("tex/a.png", &bytes, AssetType::Texture);
        let b = cache.store("tex/b.png", &bytes, AssetType::Texture);

        assert!(a.is_valid());
        assert_eq!(a.address(), b.address());
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.path_count(), 2);
        assert_eq!(cache.deduplication_ratio(), 0.5);
        assert_eq!(cache.manager().active_allocations(), 1);

        let info = cache.info(&a.hash().unwrap()).unwrap();
        assert_eq!(info.ref_count, 2);
        assert_eq!(info.size, 1000);
        assert_eq!(info.asset_type, AssetType::Texture);

        let stats = cache.stats();
        assert_eq!(stats.total_assets_loaded, 2);
        assert_eq!(stats.total_deduplicated, 1);
        assert_eq!(stats.bytes_stored, 1000);
        assert_eq!(stats.bytes_saved, 1000);
    }

    #[test]
    fn test_release_both_paths_frees() {
        let cache = cache(16);
        let bytes = texture(2, 1000);
        let handle = cache.store("tex/a.png", &bytes, AssetType::Texture);
        cache.store("tex/b.png", &bytes, AssetType::Texture);
        let manager = cache.manager().clone();
        assert_eq!(manager.allocated_bytes(), align_up(1000));

        cache.release("tex/a.png");
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.info(&handle.hash().unwrap()).unwrap().ref_count, 1);
        assert!(manager.contains(handle.address()));

        cache.release("tex/b.png");
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.path_count(), 0);
        assert!(!manager.contains(handle.address()));
        assert_eq!(manager.allocated_bytes(), 0);
        assert_eq!(cache.stats().bytes_stored, 0);
    }

    #[test]
    fn test_distinct_content_separate_entries() {
        let cache = cache(16);
        let a = cache.store("a", &texture(1, 64), AssetType::Model);
        let b = cache.store("b", &texture(2, 64), AssetType::Model);

        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.address(), b.address());
        assert_eq!(cache.cache_size(), 2);
        assert_eq!(cache.deduplication_ratio(), 0.0);
    }

    #[test]
    fn test_restore_same_path_same_content() {
        let cache = cache(16);
        let bytes = texture(3, 256);

        let first = cache.store("sound/click.ogg", &bytes, AssetType::Sound);
        let second = cache.store("sound/click.ogg", &bytes, AssetType::Sound);

        assert_eq!(first, second);
        assert_eq!(cache.info(&first.hash().unwrap()).unwrap().ref_count, 1);
        assert_eq!(cache.stats().total_deduplicated, 1);

        cache.release("sound/click.ogg");
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_restore_same_path_new_content() {
        let cache = cache(16);

        let old = cache.store("shader/main", &texture(4, 128), AssetType::Shader);
        let new = cache.store("shader/main", &texture(5, 128), AssetType::Shader);

        assert_ne!(old.hash(), new.hash());
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.path_count(), 1);
        assert!(cache.info(&old.hash().unwrap()).is_none());
        assert_eq!(cache.get("shader/main"), Some(new));
    }
}

#[cfg(test)]
mod lookup_tests {
    use super::*;

    #[test]
    fn test_with_bytes_reads_stored_copy() {
        let cache = cache(16);
        let mut bytes = texture(6, 300);
        cache.store("font/default", &bytes, AssetType::Font);

        bytes.fill(0);
        let stored = cache.with_bytes("font/default", |b| b.to_vec()).unwrap();
        assert_eq!(stored, texture(6, 300));
        assert!(cache.with_bytes("font/missing", |b| b.len()).is_none());
    }

    #[test]
    fn test_with_bytes_can_reenter_cache() {
        let cache = cache(16);
        let bytes = texture(14, 512);
        let original = cache.store("font/a", &bytes, AssetType::Font);
        let manager = cache.manager().clone();

        let copied = cache
            .with_bytes("font/a", |stored| {
                let copy = cache.store("font/b", &stored[..256], AssetType::Font);
                cache.release("font/a");
                assert!(cache.get("font/a").is_none());
                assert!(manager.contains(original.address()));
                (copy, stored.to_vec())
            })
            .unwrap();

        assert_eq!(copied.1, bytes);
        assert!(copied.0.is_valid());
        assert!(!manager.contains(original.address()));
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.with_bytes("font/b", |b| b.to_vec()), Some(bytes[..256].to_vec()));
    }

    #[test]
    fn test_get_by_hash() {
        let cache = cache(16);
        let bytes = texture(7, 90);
        let handle = cache.store("x", &bytes, AssetType::Other);

        assert_eq!(cache.get_by_hash(&ContentHash::of(&bytes)), Some(handle));
        assert!(cache.get_by_hash(&ContentHash::of(b"other")).is_none());
    }

    #[test]
    fn test_stale_path_dropped_on_lookup() {
        let cache = cache(16);
        let handle = cache.store("tex/gone.png", &texture(8, 100), AssetType::Texture);

        cache.release_handle(&handle);
        assert_eq!(cache.cache_size(), 0);
        assert!(cache.contains("tex/gone.png"));

        assert!(cache.get("tex/gone.png").is_none());
        assert!(!cache.contains("tex/gone.png"));
    }

    #[test]
    fn test_explicit_retain() {
        let cache = cache(16);
        let handle = cache.store("model/a", &texture(9, 500), AssetType::Model);

        assert!(cache.retain(&handle));
        cache.release("model/a");
        assert_eq!(cache.cache_size(), 1);

        cache.release_handle(&handle);
        assert_eq!(cache.cache_size(), 0);
        assert!(!cache.retain(&handle));
        assert!(!cache.retain(&AssetHandle::INVALID));
    }
}

#[cfg(test)]
mod capacity_tests {
    use super::*;

    #[test]
    fn test_store_fails_gracefully_when_exhausted() {
        let cache = cache(1);
        let big = vec![1u8; 2 * 1024 * 1024];

        let handle = cache.store("tex/huge.png", &big, AssetType::Texture);
        assert!(!handle.is_valid());
        assert_eq!(handle, AssetHandle::INVALID);
        assert!(!cache.contains("tex/huge.png"));
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_cached_data_served_under_pressure() {
        let cache = cache(1);
        let small = texture(10, 1000);
        cache.store("tex/small.png", &small, AssetType::Texture);

        let refused = cache.store("tex/big.png", &vec![2u8; 1024 * 1024], AssetType::Texture);
        assert!(!refused.is_valid());

        assert_eq!(cache.with_bytes("tex/small.png", |b| b.to_vec()), Some(small));
    }

    #[test]
    fn test_preload_counts_stored() {
        let cache = cache(16);
        let paths = ["a.png", "b.png", "missing.png", "c.png"];

        let stored = cache.preload(
            paths,
            |path| (!path.starts_with("missing")).then(|| path.as_bytes().to_vec()),
            AssetType::Texture,
        );

        assert_eq!(stored, 3);
        assert_eq!(cache.path_count(), 3);
    }

    #[test]
    fn test_clear_frees_everything() {
        let cache = cache(16);
        let bytes = texture(11, 2000);
        cache.store("a", &bytes, AssetType::Other);
        cache.store("b", &bytes, AssetType::Other);
        cache.store("c", &texture(12, 2000), AssetType::Other);

        cache.clear();
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.path_count(), 0);
        assert_eq!(cache.manager().allocated_bytes(), 0);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_stores_of_same_content() {
        let cache = cache(16);
        let bytes = Arc::new(texture(13, 4096));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let bytes = bytes.clone();
                std::thread::spawn(move || {
                    cache.store(&format!("tex/{}.png", i), &bytes, AssetType::Texture)
                })
            })
            .collect();

        let handles: Vec<AssetHandle> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(handles.iter().all(|h| h.address() == handles[0].address()));
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.info(&ContentHash::of(&bytes)).unwrap().ref_count, 8);

        let releases: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.release(&format!("tex/{}.png", i)))
            })
            .collect();
        for release in releases {
            release.join().unwrap();
        }

        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.manager().allocated_bytes(), 0);
    }

    #[test]
    fn test_concurrent_stores_of_same_path() {
        let cache = cache(16);

        for round in 0..200u32 {
            let bytes = Arc::new(texture(round as u8, 1024 + round as usize));
            let barrier = Arc::new(Barrier::new(8));

            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    let bytes = bytes.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        cache.store("tex/same.png", &bytes, AssetType::Texture)
                    })
                })
                .collect();
            for thread in threads {
                assert!(thread.join().unwrap().is_valid());
            }

            let info = cache.info(&ContentHash::of(&bytes)).unwrap();
            assert_eq!(info.ref_count, 1, "round {}", round);

            cache.release("tex/same.png");
            assert_eq!(cache.cache_size(), 0, "round {}", round);
            assert_eq!(cache.manager().allocated_bytes(), 0, "round {}", round);
        }
    }
}
