//! # Native Bridge Tests
//!
//! Readiness gating, lifecycle, link verification, handles and callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use void_core::bridge::{
    callback_type, CallbackData, CallbackHandler, HeadlessContext, HeadlessEngine, NativeBridge,
    NativeEngine,
};
use void_core::memory::{AssetCache, VoidManager};
use void_core::runtime::MemoryConfig;
use void_core::{VoidError, VoidResult};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    bridge: Arc<NativeBridge<HeadlessEngine>>,
    manager: Arc<VoidManager>,
    callbacks: Arc<CallbackHandler>,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let manager = VoidManager::new(&MemoryConfig::with_max_mb(16));
    let assets = AssetCache::new(manager.clone());
    let callbacks = CallbackHandler::new(2).unwrap();
    let bridge = NativeBridge::new(HeadlessContext::new(manager.clone(), assets), callbacks.clone());

    Fixture {
        bridge,
        manager,
        callbacks,
    }
}

fn ready_fixture() -> Fixture {
    let fixture = fixture();
    fixture.bridge.initialize(&[], &[], &[]).unwrap();
    fixture
}

#[cfg(test)]
mod gating_tests {
    use super::*;

    #[test]
    fn test_operations_before_initialize_are_noops() {
        let f = fixture();
        let bridge = &f.bridge;

        bridge.on_tick(1, 0.05);
        bridge.load_chunk(0, 0, &[1, 2, 3]);
        bridge.spawn_entity(1, "zombie", 0.0, 64.0, 0.0);
        bridge.play_sound("step", 0.0, 0.0, 0.0, 1.0, 1.0);

        assert_eq!(bridge.upload_texture("stone", &[1; 64], 4, 4, 0), 0);
        assert_eq!(bridge.profile_data(), 0);
        assert_eq!(bridge.debug_info(), "Native engine not ready");
        assert_eq!(bridge.compress_packet(b"abc").unwrap(), b"abc");
        assert_eq!(bridge.decompress_packet(b"abc").unwrap(), b"abc");
        assert!(bridge.batch_update_entities(&[1], &[0.0]).is_ok());

        assert!(matches!(bridge.allocate(64), Err(VoidError::NotInitialized)));
        assert!(bridge.engine().is_none());
        assert_eq!(f.manager.active_allocations(), 0);
    }

    #[test]
    fn test_paused_engine_ignores_operations() {
        let f = ready_fixture();
        let bridge = &f.bridge;

        bridge.pause();
        assert!(bridge.is_paused());
        assert!(bridge.engine().unwrap().is_paused());

        bridge.load_chunk(0, 0, &[1; 100]);
        bridge.spawn_entity(7, "pig", 0.0, 0.0, 0.0);
        assert_eq!(bridge.engine().unwrap().chunk_count(), 0);
        assert_eq!(bridge.engine().unwrap().entity_count(), 0);

        // Allocation is not gated by pause
        let handle = bridge.allocate(32).unwrap();
        assert!(!handle.is_freed());

        bridge.resume();
        assert!(!bridge.is_paused());
        bridge.load_chunk(0, 0, &[1; 100]);
        assert_eq!(bridge.engine().unwrap().chunk_count(), 1);
    }

    #[test]
    fn test_batch_update_validation() {
        let f = ready_fixture();
        let bridge = &f.bridge;
        bridge.spawn_entity(1, "cow", 0.0, 0.0, 0.0);
        bridge.spawn_entity(2, "cow", 0.0, 0.0, 0.0);

        let err = bridge
            .batch_update_entities(&[1, 2], &[0.0; 9])
            .unwrap_err();
        assert!(matches!(err, VoidError::InvalidArgument(_)));

        bridge
            .batch_update_entities(&[1, 2], &[1.0, 2.0, 3.0, 90.0, 10.0, 4.0, 5.0, 6.0, 180.0, -10.0])
            .unwrap();

        let engine = bridge.engine().unwrap();
        let first = engine.entity(1).unwrap();
        assert_eq!((first.x, first.y, first.z), (1.0, 2.0, 3.0));
        assert_eq!(first.yaw, 90.0);
        assert_eq!(engine.entity(2).unwrap().pitch, -10.0);
    }

    #[test]
    fn test_network_roundtrip_when_ready() {
        let f = ready_fixture();
        let payload: Vec<u8> = b"position update ".repeat(64);

        let packet = f.bridge.compress_packet(&payload).unwrap();
        assert!(packet.len() < payload.len());
        assert_eq!(f.bridge.decompress_packet(&packet).unwrap(), payload);
        assert!(matches!(
            f.bridge.decompress_packet(&[]),
            Err(VoidError::Codec(_))
        ));
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_initialize_twice_is_harmless() {
        let f = ready_fixture();
        f.bridge.spawn_entity(1, "sheep", 0.0, 0.0, 0.0);

        f.bridge.initialize(&[], &[], &[]).unwrap();
        assert_eq!(f.bridge.engine().unwrap().entity_count(), 1);
    }

    #[test]
    fn test_shutdown_releases_engine_state() {
        let f = ready_fixture();
        f.bridge.load_chunk(3, 4, &[9; 2048]);
        f.bridge.upload_texture("dirt", &[2; 1024], 16, 16, 0);
        assert!(f.manager.active_allocations() >= 2);

        f.bridge.shutdown();
        assert!(!f.bridge.is_initialized());
        assert!(f.bridge.engine().is_none());
        assert_eq!(f.manager.active_allocations(), 0);

        f.bridge.shutdown();
        f.bridge.initialize(&[], &[], &[]).unwrap();
        assert_eq!(f.bridge.engine().unwrap().chunk_count(), 0);
    }

    #[test]
    fn test_invalid_config_fails_initialize() {
        let f = fixture();
        let err = f.bridge.initialize(&[], &[], b"{not json").unwrap_err();
        assert!(matches!(err, VoidError::Config(_)));
        assert!(!f.bridge.is_initialized());
    }

    #[test]
    fn test_texture_budget_from_config() {
        let f = fixture();
        f.bridge
            .initialize(&[], &[], br#"{"memory": {"texture_budget_mb": 1}}"#)
            .unwrap();

        assert_ne!(f.bridge.upload_texture("a", &vec![1; 600 * 1024], 64, 64, 0), 0);
        assert_eq!(f.bridge.upload_texture("b", &vec![2; 600 * 1024], 64, 64, 0), 0);
        assert_eq!(f.bridge.engine().unwrap().texture_count(), 1);
    }
}

#[cfg(test)]
mod link_tests {
    use super::*;

    static CREATED: AtomicBool = AtomicBool::new(false);

    /// Engine whose library lacks two entry points
    struct PartialEngine;

    impl NativeEngine for PartialEngine {
        type Context = ();

        fn create(_context: &(), _config: &[u8]) -> VoidResult<Self> {
            CREATED.store(true, Ordering::SeqCst);
            Ok(PartialEngine)
        }

        fn supports(method: &str) -> bool {
            method != "nativePause" && method != "nativeFree"
        }

        fn initialize(&mut self, _: &[u8], _: &[u8], _: &[u8]) -> VoidResult<()> {
            Ok(())
        }
        fn shutdown(&mut self) {}
        fn pause(&self) {}
        fn resume(&self) {}
        fn on_tick(&self, _: i64, _: f32) {}
        fn prepare_frame(&self, _: f32) {}
        fn render_world(&self, _: i64, _: f32, _: &[f32], _: &[f32]) {}
        fn composite_frame(&self) {}
        fn allocate(&self, _: usize) -> VoidResult<usize> {
            Err(VoidError::NotInitialized)
        }
        fn free(&self, _: usize) {}
        fn sync_memory(&self) {}
        fn memory_usage(&self) -> u64 {
            0
        }
        fn spawn_entity(&self, _: i32, _: &str, _: f64, _: f64, _: f64) {}
        fn remove_entity(&self, _: i32) {}
        fn update_entity(&self, _: i32, _: f64, _: f64, _: f64, _: f32, _: f32) {}
        fn batch_update_entities(&self, _: &[i32], _: &[f32]) {}
        fn load_chunk(&self, _: i32, _: i32, _: &[u8]) {}
        fn unload_chunk(&self, _: i32, _: i32) {}
        fn update_chunk(&self, _: i32, _: i32, _: &[u8]) {}
        fn mark_chunk_dirty(&self, _: i32, _: i32) {}
        fn upload_texture(&self, _: &str, _: &[u8], _: i32, _: i32, _: i32) -> u64 {
            0
        }
        fn unload_texture(&self, _: u64) {}
        fn play_sound(&self, _: &str, _: f32, _: f32, _: f32, _: f32, _: f32) {}
        fn stop_sound(&self, _: &str) {}
        fn update_listener(&self, _: f32, _: f32, _: f32, _: f32, _: f32) {}
        fn compress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn decompress_packet(&self, data: &[u8]) -> VoidResult<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn predict_state(&self, _: i64, _: &[u8]) {}
        fn reconcile_state(&self, _: i64, _: &[u8]) {}
        fn debug_info(&self) -> String {
            String::new()
        }
        fn set_debug_flag(&self, _: &str, _: bool) {}
        fn profile_data(&self) -> u64 {
            0
        }
        fn register_callbacks(&self, _: Arc<CallbackHandler>) {}
    }

    #[test]
    fn test_missing_methods_fail_initialize() {
        let callbacks = CallbackHandler::new(1).unwrap();
        let bridge = NativeBridge::<PartialEngine>::new((), callbacks);

        let err = bridge.initialize(&[], &[], &[]).unwrap_err();
        match err {
            VoidError::NativeLinkFailure { missing } => {
                assert_eq!(missing, vec!["nativePause", "nativeFree"]);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(!CREATED.load(Ordering::SeqCst));
        assert!(!bridge.is_initialized());
        assert!(!VoidError::NativeLinkFailure { missing: vec![] }.is_recoverable());
    }

    #[test]
    fn test_headless_engine_links() {
        assert!(void_core::bridge::catalog::verify_link(HeadlessEngine::supports).is_ok());
    }
}

#[cfg(test)]
mod handle_tests {
    use super::*;

    #[test]
    fn test_handle_access_and_close() {
        let f = ready_fixture();
        let handle = f.bridge.allocate(100).unwrap();
        assert_eq!(handle.size(), 100);
        assert_eq!(f.bridge.active_handle_count(), 1);
        assert_eq!(f.bridge.native_memory_usage(), 100);

        let value = handle
            .with_buffer(|buf| {
                buf.put_i32(96, 1234).unwrap();
                assert!(buf.put_i32(97, 0).is_err());
                buf.get_i32(96).unwrap()
            })
            .unwrap();
        assert_eq!(value, 1234);

        handle.close();
        assert!(handle.is_freed());
        assert!(matches!(
            handle.with_buffer(|buf| buf.put_u8(0, 1)),
            Err(VoidError::UseAfterFree { .. })
        ));
        assert_eq!(f.bridge.active_handle_count(), 0);
        assert_eq!(f.bridge.native_memory_usage(), 0);
        assert_eq!(f.manager.active_allocations(), 0);

        let frees = f.manager.deallocation_count();
        handle.close();
        f.bridge.free(&handle);
        assert_eq!(f.manager.deallocation_count(), frees);
    }

    #[test]
    fn test_close_waits_for_buffer_access() {
        let f = ready_fixture();
        let handle = f.bridge.allocate(64).unwrap();
        let (started_tx, started_rx) = unbounded();
        let finished = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                handle
                    .with_buffer(|buf| {
                        started_tx.send(()).unwrap();
                        std::thread::sleep(Duration::from_millis(50));
                        buf.put_i64(0, 7).unwrap();
                        finished.store(true, Ordering::SeqCst);
                    })
                    .unwrap();
            });

            started_rx.recv_timeout(TIMEOUT).unwrap();
            handle.close();
            assert!(finished.load(Ordering::SeqCst));
        });

        assert!(handle.is_freed());
        assert_eq!(f.manager.active_allocations(), 0);
    }

    #[test]
    fn test_drop_frees_handle() {
        let f = ready_fixture();
        {
            let _handle = f.bridge.allocate(4096).unwrap();
            assert_eq!(f.manager.active_allocations(), 1);
        }
        assert_eq!(f.manager.active_allocations(), 0);
        assert_eq!(f.bridge.active_handle_count(), 0);
    }

    #[test]
    fn test_shutdown_frees_outstanding_handles() {
        let f = ready_fixture();
        let a = f.bridge.allocate(256).unwrap();
        let b = f.bridge.allocate(100_000).unwrap();

        f.bridge.shutdown();
        assert!(a.is_freed());
        assert!(b.is_freed());
        assert_eq!(f.manager.active_allocations(), 0);

        let frees = f.manager.deallocation_count();
        drop(a);
        drop(b);
        assert_eq!(f.manager.deallocation_count(), frees);
    }

    #[test]
    fn test_handle_outlives_bridge() {
        let f = ready_fixture();
        let handle = f.bridge.allocate(64).unwrap();
        let Fixture {
            bridge, manager, ..
        } = f;

        drop(bridge);
        assert!(handle.is_freed());
        assert_eq!(manager.active_allocations(), 0);
        drop(handle);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let f = ready_fixture();
        assert!(matches!(f.bridge.allocate(0), Err(VoidError::InvalidArgument(_))));
        assert!(matches!(
            f.bridge.allocate(usize::MAX),
            Err(VoidError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.bridge.allocate(64 * 1024 * 1024),
            Err(VoidError::MemoryExhausted { .. })
        ));
    }

    #[test]
    fn test_concurrent_close_frees_once() {
        let f = ready_fixture();
        let handle = Arc::new(f.bridge.allocate(512).unwrap());
        let frees = f.manager.deallocation_count();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.close())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(f.manager.deallocation_count(), frees + 1);
    }
}

#[cfg(test)]
mod callback_tests {
    use super::*;

    #[test]
    fn test_chunk_ready_reported() {
        let f = ready_fixture();
        let (tx, rx) = unbounded();
        f.callbacks.register_handler(callback_type::CHUNK_READY, move |data: &CallbackData| {
            let _ = tx.send((data.get_int("x", 0), data.get_int("z", 0), data.get_long("handle", 0)));
        });

        f.bridge.load_chunk(5, -3, &[7; 512]);
        let (x, z, handle) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!((x, z), (5, -3));
        assert_ne!(handle, 0);

        f.bridge.mark_chunk_dirty(5, -3);
        f.bridge.on_tick(2, 0.05);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, 5);
    }

    #[test]
    fn test_entity_sound_and_frame_callbacks() {
        let f = ready_fixture();
        let (tx, rx) = unbounded();
        for kind in [
            callback_type::ENTITY_REMOVED,
            callback_type::SOUND_COMPLETE,
            callback_type::FRAME_READY,
        ] {
            let tx = tx.clone();
            f.callbacks.register_handler(kind, move |data: &CallbackData| {
                let _ = tx.send((kind, data.get_int("id", data.get_int("value", -1))));
            });
        }

        f.bridge.spawn_entity(42, "creeper", 0.0, 0.0, 0.0);
        f.bridge.remove_entity(42);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (callback_type::ENTITY_REMOVED, 42));

        f.bridge.play_sound("ambient.cave", 0.0, 0.0, 0.0, 1.0, 1.0);
        f.bridge.stop_sound("ambient.cave");
        let (kind, id) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(kind, callback_type::SOUND_COMPLETE);
        assert!(id > 0);

        f.bridge.composite_frame();
        f.bridge.prepare_frame(0.5);
        f.bridge.render_world(1, 0.5, &[0.0; 16], &[0.0; 16]);
        f.bridge.composite_frame();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (callback_type::FRAME_READY, 1));
        assert_eq!(f.bridge.profile_data(), 1);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let f = fixture();
        let (tx, rx) = unbounded();

        f.callbacks.register_handler(callback_type::ERROR, |_: &CallbackData| panic!("handler bug"));
        f.callbacks.register_handler(callback_type::LOG, move |data: &CallbackData| {
            let _ = tx.send(data.get_string("message", "").to_string());
        });

        f.callbacks.send_error(1, "boom", "");
        f.callbacks.send_log(2, "test", "still alive");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "still alive");

        let deadline = std::time::Instant::now() + TIMEOUT;
        while f.callbacks.failed() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.callbacks.failed(), 1);
        assert_eq!(f.callbacks.received(), 2);
    }

    #[test]
    fn test_memory_warning_forwarded() {
        let f = fixture();
        let (tx, rx) = unbounded();
        f.callbacks.register_handler(callback_type::MEMORY_CRITICAL, move |data: &CallbackData| {
            let _ = tx.send((data.get_long("used", 0), data.get_long("max", 0)));
        });

        let sink = f.callbacks.clone();
        f.manager.set_warning_callback(move |warning| sink.send_memory_warning(warning));

        assert!(f.manager.allocate(32 * 1024 * 1024, "too-big").is_err());
        let (used, max) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(used, 0);
        assert_eq!(max, 16 * 1024 * 1024);

        f.manager.clear_warning_callback();
    }

    #[test]
    fn test_shutdown_discards_later_callbacks() {
        let f = fixture();
        let (tx, rx) = unbounded::<i32>();
        f.callbacks.register_handler(callback_type::FRAME_READY, move |data: &CallbackData| {
            let _ = tx.send(data.get_int("value", 0));
        });

        f.callbacks.shutdown();
        assert!(f.callbacks.is_shut_down());
        f.callbacks.send_simple(callback_type::FRAME_READY, 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
