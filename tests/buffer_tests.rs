//! # Zero-Copy Buffer Tests

use std::sync::Arc;

use void_core::memory::{BufferFlags, VoidManager, ZeroCopyBuffer};
use void_core::runtime::MemoryConfig;
use void_core::VoidError;

fn manager() -> Arc<VoidManager> {
    let _ = env_logger::builder().is_test(true).try_init();
    VoidManager::new(&MemoryConfig::with_max_mb(16))
}

#[cfg(test)]
mod access_tests {
    use super::*;

    #[test]
    fn test_typed_values_native_order() {
        let manager = manager();
        let mut buf = manager.create_buffer(64).unwrap();

        buf.put_i8(0, -1).unwrap();
        buf.put_i16(1, -300).unwrap();
        buf.put_i32(3, 0x1234_5678).unwrap();
        buf.put_i64(7, -9_000_000_000).unwrap();
        buf.put_f32(15, 1.5).unwrap();
        buf.put_f64(19, -0.25).unwrap();

        assert_eq!(buf.get_i8(0).unwrap(), -1);
        assert_eq!(buf.get_i16(1).unwrap(), -300);
        assert_eq!(buf.get_i32(3).unwrap(), 0x1234_5678);
        assert_eq!(buf.get_i64(7).unwrap(), -9_000_000_000);
        assert_eq!(buf.get_f32(15).unwrap(), 1.5);
        assert_eq!(buf.get_f64(19).unwrap(), -0.25);

        let mut raw = [0u8; 4];
        buf.get_bytes(3, &mut raw).unwrap();
        assert_eq!(raw, 0x1234_5678i32.to_ne_bytes());
    }

    #[test]
    fn test_new_buffer_is_zeroed() {
        let manager = manager();
        let buf = manager.create_buffer(100).unwrap();
        assert_eq!(buf.size(), 100);
        assert!(buf.as_slice().unwrap().iter().all(|b| *b == 0));
        assert!(buf.is_owned());
    }

    #[test]
    fn test_bulk_int_and_float_access() {
        let manager = manager();
        let mut buf = manager.create_buffer(64).unwrap();

        buf.put_i32s(0, &[1, -2, 3]).unwrap();
        buf.put_f32s(12, &[0.5, 4.0]).unwrap();

        let mut ints = [0i32; 3];
        let mut floats = [0f32; 2];
        buf.get_i32s(0, &mut ints).unwrap();
        buf.get_f32s(12, &mut floats).unwrap();

        assert_eq!(ints, [1, -2, 3]);
        assert_eq!(floats, [0.5, 4.0]);
    }

    #[test]
    fn test_fill_and_clear() {
        let manager = manager();
        let mut buf = manager.create_buffer(32).unwrap();

        buf.fill(4, 8, 0x7F).unwrap();
        let bytes = buf.as_slice().unwrap();
        assert!(bytes[..4].iter().all(|b| *b == 0));
        assert!(bytes[4..12].iter().all(|b| *b == 0x7F));

        buf.clear().unwrap();
        assert!(buf.as_slice().unwrap().iter().all(|b| *b == 0));
    }
}

#[cfg(test)]
mod bounds_tests {
    use super::*;

    #[test]
    fn test_get_int_bounds() {
        let manager = manager();
        let buf = manager.create_buffer(16).unwrap();

        for offset in 0..=12 {
            assert!(buf.get_i32(offset).is_ok(), "offset {}", offset);
        }
        for offset in 13..40 {
            assert!(
                matches!(buf.get_i32(offset), Err(VoidError::OutOfBounds { size: 16, .. })),
                "offset {}",
                offset
            );
        }
        assert!(buf.get_i32(usize::MAX).is_err());
    }

    #[test]
    fn test_float_near_end_leaves_contents() {
        let manager = manager();
        let mut buf = manager.create_buffer(100).unwrap();
        buf.fill(0, 100, 0x5A).unwrap();

        let err = buf.get_f32(98).unwrap_err();
        assert!(matches!(err, VoidError::OutOfBounds { offset: 98, length: 4, size: 100 }));
        assert!(err.is_safety_violation());

        assert!(buf.put_f32(98, 1.0).is_err());
        assert!(buf.as_slice().unwrap().iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn test_copy_from_checks_both_ranges_first() {
        let manager = manager();
        let mut src = manager.create_buffer(16).unwrap();
        let mut dst = manager.create_buffer(8).unwrap();
        src.fill(0, 16, 9).unwrap();

        assert!(dst.copy_from(&src, 0, 0, 16).is_err());
        assert!(dst.as_slice().unwrap().iter().all(|b| *b == 0));

        assert!(dst.copy_from(&src, 12, 0, 8).is_err());
        assert!(dst.as_slice().unwrap().iter().all(|b| *b == 0));

        dst.copy_from(&src, 4, 2, 6).unwrap();
        assert_eq!(dst.as_slice().unwrap(), &[0, 0, 9, 9, 9, 9, 9, 9]);

        src.close();
        assert!(matches!(
            dst.copy_from(&src, 0, 0, 1),
            Err(VoidError::UseAfterFree { .. })
        ));
    }

    #[test]
    fn test_slices() {
        let manager = manager();
        let mut buf = manager.create_buffer(32).unwrap();
        buf.put_i32(8, 77).unwrap();

        {
            let view = buf.slice(8, 8).unwrap();
            assert!(view.is_read_only());
            assert_eq!(view.get_i32(0).unwrap(), 77);
            assert!(view.get_i32(5).is_err());
        }

        {
            let mut view = buf.slice_mut(16, 4).unwrap();
            view.put_i32(0, -5).unwrap();
            assert!(view.put_i32(1, 0).is_err());
        }
        assert_eq!(buf.get_i32(16).unwrap(), -5);

        assert!(buf.slice(30, 4).is_err());
    }

    #[test]
    fn test_read_only_slice_of_read_only_buffer() {
        let backing = vec![3u8; 16];
        let buf = ZeroCopyBuffer::wrap_read_only(&backing);
        assert_eq!(buf.flags(), BufferFlags::READ_ONLY);
        assert_eq!(buf.slice(0, 4).unwrap().get_u8(3).unwrap(), 3);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_access_after_close_raises() {
        let manager = manager();
        let mut buf = manager.create_buffer(64).unwrap();
        buf.put_i32(0, 42).unwrap();
        buf.close();

        assert!(buf.is_closed());
        assert!(matches!(buf.get_i32(0), Err(VoidError::UseAfterFree { .. })));
        assert!(matches!(buf.put_u8(0, 1), Err(VoidError::UseAfterFree { .. })));
        assert!(matches!(buf.get_f64(0), Err(VoidError::UseAfterFree { .. })));
        assert!(buf.slice(0, 4).is_err());
    }

    #[test]
    fn test_double_close_keeps_counters() {
        let manager = manager();
        let mut buf = manager.create_buffer(128).unwrap();
        assert_eq!(manager.allocated_bytes(), 128);

        buf.close();
        let once = manager.stats();
        assert_eq!(once.allocated_bytes, 0);

        buf.close();
        assert!(matches!(buf.put_u8(0, 1), Err(VoidError::UseAfterFree { .. })));
        let twice = manager.stats();
        assert_eq!(once.allocated_bytes, twice.allocated_bytes);
        assert_eq!(once.deallocation_count, twice.deallocation_count);
    }

    #[test]
    fn test_drop_returns_memory() {
        let manager = manager();
        {
            let _buf = manager.create_buffer(4096).unwrap();
            assert_eq!(manager.active_allocations(), 1);
        }
        assert_eq!(manager.active_allocations(), 0);
        assert_eq!(manager.allocated_bytes(), 0);
    }

    #[test]
    fn test_wrap_native_does_not_free() {
        let manager = manager();
        let address = manager.allocate(64, "adopted").unwrap();

        let mut buf = unsafe { ZeroCopyBuffer::wrap_native(address, 64) }.unwrap();
        assert_eq!(buf.flags(), BufferFlags::FOREIGN);
        buf.put_i64(0, 11).unwrap();
        buf.close();

        assert!(manager.contains(address));
        let value = unsafe { std::ptr::read_unaligned(address as *const i64) };
        assert_eq!(value, 11);
        assert!(unsafe { ZeroCopyBuffer::wrap_native(0, 8) }.is_err());
    }

    #[test]
    fn test_oversized_buffer_refused() {
        let manager = manager();
        assert!(matches!(
            manager.create_buffer(32 * 1024 * 1024),
            Err(VoidError::MemoryExhausted { .. })
        ));
        assert!(matches!(
            manager.create_buffer(0),
            Err(VoidError::InvalidArgument(_))
        ));
    }
}
