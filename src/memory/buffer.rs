//! # Zero-Copy Buffer
//!
//! Typed, bounds-checked access to an off-heap region without copying it.
//!
//! Values are read and written in native byte order at arbitrary (unaligned)
//! offsets. Every access checks, in order: the buffer is not closed, the
//! range `offset..offset + width` lies inside the buffer, and for writes the
//! buffer is not read-only.
//!
//! Owned buffers come from a [`VoidManager`] and return their memory on
//! [`close`](ZeroCopyBuffer::close) or drop. Borrowed buffers wrap a caller
//! slice for the lifetime `'a`. Slices borrow their parent, so the parent
//! cannot be closed while a slice is alive.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

use bitflags::bitflags;

use super::void_manager::VoidManager;
use crate::error::{VoidError, VoidResult};

bitflags! {
    /// Buffer properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u16 {
        /// Memory is returned to a manager on close
        const OWNED = 0b0001;
        /// Writes are refused
        const READ_ONLY = 0b0010;
        /// Adopted from a raw address
        const FOREIGN = 0b0100;
    }
}

/// Bounds-checked view over off-heap memory
#[derive(Debug)]
pub struct ZeroCopyBuffer<'a> {
    address: usize,
    size: usize,
    flags: BufferFlags,
    closed: bool,
    owner: Option<Arc<VoidManager>>,
    _region: PhantomData<&'a mut [u8]>,
}

macro_rules! typed_access {
    ($($get:ident, $put:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a native-endian `", stringify!($ty), "` at `offset`")]
            pub fn $get(&self, offset: usize) -> VoidResult<$ty> {
                self.check_range(offset, size_of::<$ty>())?;
                // SAFETY: range checked against a live region
                Ok(unsafe { ptr::read_unaligned(self.ptr_at(offset) as *const $ty) })
            }

            #[doc = concat!("Write a native-endian `", stringify!($ty), "` at `offset`")]
            pub fn $put(&mut self, offset: usize, value: $ty) -> VoidResult<()> {
                self.check_writable(offset, size_of::<$ty>())?;
                // SAFETY: range checked against a live, writable region
                unsafe { ptr::write_unaligned(self.ptr_at(offset) as *mut $ty, value) };
                Ok(())
            }
        )*
    };
}

impl ZeroCopyBuffer<'static> {
    /// Allocate `size` bytes from `manager`; the buffer owns them
    pub fn allocate(manager: &Arc<VoidManager>, size: usize) -> VoidResult<Self> {
        let address = manager.allocate_zeroed(size, "buffer")?;

        Ok(Self {
            address,
            size,
            flags: BufferFlags::OWNED,
            closed: false,
            owner: Some(manager.clone()),
            _region: PhantomData,
        })
    }

    /// Adopt a foreign region without taking ownership
    ///
    /// # Safety
    /// `address..address + size` must be valid for reads and writes for as
    /// long as the buffer is used, and not accessed concurrently elsewhere.
    pub unsafe fn wrap_native(address: usize, size: usize) -> VoidResult<Self> {
        if address == 0 {
            return Err(VoidError::InvalidArgument("null address".into()));
        }

        Ok(Self {
            address,
            size,
            flags: BufferFlags::FOREIGN,
            closed: false,
            owner: None,
            _region: PhantomData,
        })
    }
}

impl<'a> ZeroCopyBuffer<'a> {
    /// View a caller-owned region
    pub fn wrap(region: &'a mut [u8]) -> Self {
        Self {
            address: region.as_mut_ptr() as usize,
            size: region.len(),
            flags: BufferFlags::empty(),
            closed: false,
            owner: None,
            _region: PhantomData,
        }
    }

    /// Read-only view of a caller-owned region
    pub fn wrap_read_only(region: &'a [u8]) -> Self {
        Self {
            address: region.as_ptr() as usize,
            size: region.len(),
            flags: BufferFlags::READ_ONLY,
            closed: false,
            owner: None,
            _region: PhantomData,
        }
    }

    pub(crate) fn view(address: usize, size: usize, read_only: bool) -> Self {
        Self {
            address,
            size,
            flags: if read_only {
                BufferFlags::READ_ONLY | BufferFlags::FOREIGN
            } else {
                BufferFlags::FOREIGN
            },
            closed: false,
            owner: None,
            _region: PhantomData,
        }
    }

    // ========================================================================
    // CHECKS
    // ========================================================================

    fn check_live(&self) -> VoidResult<()> {
        if self.closed {
            return Err(VoidError::UseAfterFree {
                address: self.address,
            });
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, length: usize) -> VoidResult<()> {
        self.check_live()?;
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VoidError::out_of_bounds(offset, length, self.size)),
        }
    }

    fn check_writable(&self, offset: usize, length: usize) -> VoidResult<()> {
        self.check_range(offset, length)?;
        if self.is_read_only() {
            return Err(VoidError::ReadOnly);
        }
        Ok(())
    }

    #[inline]
    fn ptr_at(&self, offset: usize) -> *mut u8 {
        (self.address + offset) as *mut u8
    }

    // ========================================================================
    // TYPED ACCESS
    // ========================================================================

    typed_access! {
        get_i8, put_i8, i8;
        get_u8, put_u8, u8;
        get_i16, put_i16, i16;
        get_i32, put_i32, i32;
        get_i64, put_i64, i64;
        get_f32, put_f32, f32;
        get_f64, put_f64, f64;
    }

    // ========================================================================
    // BULK ACCESS
    // ========================================================================

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> VoidResult<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: source range checked; dst is a distinct Rust slice
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy `src` into the buffer at `offset`
    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) -> VoidResult<()> {
        self.check_writable(offset, src.len())?;
        // SAFETY: destination range checked; src may alias a wrapped region
        unsafe { ptr::copy(src.as_ptr(), self.ptr_at(offset), src.len()) };
        Ok(())
    }

    pub fn get_i32s(&self, offset: usize, dst: &mut [i32]) -> VoidResult<()> {
        self.get_bytes(offset, bytemuck::cast_slice_mut(dst))
    }

    pub fn put_i32s(&mut self, offset: usize, src: &[i32]) -> VoidResult<()> {
        self.put_bytes(offset, bytemuck::cast_slice(src))
    }

    pub fn get_f32s(&self, offset: usize, dst: &mut [f32]) -> VoidResult<()> {
        self.get_bytes(offset, bytemuck::cast_slice_mut(dst))
    }

    pub fn put_f32s(&mut self, offset: usize, src: &[f32]) -> VoidResult<()> {
        self.put_bytes(offset, bytemuck::cast_slice(src))
    }

    /// Copy `length` bytes from `src[src_offset..]` to `self[dst_offset..]`.
    /// Both ranges are checked before any byte moves.
    pub fn copy_from(
        &mut self,
        src: &ZeroCopyBuffer<'_>,
        src_offset: usize,
        dst_offset: usize,
        length: usize,
    ) -> VoidResult<()> {
        src.check_range(src_offset, length)?;
        self.check_writable(dst_offset, length)?;
        // SAFETY: both ranges checked; regions may overlap for views of one backing
        unsafe { ptr::copy(src.ptr_at(src_offset), self.ptr_at(dst_offset), length) };
        Ok(())
    }

    /// Set `length` bytes at `offset` to `value`
    pub fn fill(&mut self, offset: usize, length: usize, value: u8) -> VoidResult<()> {
        self.check_writable(offset, length)?;
        // SAFETY: range checked
        unsafe { ptr::write_bytes(self.ptr_at(offset), value, length) };
        Ok(())
    }

    /// Zero the whole buffer
    pub fn clear(&mut self) -> VoidResult<()> {
        self.fill(0, self.size, 0)
    }

    /// Borrow the contents as a byte slice
    pub fn as_slice(&self) -> VoidResult<&[u8]> {
        self.check_live()?;
        if self.size == 0 {
            return Ok(&[]);
        }
        // SAFETY: live region of `size` bytes, borrowed for &self
        Ok(unsafe { std::slice::from_raw_parts(self.ptr_at(0), self.size) })
    }

    /// Borrow the contents mutably
    pub fn as_mut_slice(&mut self) -> VoidResult<&mut [u8]> {
        self.check_writable(0, 0)?;
        if self.size == 0 {
            return Ok(&mut []);
        }
        // SAFETY: live writable region of `size` bytes, borrowed for &mut self
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr_at(0), self.size) })
    }

    // ========================================================================
    // SLICING
    // ========================================================================

    /// Read-only view of `length` bytes at `offset`
    pub fn slice(&self, offset: usize, length: usize) -> VoidResult<ZeroCopyBuffer<'_>> {
        self.check_range(offset, length)?;
        Ok(ZeroCopyBuffer {
            address: self.address + offset,
            size: length,
            flags: BufferFlags::READ_ONLY,
            closed: false,
            owner: None,
            _region: PhantomData,
        })
    }

    /// Writable view of `length` bytes at `offset`; inherits read-only
    pub fn slice_mut(&mut self, offset: usize, length: usize) -> VoidResult<ZeroCopyBuffer<'_>> {
        self.check_range(offset, length)?;
        Ok(ZeroCopyBuffer {
            address: self.address + offset,
            size: length,
            flags: self.flags & BufferFlags::READ_ONLY,
            closed: false,
            owner: None,
            _region: PhantomData,
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Release the buffer. Owned memory goes back to its manager on the
    /// first call; later calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(owner) = self.owner.take() {
            if let Err(e) = owner.free(self.address) {
                log::warn!("Buffer close could not free {:#x}: {}", self.address, e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(BufferFlags::READ_ONLY)
    }

    pub fn is_owned(&self) -> bool {
        self.flags.contains(BufferFlags::OWNED)
    }
}

impl Drop for ZeroCopyBuffer<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_round_values() {
        let mut backing = [0u8; 32];
        let mut buf = ZeroCopyBuffer::wrap(&mut backing);

        buf.put_i32(3, -7).unwrap();
        buf.put_f64(8, 2.5).unwrap();
        assert_eq!(buf.get_i32(3).unwrap(), -7);
        assert_eq!(buf.get_f64(8).unwrap(), 2.5);

        drop(buf);
        assert_eq!(&backing[3..7], &(-7i32).to_ne_bytes());
    }

    #[test]
    fn test_overflowing_offset_is_out_of_bounds() {
        let mut backing = [0u8; 8];
        let buf = ZeroCopyBuffer::wrap(&mut backing);
        assert!(matches!(
            buf.get_i64(usize::MAX - 2),
            Err(VoidError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_read_only_wrap() {
        let backing = [1u8; 8];
        let mut buf = ZeroCopyBuffer::wrap_read_only(&backing);
        assert_eq!(buf.get_u8(0).unwrap(), 1);
        assert_eq!(buf.put_u8(0, 2), Err(VoidError::ReadOnly));
        assert_eq!(buf.fill(0, 8, 0), Err(VoidError::ReadOnly));
    }

    #[test]
    fn test_closed_wrap_refuses_access() {
        let mut backing = [0u8; 8];
        let mut buf = ZeroCopyBuffer::wrap(&mut backing);
        buf.close();
        assert!(matches!(buf.get_u8(0), Err(VoidError::UseAfterFree { .. })));
        assert!(matches!(buf.as_slice(), Err(VoidError::UseAfterFree { .. })));
    }
}
