//! Aligned scratch allocation for kernel workspaces and operand buffers.

use mha_common::{MhaError, Result};
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment of every [`AlignedBuffer`], one cache line.
pub const WORKSPACE_ALIGN: usize = 64;

/// Zero-initialised, 64-byte aligned byte buffer freed on drop.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer uniquely owns its allocation; shared access is read-only.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            // Dangling but aligned, never dereferenced for a non-empty slice.
            let ptr = NonNull::new(WORKSPACE_ALIGN as *mut u8).ok_or(MhaError::Allocation { size: 0 })?;
            return Ok(Self { ptr, len });
        }
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MhaError::Allocation { size: len })?;
        Ok(Self { ptr, len })
    }

    /// Aligned copy of `data`'s bytes.
    pub fn from_slice<T: bytemuck::Pod>(data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buf = Self::zeroed(bytes.len())?;
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, WORKSPACE_ALIGN).map_err(|_| MhaError::Allocation { size: len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Reinterpret the contents as `T`; `None` if the length is not a multiple of `T`.
    pub fn as_typed<T: bytemuck::Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(self).ok()
    }

    pub fn as_typed_mut<T: bytemuck::Pod>(&mut self) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self).ok()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes (or len is 0 and ptr is aligned).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, and `&mut self` guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Clone for AlignedBuffer {
    /// Deep copy into a fresh allocation.
    fn clone(&self) -> Self {
        let mut copy = match Self::zeroed(self.len) {
            Ok(buf) => buf,
            Err(_) => alloc::handle_alloc_error(
                Layout::from_size_align(self.len, WORKSPACE_ALIGN).unwrap_or(Layout::new::<u8>()),
            ),
        };
        copy.copy_from_slice(self);
        copy
    }
}

impl PartialEq for AlignedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}

impl Eq for AlignedBuffer {}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in `zeroed` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer").field("ptr", &self.ptr).field("len", &self.len).finish()
    }
}
