//! Length-delimited buffer passed across the FFI boundary.

use std::ptr;

/// A (pointer, length) pair handed from one side of the boundary to the other.
///
/// The buffer always belongs to the side that produced it. `cap` is opaque to
/// the receiver: it exists so the producer's release function can rebuild its
/// own allocation, and must be passed back untouched.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PlinthBuffer {
    pub ptr: *const u8,
    pub len: usize,
    pub cap: usize,
}

impl PlinthBuffer {
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null(),
            len: 0,
            cap: 0,
        }
    }

    /// Wrap memory that lives for the rest of the program (or the library).
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
            cap: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrow the bytes behind the buffer.
    ///
    /// Returns `None` for a null pointer with a non-zero length, which is
    /// never a valid buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes for the lifetime `'a`,
    /// and the memory must not be released while the slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> Option<&'a [u8]> {
        if self.len == 0 {
            return Some(&[]);
        }
        if self.ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }
}

impl Default for PlinthBuffer {
    fn default() -> Self {
        Self::empty()
    }
}
