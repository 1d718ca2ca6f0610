//! Plugin-side buffer allocation and release.

use std::mem::ManuallyDrop;

use plinth_abi::PlinthBuffer;

/// Hand ownership of `bytes` to the host.
///
/// The host copies the contents and passes the buffer back to
/// [`release_buffer`] (through the exported `plinth_buffer_free`), so the
/// allocation is freed by the allocator that made it.
pub fn export_vec(bytes: Vec<u8>) -> PlinthBuffer {
    let mut bytes = ManuallyDrop::new(bytes);
    PlinthBuffer {
        ptr: bytes.as_mut_ptr(),
        len: bytes.len(),
        cap: bytes.capacity(),
    }
}

/// Free a buffer produced by [`export_vec`].
///
/// Buffers with `cap == 0` own nothing (static data or an empty vector) and
/// are ignored.
///
/// # Safety
///
/// `buf` must come from [`export_vec`] in this same library, must be passed
/// back unmodified, and must not be released twice.
pub unsafe fn release_buffer(buf: PlinthBuffer) {
    if buf.ptr.is_null() || buf.cap == 0 {
        return;
    }
    drop(unsafe { Vec::from_raw_parts(buf.ptr as *mut u8, buf.len, buf.cap) });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_keeps_contents() {
        let buf = export_vec(b"payload".to_vec());
        assert_eq!(unsafe { buf.as_slice() }, Some(&b"payload"[..]));
        unsafe { release_buffer(buf) };
    }

    #[test]
    fn test_export_empty_vec_owns_nothing() {
        let buf = export_vec(Vec::new());
        assert_eq!(buf.cap, 0);
        unsafe { release_buffer(buf) };
    }

    #[test]
    fn test_release_ignores_static_buffers() {
        static DATA: &[u8] = b"static";
        unsafe { release_buffer(PlinthBuffer::from_static(DATA)) };
        assert_eq!(DATA, b"static");
    }

    #[test]
    fn test_release_with_spare_capacity() {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(b"abc");
        let buf = export_vec(bytes);
        assert_eq!(buf.len, 3);
        assert!(buf.cap >= 64);
        unsafe { release_buffer(buf) };
    }
}
