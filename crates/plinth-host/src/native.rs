//! Native library seam, loaded artifacts, and call leases.
//!
//! [`LibraryOpener`] / [`NativeLibrary`] abstract the OS loader so the rest of
//! the host can be exercised without real shared objects. [`DylibOpener`] is
//! the production implementation on top of `libloading`.
//!
//! A [`NativeArtifact`] owns the library handle for one generation of a
//! plugin. Calls into it go through a [`Lease`]; the handle is only closed
//! after the artifact is draining and no lease is outstanding.

use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libloading::Library;
use plinth_abi::{BufferFreeFn, PlinthBuffer, ReleaseMode};
use tokio::sync::Semaphore;

use crate::error::UnloadError;

// ─── Library seam ───────────────────────────────────────────────────────

/// An opened native library.
pub trait NativeLibrary: Send + Sync {
    /// Address of an exported symbol, or `None` if it is not exported.
    fn symbol(&self, name: &str) -> Option<*const c_void>;

    /// Unmap the library. Every pointer obtained from [`symbol`](Self::symbol)
    /// is invalid afterwards.
    fn close(self: Box<Self>) -> Result<(), String>;
}

/// Opens native artifacts.
pub trait LibraryOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, String>;
}

/// `libloading`-backed opener.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibOpener;

struct Dylib {
    library: Library,
}

impl LibraryOpener for DylibOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, String> {
        // SAFETY: loading runs the library's initializers. Artifacts in the
        // plugin directory are trusted to the same degree as the host binary.
        let library = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(Dylib { library }))
    }
}

impl NativeLibrary for Dylib {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the symbol is read as an opaque address; it is only called
        // after being cast to the signature the ABI fixes for that name.
        let symbol = unsafe { self.library.get::<*const c_void>(name.as_bytes()) }.ok()?;
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        self.library.close().map_err(|e| e.to_string())
    }
}

/// Reinterpret a symbol address as a function pointer.
///
/// # Safety
///
/// `F` must be a function pointer type matching the symbol's real signature,
/// and the library must stay mapped while the result is used.
pub(crate) unsafe fn cast_symbol<F: Copy>(address: *const c_void) -> F {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<*const c_void>()
    );
    unsafe { std::mem::transmute_copy(&address) }
}

// ─── Buffers ────────────────────────────────────────────────────────────

/// Copy a plugin-owned buffer into host memory, then release it.
///
/// The buffer is released exactly once whenever it is non-null, including
/// when the length check fails.
///
/// # Safety
///
/// `buf` must have been returned by the library that `free` belongs to, and
/// that library must still be mapped.
pub(crate) unsafe fn take_buffer(
    buf: PlinthBuffer,
    release: ReleaseMode,
    free: Option<BufferFreeFn>,
    limit: usize,
) -> Result<Vec<u8>, String> {
    if buf.is_null() && buf.len > 0 {
        return Err(format!("null buffer with length {}", buf.len));
    }
    let copied = if buf.len > limit {
        Err(format!("buffer length {} exceeds limit {limit}", buf.len))
    } else {
        unsafe { buf.as_slice() }
            .map(<[u8]>::to_vec)
            .ok_or_else(|| "invalid buffer".to_string())
    };
    unsafe { release_buffer(buf, release, free) };
    copied
}

/// Hand a buffer back to its producer according to the release mode.
///
/// # Safety
///
/// As for [`take_buffer`]; `buf` must not be used afterwards.
pub(crate) unsafe fn release_buffer(
    buf: PlinthBuffer,
    release: ReleaseMode,
    free: Option<BufferFreeFn>,
) {
    if buf.is_null() {
        return;
    }
    match (release, free) {
        (ReleaseMode::Static, _) => {}
        (ReleaseMode::Exported, Some(free)) => unsafe { free(buf) },
        (ReleaseMode::Exported, None) => {
            tracing::error!("exported buffer without a release function, leaking it");
        }
    }
}

// ─── Artifact ───────────────────────────────────────────────────────────

/// One loaded generation of a native plugin.
pub struct NativeArtifact {
    id: String,
    generation: u64,
    library: Mutex<Option<Box<dyn NativeLibrary>>>,
    release: ReleaseMode,
    free: Option<BufferFreeFn>,
    inflight: AtomicUsize,
    draining: AtomicBool,
    calls: Arc<Semaphore>,
}

impl std::fmt::Debug for NativeArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeArtifact")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("release", &self.release)
            .field("inflight", &self.inflight())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl NativeArtifact {
    pub(crate) fn new(
        id: String,
        generation: u64,
        library: Box<dyn NativeLibrary>,
        release: ReleaseMode,
        free: Option<BufferFreeFn>,
        max_concurrent_calls: usize,
    ) -> Self {
        Self {
            id,
            generation,
            library: Mutex::new(Some(library)),
            release,
            free,
            inflight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            calls: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn release_mode(&self) -> ReleaseMode {
        self.release
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.library.lock().map(|lib| lib.is_none()).unwrap_or(true)
    }

    /// Take a lease, unless the artifact is draining.
    ///
    /// The counter is raised before the state is checked, and
    /// [`begin_drain`](Self::begin_drain) sets the state before the counter is
    /// read, so a lease and a close can never both succeed.
    pub fn lease(self: &Arc<Self>) -> Option<Lease> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Lease {
            artifact: Arc::clone(self),
        })
    }

    /// Refuse new leases from now on.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Close the library if the artifact is draining and idle.
    ///
    /// Returns `Ok(true)` once the library is closed (now or earlier),
    /// `Ok(false)` while leases are outstanding or the drain has not begun.
    pub fn try_close(&self) -> Result<bool, UnloadError> {
        if !self.is_draining() || self.inflight() > 0 {
            return Ok(false);
        }
        let mut slot = self.library.lock().map_err(|_| UnloadError::CloseFailed {
            plugin: self.id.clone(),
            reason: "library handle lock poisoned".into(),
        })?;
        match slot.take() {
            None => Ok(true),
            Some(library) => library
                .close()
                .map(|()| true)
                .map_err(|reason| UnloadError::CloseFailed {
                    plugin: self.id.clone(),
                    reason,
                }),
        }
    }

    pub(crate) fn call_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.calls)
    }
}

/// Permission to call into an artifact. The library stays mapped while any
/// lease is alive.
pub struct Lease {
    artifact: Arc<NativeArtifact>,
}

impl Lease {
    pub fn artifact(&self) -> &NativeArtifact {
        &self.artifact
    }

    /// Copy and release a buffer returned by this artifact.
    pub(crate) fn take_buffer(&self, buf: PlinthBuffer, limit: usize) -> Result<Vec<u8>, String> {
        // SAFETY: the lease keeps the producing library mapped.
        unsafe { take_buffer(buf, self.artifact.release, self.artifact.free, limit) }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.artifact.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}
