/// Export the plugin-level entry points: `plinth_manifest_v1`,
/// `plinth_has_bundle`, `plinth_bundle` and `plinth_buffer_free`.
///
/// `manifest` is evaluated on every call and must produce a
/// [`ManifestDocument`](crate::ManifestDocument). `bundle`, when given, must be
/// a `&'static [u8]` (typically `include_bytes!`); it is handed out without
/// copying and never released.
///
/// Invoke once per library.
#[macro_export]
macro_rules! export_plugin {
    (manifest: $manifest:expr $(, bundle: $bundle:expr)? $(,)?) => {
        #[no_mangle]
        pub extern "C" fn plinth_manifest_v1() -> $crate::PlinthBuffer {
            $crate::guard::guard_with_default(
                "plinth_manifest_v1",
                $crate::PlinthBuffer::empty(),
                || {
                    let document: $crate::ManifestDocument = $manifest;
                    match $crate::encode_manifest(&document, $crate::ReleaseMode::Exported) {
                        Ok(bytes) => $crate::buffer::export_vec(bytes),
                        Err(_) => $crate::PlinthBuffer::empty(),
                    }
                },
            )
        }

        #[no_mangle]
        pub extern "C" fn plinth_has_bundle() -> bool {
            $crate::__plinth_bundle_present!($($bundle)?)
        }

        #[no_mangle]
        pub extern "C" fn plinth_bundle() -> $crate::PlinthBuffer {
            $crate::__plinth_bundle_buffer!($($bundle)?)
        }

        /// # Safety
        ///
        /// Only for buffers returned by this library.
        #[no_mangle]
        pub unsafe extern "C" fn plinth_buffer_free(buf: $crate::PlinthBuffer) {
            unsafe { $crate::buffer::release_buffer(buf) }
        }
    };
}

/// Export a route handler under `symbol`, the name a
/// [`RouteDeclaration`](crate::RouteDeclaration) refers to.
///
/// `handler` is any `fn(RequestEnvelope) -> ResponseEnvelope`. Request
/// decoding, response encoding and panic containment are handled by
/// [`guard::handle_request`](crate::guard::handle_request).
#[macro_export]
macro_rules! export_handler {
    ($symbol:ident => $handler:path) => {
        /// # Safety
        ///
        /// `ptr` must be valid for reads of `len` bytes.
        #[no_mangle]
        pub unsafe extern "C-unwind" fn $symbol(ptr: *const u8, len: usize) -> $crate::PlinthBuffer {
            unsafe { $crate::guard::handle_request(ptr, len, $handler) }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __plinth_bundle_present {
    () => {
        false
    };
    ($bundle:expr) => {
        true
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __plinth_bundle_buffer {
    () => {
        $crate::PlinthBuffer::empty()
    };
    ($bundle:expr) => {
        $crate::PlinthBuffer::from_static($bundle)
    };
}
