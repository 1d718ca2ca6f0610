//! Plinth plugin ABI.
//!
//! Everything that crosses the boundary between the Plinth host and a native
//! plugin is defined here: the `#[repr(C)]` buffer type, the fixed exported
//! symbol names, the versioned manifest header, and the request/response
//! envelopes. Host and plugins both compile against this crate, so a change to
//! any layout in here must bump [`ABI_VERSION`].

pub mod buffer;
pub mod envelope;
pub mod error;
pub mod manifest;
pub mod panic;

pub use buffer::PlinthBuffer;
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use error::AbiError;
pub use panic::panic_message;
pub use manifest::{
    encode_manifest, encode_manifest_with_version, ManifestDocument, ManifestHeader, ReleaseMode,
    RouteDeclaration, MANIFEST_HEADER_LEN, MANIFEST_MAGIC, RELEASE_MODE_OFFSET,
};

/// ABI version tag written into every manifest header.
///
/// The host compares this before trusting any other byte of the manifest.
pub const ABI_VERSION: u32 = 1;

/// Manifest accessor. Required; the `_v1` suffix is part of the contract.
pub const MANIFEST_SYMBOL: &str = "plinth_manifest_v1";

/// Bundle presence check. Optional.
pub const HAS_BUNDLE_SYMBOL: &str = "plinth_has_bundle";

/// Bundle accessor. Required only when the presence check returns `true`.
pub const BUNDLE_SYMBOL: &str = "plinth_bundle";

/// Buffer release entry point. Required when the manifest declares
/// [`ReleaseMode::Exported`].
pub const BUFFER_FREE_SYMBOL: &str = "plinth_buffer_free";

/// `plinth_manifest_v1`
pub type ManifestFn = unsafe extern "C" fn() -> PlinthBuffer;

/// `plinth_has_bundle`
pub type HasBundleFn = unsafe extern "C" fn() -> bool;

/// `plinth_bundle`
pub type BundleFn = unsafe extern "C" fn() -> PlinthBuffer;

/// `plinth_buffer_free`
pub type BufferFreeFn = unsafe extern "C" fn(PlinthBuffer);

/// Route handler: borrows an encoded [`RequestEnvelope`] and returns an
/// encoded [`ResponseEnvelope`] owned by the plugin.
///
/// Uses the `C-unwind` ABI so a panic inside the plugin unwinds into the
/// host's `catch_unwind` instead of aborting the process.
pub type HandlerFn = unsafe extern "C-unwind" fn(*const u8, usize) -> PlinthBuffer;
