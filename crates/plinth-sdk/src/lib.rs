//! Plinth plugin SDK.
//!
//! A native plugin is a `cdylib` that exports the fixed entry points defined
//! in `plinth-abi`. This crate generates them:
//!
//! ```rust,ignore
//! use plinth_sdk::{export_handler, export_plugin, ManifestDocument, RouteDeclaration};
//! use plinth_sdk::{RequestEnvelope, ResponseEnvelope};
//!
//! fn manifest() -> ManifestDocument { /* id, name, routes ... */ }
//!
//! fn now(_req: RequestEnvelope) -> ResponseEnvelope {
//!     ResponseEnvelope::text(200, "sunny")
//! }
//!
//! export_plugin!(manifest: manifest(), bundle: include_bytes!("../ui/index.js"));
//! export_handler!(weather_now => now);
//! ```
//!
//! Every buffer handed to the host is allocated with this library's allocator
//! and released by this library's `plinth_buffer_free`; the manifest always
//! declares [`ReleaseMode::Exported`].

pub mod buffer;
pub mod guard;
mod macros;

pub use plinth_abi::{
    encode_manifest, HandlerFn, ManifestDocument, PlinthBuffer, ReleaseMode, RequestEnvelope,
    ResponseEnvelope, RouteDeclaration, ABI_VERSION,
};
pub use serde_json;
