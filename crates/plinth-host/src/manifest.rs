//! Manifest extractor.
//!
//! Calls a plugin's `plinth_manifest_v1`, validates the returned buffer,
//! copies it into host memory, releases the plugin's copy and decodes it.
//! Nothing past the version tag is read until the tag matches
//! [`ABI_VERSION`].

use plinth_abi::{
    AbiError, BufferFreeFn, ManifestDocument, ManifestFn, ManifestHeader, PlinthBuffer,
    ReleaseMode, RouteDeclaration, ABI_VERSION, BUFFER_FREE_SYMBOL, MANIFEST_HEADER_LEN,
    RELEASE_MODE_OFFSET,
};
use serde::Serialize;

use crate::error::LoadError;
use crate::native::{release_buffer, take_buffer};

/// Manifests larger than this are rejected without being copied.
pub const MAX_MANIFEST_BYTES: usize = 1024 * 1024;

/// Host-owned copy of a plugin's self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub routes: Vec<RouteDeclaration>,
    pub has_bundle: bool,
    pub bundle_content_type: Option<String>,
    pub release: ReleaseMode,
}

impl PluginManifest {
    pub fn from_document(document: ManifestDocument, release: ReleaseMode) -> Self {
        Self {
            id: document.id,
            name: document.name,
            version: document.version,
            description: document.description,
            author: document.author,
            routes: document.routes,
            has_bundle: document.bundle,
            bundle_content_type: document.bundle_content_type,
            release,
        }
    }
}

/// Extract the manifest through `accessor`.
///
/// `resolve_free` is only consulted when the header declares
/// [`ReleaseMode::Exported`]. On success the resolved release function is
/// returned alongside the manifest.
///
/// The manifest buffer is released after copying, and also when a header with
/// the current version tag is cut short after its release-mode byte. It is
/// left to the plugin only when the release mode cannot be known: an
/// unreadable tag, another ABI version, or no release-mode byte.
///
/// # Safety
///
/// `accessor` must be the `plinth_manifest_v1` of a library that stays mapped
/// for the duration of the call, and `resolve_free` must resolve symbols from
/// that same library.
pub unsafe fn extract(
    accessor: ManifestFn,
    resolve_free: impl FnOnce() -> Option<BufferFreeFn>,
) -> Result<(PluginManifest, Option<BufferFreeFn>), LoadError> {
    let buf = unsafe { accessor() };
    if buf.is_null() && buf.len > 0 {
        return Err(LoadError::MalformedManifest(format!(
            "null manifest buffer with length {}",
            buf.len
        )));
    }

    let head = PlinthBuffer {
        ptr: buf.ptr,
        len: buf.len.min(MANIFEST_HEADER_LEN),
        cap: 0,
    };
    let head = unsafe { head.as_slice() }.unwrap_or_default();
    let header = match ManifestHeader::parse(head, ABI_VERSION) {
        Ok(header) => header,
        Err(err @ AbiError::Truncated { .. }) => {
            let release = head
                .get(RELEASE_MODE_OFFSET)
                .and_then(|byte| ReleaseMode::from_byte(*byte).ok());
            if let Some(release) = release {
                let free = match release {
                    ReleaseMode::Static => None,
                    ReleaseMode::Exported => resolve_free(),
                };
                unsafe { release_buffer(buf, release, free) };
            }
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let free = match header.release {
        ReleaseMode::Static => None,
        ReleaseMode::Exported => Some(
            resolve_free().ok_or_else(|| LoadError::MissingSymbol(BUFFER_FREE_SYMBOL.into()))?,
        ),
    };

    let bytes = unsafe { take_buffer(buf, header.release, free, MAX_MANIFEST_BYTES) }
        .map_err(LoadError::MalformedManifest)?;
    let (_, document) = ManifestDocument::decode(&bytes, ABI_VERSION)?;

    if document.id.trim().is_empty() {
        return Err(LoadError::MalformedManifest("empty plugin id".into()));
    }
    Ok((PluginManifest::from_document(document, header.release), free))
}
