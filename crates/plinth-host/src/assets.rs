//! Asset extractor and UI bundle cache.
//!
//! Native plugins embed their bundle and hand it out through
//! `plinth_bundle`; script plugins are the bundle. Either way the host keeps
//! its own copy, keyed by plugin id, and consumers never see the difference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use bytes::Bytes;
use plinth_abi::{BufferFreeFn, BundleFn, HasBundleFn, BUNDLE_SYMBOL, HAS_BUNDLE_SYMBOL};
use serde::Serialize;

use crate::error::LoadError;
use crate::manifest::PluginManifest;
use crate::native::{cast_symbol, take_buffer, NativeLibrary};

/// Bundles larger than this are rejected.
pub const MAX_BUNDLE_BYTES: usize = 64 * 1024 * 1024;

/// Content type used when a manifest does not declare one.
pub const DEFAULT_BUNDLE_CONTENT_TYPE: &str = "text/javascript; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    /// Returned by a native artifact's bundle accessor.
    Embedded,
    /// Read from a script artifact on disk.
    ScriptFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiBundle {
    pub bytes: Bytes,
    pub content_type: String,
    pub source: BundleSource,
}

/// Read a script artifact as its own bundle.
pub fn read_script_bundle(path: &Path) -> Result<UiBundle, LoadError> {
    let bytes = std::fs::read(path)?;
    Ok(UiBundle {
        bytes: Bytes::from(bytes),
        content_type: DEFAULT_BUNDLE_CONTENT_TYPE.to_string(),
        source: BundleSource::ScriptFile,
    })
}

/// Pull the embedded bundle out of a native library.
///
/// Mismatches between the manifest flag and the presence check are logged
/// and yield no bundle; they never fail the load.
///
/// # Safety
///
/// `library` must be the library `manifest` and `free` were obtained from.
pub unsafe fn extract_native_bundle(
    library: &dyn NativeLibrary,
    manifest: &PluginManifest,
    free: Option<BufferFreeFn>,
) -> Option<UiBundle> {
    let present = match library.symbol(HAS_BUNDLE_SYMBOL) {
        Some(address) => {
            let has_bundle: HasBundleFn = unsafe { cast_symbol(address) };
            unsafe { has_bundle() }
        }
        None => false,
    };

    match (manifest.has_bundle, present) {
        (false, false) => return None,
        (true, false) => {
            tracing::warn!(plugin = %manifest.id, "manifest declares a bundle but none is present");
            return None;
        }
        (false, true) => {
            tracing::warn!(plugin = %manifest.id, "bundle present but not declared in manifest, ignoring");
            return None;
        }
        (true, true) => {}
    }

    let Some(address) = library.symbol(BUNDLE_SYMBOL) else {
        tracing::warn!(plugin = %manifest.id, symbol = BUNDLE_SYMBOL, "bundle accessor missing");
        return None;
    };
    let bundle: BundleFn = unsafe { cast_symbol(address) };
    let buf = unsafe { bundle() };
    match unsafe { take_buffer(buf, manifest.release, free, MAX_BUNDLE_BYTES) } {
        Ok(bytes) => Some(UiBundle {
            bytes: Bytes::from(bytes),
            content_type: manifest
                .bundle_content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_BUNDLE_CONTENT_TYPE.to_string()),
            source: BundleSource::Embedded,
        }),
        Err(reason) => {
            tracing::warn!(plugin = %manifest.id, "invalid bundle buffer: {reason}");
            None
        }
    }
}

/// Host-owned bundle copies keyed by plugin id.
#[derive(Debug, Default)]
pub struct AssetCache {
    bundles: RwLock<HashMap<String, UiBundle>>,
}

impl AssetCache {
    pub fn get(&self, id: &str) -> Option<UiBundle> {
        self.bundles.read().ok()?.get(id).cloned()
    }

    pub fn insert(&self, id: &str, bundle: UiBundle) {
        if let Ok(mut bundles) = self.bundles.write() {
            bundles.insert(id.to_string(), bundle);
        }
    }

    pub fn remove(&self, id: &str) -> Option<UiBundle> {
        self.bundles.write().ok()?.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bundles
            .read()
            .map(|b| b.contains_key(id))
            .unwrap_or(false)
    }

    /// Ids with a cached bundle, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bundles
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        if let Ok(mut bundles) = self.bundles.write() {
            bundles.clear();
        }
    }
}
