//! Native loader: turns a native artifact on disk into a fully resolved,
//! not yet published plugin generation.
//!
//! Loading order matters: the manifest accessor is resolved and its header
//! checked before anything else in the library is touched, and no route is
//! resolved until the manifest has been decoded and its identity verified.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use plinth_abi::{BufferFreeFn, HandlerFn, ManifestFn, BUFFER_FREE_SYMBOL, MANIFEST_SYMBOL};
use serde::Serialize;
use thiserror::Error;

use crate::assets::{extract_native_bundle, UiBundle};
use crate::error::LoadError;
use crate::manifest::{self, PluginManifest};
use crate::native::{cast_symbol, LibraryOpener, NativeArtifact};
use crate::routes::{normalize_method, HandlerReference, RouteEntry, RoutePattern};

/// Why a declared route was not registered.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropReason {
    #[error("handler symbol is not exported")]
    UnresolvedSymbol,

    #[error("invalid path pattern: {detail}")]
    InvalidPattern { detail: String },

    #[error("invalid HTTP method")]
    InvalidMethod,

    #[error("route declared twice in the same manifest")]
    DuplicateRoute,
}

/// A declared route that was dropped at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDiagnostic {
    pub plugin: String,
    pub method: String,
    pub path: String,
    pub symbol: String,
    pub reason: DropReason,
}

/// A loaded but unpublished native plugin generation.
#[derive(Debug)]
pub struct LoadedNative {
    pub manifest: PluginManifest,
    pub artifact: Arc<NativeArtifact>,
    /// Resolved routes in manifest order.
    pub routes: Vec<Arc<RouteEntry>>,
    pub diagnostics: Vec<RouteDiagnostic>,
    pub bundle: Option<UiBundle>,
}

/// Load the native artifact at `path`, expected to identify as `id`.
pub fn load_native(
    opener: &dyn LibraryOpener,
    id: &str,
    path: &Path,
    generation: u64,
    max_concurrent_calls: usize,
) -> Result<LoadedNative, LoadError> {
    let library = opener.open(path).map_err(LoadError::Open)?;

    let accessor = library
        .symbol(MANIFEST_SYMBOL)
        .ok_or_else(|| LoadError::MissingSymbol(MANIFEST_SYMBOL.into()))?;
    // SAFETY: the symbol name fixes the signature; the library stays open
    // for the whole extraction.
    let (manifest, free) = unsafe {
        let accessor: ManifestFn = cast_symbol(accessor);
        manifest::extract(accessor, || {
            library
                .symbol(BUFFER_FREE_SYMBOL)
                .map(|address| unsafe { cast_symbol::<BufferFreeFn>(address) })
        })?
    };

    if manifest.id != id {
        return Err(LoadError::IdentityMismatch {
            manifest: manifest.id,
            artifact: id.to_string(),
        });
    }

    // SAFETY: same library as the manifest and release function.
    let bundle = unsafe { extract_native_bundle(library.as_ref(), &manifest, free) };

    let mut resolved: Vec<(String, RoutePattern, String, HandlerFn)> = Vec::new();
    let mut diagnostics = Vec::new();
    let mut seen = HashSet::new();
    for declaration in &manifest.routes {
        let drop_route = |reason: DropReason| RouteDiagnostic {
            plugin: id.to_string(),
            method: declaration.method.clone(),
            path: declaration.path.clone(),
            symbol: declaration.symbol.clone(),
            reason,
        };

        let Some(method) = normalize_method(&declaration.method) else {
            diagnostics.push(drop_route(DropReason::InvalidMethod));
            continue;
        };
        let pattern = match RoutePattern::parse(&declaration.path) {
            Ok(pattern) => pattern,
            Err(e) => {
                diagnostics.push(drop_route(DropReason::InvalidPattern {
                    detail: e.to_string(),
                }));
                continue;
            }
        };
        if !seen.insert((method.clone(), pattern.shape())) {
            diagnostics.push(drop_route(DropReason::DuplicateRoute));
            continue;
        }
        let Some(address) = library.symbol(&declaration.symbol) else {
            diagnostics.push(drop_route(DropReason::UnresolvedSymbol));
            continue;
        };
        // SAFETY: route symbols are declared as handlers by the manifest.
        let handler: HandlerFn = unsafe { cast_symbol(address) };
        resolved.push((method, pattern, declaration.symbol.clone(), handler));
    }

    for diagnostic in &diagnostics {
        tracing::warn!(
            plugin = %id,
            symbol = %diagnostic.symbol,
            method = %diagnostic.method,
            path = %diagnostic.path,
            "route dropped: {}",
            diagnostic.reason
        );
    }

    let artifact = Arc::new(NativeArtifact::new(
        id.to_string(),
        generation,
        library,
        manifest.release,
        free,
        max_concurrent_calls,
    ));
    let routes = resolved
        .into_iter()
        .map(|(method, pattern, symbol, handler)| {
            Arc::new(RouteEntry {
                plugin: id.to_string(),
                method,
                pattern,
                symbol,
                handler: HandlerReference::new(handler, Arc::clone(&artifact)),
            })
        })
        .collect();

    Ok(LoadedNative {
        manifest,
        artifact,
        routes,
        diagnostics,
        bundle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, FakeLibrary, FakeOpener};
    use plinth_abi::ReleaseMode;

    fn artifact_path(id: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/plugins/{id}.{}", std::env::consts::DLL_EXTENSION))
    }

    #[test]
    fn test_load_weather() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather());

        let loaded = load_native(&opener, "weather", &artifact_path("weather"), 1, 4).unwrap();
        assert_eq!(loaded.manifest.id, "weather");
        assert_eq!(loaded.manifest.release, ReleaseMode::Exported);
        assert_eq!(loaded.routes.len(), 2);
        assert!(loaded.diagnostics.is_empty());
        assert_eq!(
            loaded.bundle.unwrap().bytes.as_ref(),
            fixtures::WEATHER_BUNDLE
        );
        let methods: Vec<&str> = loaded.routes.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, vec!["GET", "POST"]);
    }

    #[test]
    fn test_missing_manifest_symbol() {
        let opener = FakeOpener::new();
        opener.register("broken", FakeLibrary::new());

        let err = load_native(&opener, "broken", &artifact_path("broken"), 1, 4).unwrap_err();
        assert_eq!(err, LoadError::MissingSymbol(MANIFEST_SYMBOL.into()));
        // The library was dropped, not leaked.
        assert_eq!(opener.stats("broken").open_count(), 0);
    }

    #[test]
    fn test_open_failure() {
        let opener = FakeOpener::new();
        let err = load_native(&opener, "ghost", &artifact_path("ghost"), 1, 4).unwrap_err();
        assert!(matches!(err, LoadError::Open(_)));
    }

    #[test]
    fn test_identity_mismatch() {
        let opener = FakeOpener::new();
        opener.register("renamed", fixtures::weather());
        let err = load_native(&opener, "renamed", &artifact_path("renamed"), 1, 4).unwrap_err();
        assert_eq!(
            err,
            LoadError::IdentityMismatch {
                manifest: "weather".into(),
                artifact: "renamed".into()
            }
        );
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather_v2());
        let err = load_native(&opener, "weather", &artifact_path("weather"), 1, 4).unwrap_err();
        assert_eq!(
            err,
            LoadError::VersionMismatch {
                found: 2,
                expected: plinth_abi::ABI_VERSION
            }
        );
    }

    #[test]
    fn test_bad_routes_dropped_with_diagnostics() {
        let opener = FakeOpener::new();
        opener.register("sloppy", fixtures::sloppy());

        let loaded = load_native(&opener, "sloppy", &artifact_path("sloppy"), 1, 4).unwrap();
        assert_eq!(loaded.routes.len(), 1);
        assert_eq!(loaded.routes[0].pattern.as_str(), "/sloppy/ok");

        let reasons: Vec<&DropReason> = loaded.diagnostics.iter().map(|d| &d.reason).collect();
        assert_eq!(reasons.len(), 4);
        assert_eq!(reasons[0], &DropReason::UnresolvedSymbol);
        assert!(matches!(reasons[1], DropReason::InvalidPattern { .. }));
        assert_eq!(reasons[2], &DropReason::InvalidMethod);
        assert_eq!(reasons[3], &DropReason::DuplicateRoute);
        assert_eq!(loaded.diagnostics[0].symbol, "not_exported");
    }

    #[test]
    fn test_routes_hold_artifact() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather());
        let loaded = load_native(&opener, "weather", &artifact_path("weather"), 7, 4).unwrap();
        for route in &loaded.routes {
            assert!(Arc::ptr_eq(route.handler.artifact(), &loaded.artifact));
        }
        assert_eq!(loaded.artifact.generation(), 7);
    }
}
