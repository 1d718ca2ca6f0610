//! Artifact scanner: classifies the contents of the plugin directory.
//!
//! The scan is a pure function of the directory contents: entries are sorted
//! by identity and every readable artifact carries a blake3 fingerprint of its
//! bytes, so scanning an unchanged directory twice yields equal results.

use std::collections::BTreeMap;
use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::DiscoveryError;

/// Extensions recognized as script-only artifacts.
pub const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    NativeBinary,
    ScriptBundle,
}

/// One plugin artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredArtifact {
    /// Identity derived from the file name.
    pub id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Hex blake3 of the file contents, or why the file could not be read.
    pub fingerprint: Result<String, DiscoveryError>,
}

/// A directory entry that looked like a plugin but was not taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Sorted by identity; at most one artifact per identity.
    pub artifacts: Vec<DiscoveredArtifact>,
    pub skipped: Vec<SkippedEntry>,
}

/// Classify a file name. Returns `None` for anything that is not a plugin.
pub fn classify(file_name: &str) -> Option<(String, ArtifactKind)> {
    if file_name.starts_with('.') {
        return None;
    }
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }

    if extension == DLL_EXTENSION {
        let id = match stem.strip_prefix(DLL_PREFIX) {
            Some(rest) if !DLL_PREFIX.is_empty() && !rest.is_empty() => rest,
            _ => stem,
        };
        return Some((id.to_string(), ArtifactKind::NativeBinary));
    }
    if SCRIPT_EXTENSIONS.contains(&extension) {
        return Some((stem.to_string(), ArtifactKind::ScriptBundle));
    }
    None
}

/// Hex blake3 of a file's contents.
pub fn fingerprint(path: &Path) -> Result<String, DiscoveryError> {
    std::fs::read(path)
        .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
        .map_err(|e| DiscoveryError::UnreadableFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Scan `dir` (non-recursively) for plugin artifacts.
///
/// An unreadable `dir` is fatal. Unreadable individual files are reported
/// through [`DiscoveredArtifact::fingerprint`].
pub fn scan(dir: &Path) -> Result<ScanResult, DiscoveryError> {
    let unreadable_root = |e: std::io::Error| DiscoveryError::UnreadableRoot {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };

    let mut candidates: Vec<(String, ArtifactKind, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable_root)? {
        let entry = entry.map_err(unreadable_root)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((id, kind)) = classify(file_name) {
            candidates.push((id, kind, path));
        }
    }
    // Natives before scripts, then by file name, so shadowing is deterministic.
    candidates.sort_by(|a, b| {
        (a.1 == ArtifactKind::ScriptBundle, &a.2).cmp(&(b.1 == ArtifactKind::ScriptBundle, &b.2))
    });

    let mut by_id: BTreeMap<String, DiscoveredArtifact> = BTreeMap::new();
    let mut skipped = Vec::new();
    for (id, kind, path) in candidates {
        if let Some(existing) = by_id.get(&id) {
            let reason = match (existing.kind, kind) {
                (ArtifactKind::NativeBinary, ArtifactKind::ScriptBundle) => {
                    format!("shadowed by native artifact {}", existing.path.display())
                }
                _ => format!(
                    "duplicate identity `{id}`, already provided by {}",
                    existing.path.display()
                ),
            };
            tracing::debug!(path = %path.display(), "{reason}");
            skipped.push(SkippedEntry { path, reason });
            continue;
        }
        let fingerprint = fingerprint(&path);
        if let Err(e) = &fingerprint {
            tracing::warn!(plugin = %id, "{e}");
        }
        by_id.insert(
            id.clone(),
            DiscoveredArtifact {
                id,
                kind,
                path,
                fingerprint,
            },
        );
    }

    Ok(ScanResult {
        artifacts: by_id.into_values().collect(),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_name(id: &str) -> String {
        format!("{DLL_PREFIX}{id}.{DLL_EXTENSION}")
    }

    // ── classify ──────────────────────────────────────────────────────

    #[test]
    fn test_classify_native() {
        assert_eq!(
            classify(&native_name("weather")),
            Some(("weather".to_string(), ArtifactKind::NativeBinary))
        );
        assert_eq!(
            classify(&format!("weather.{DLL_EXTENSION}")),
            Some(("weather".to_string(), ArtifactKind::NativeBinary))
        );
    }

    #[test]
    fn test_classify_scripts() {
        assert_eq!(
            classify("clock.js"),
            Some(("clock".to_string(), ArtifactKind::ScriptBundle))
        );
        assert_eq!(
            classify("clock.mjs"),
            Some(("clock".to_string(), ArtifactKind::ScriptBundle))
        );
    }

    #[test]
    fn test_classify_ignores_other_files() {
        assert_eq!(classify("README.md"), None);
        assert_eq!(classify(".hidden.js"), None);
        assert_eq!(classify("noextension"), None);
        assert_eq!(classify(".js"), None);
    }

    // ── scan ──────────────────────────────────────────────────────────

    #[test]
    fn test_scan_sorted_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zeta.js"), b"z").unwrap();
        std::fs::write(dir.path().join(native_name("alpha")), b"a").unwrap();
        std::fs::write(dir.path().join("mid.mjs"), b"m").unwrap();

        let result = scan(dir.path()).unwrap();
        let ids: Vec<&str> = result.artifacts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert_eq!(result.artifacts[0].kind, ArtifactKind::NativeBinary);
        assert_eq!(result.artifacts[1].kind, ArtifactKind::ScriptBundle);
    }

    #[test]
    fn test_scan_ignores_dirs_hidden_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested.js")).unwrap();
        std::fs::write(dir.path().join(".cache.js"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let result = scan(dir.path()).unwrap();
        assert!(result.artifacts.is_empty());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_scan_native_shadows_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(native_name("weather")), b"elf").unwrap();
        std::fs::write(dir.path().join("weather.js"), b"ui").unwrap();

        let result = scan(dir.path()).unwrap();
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].kind, ArtifactKind::NativeBinary);
        assert_eq!(result.skipped.len(), 1);
        assert!(result.skipped[0].reason.starts_with("shadowed by native"));
    }

    #[test]
    fn test_scan_duplicate_script_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clock.js"), b"a").unwrap();
        std::fs::write(dir.path().join("clock.mjs"), b"b").unwrap();

        let result = scan(dir.path()).unwrap();
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].path, dir.path().join("clock.js"));
        assert!(result.skipped[0].reason.contains("duplicate identity"));
    }

    #[test]
    fn test_scan_fingerprints_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clock.js"), b"tick").unwrap();

        let first = scan(dir.path()).unwrap();
        let second = scan(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.artifacts[0].fingerprint.as_deref(),
            Ok(blake3::hash(b"tick").to_hex().as_str())
        );
    }

    #[test]
    fn test_scan_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.js");
        std::fs::write(&path, b"v1").unwrap();
        let before = scan(dir.path()).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let after = scan(dir.path()).unwrap();
        assert_ne!(
            before.artifacts[0].fingerprint,
            after.artifacts[0].fingerprint
        );
    }

    #[test]
    fn test_scan_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let err = scan(&missing).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnreadableRoot { .. }));
    }

    #[test]
    fn test_fingerprint_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint(&dir.path().join("gone.js")).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnreadableFile { .. }));
    }
}
