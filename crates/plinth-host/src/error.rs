//! Plugin host error types.
//!
//! Failures are scoped: a [`DiscoveryError`] on the plugin root stops the
//! host, everything else ([`LoadError`], [`DispatchError`], [`UnloadError`])
//! is isolated to one artifact or one request.

use std::path::PathBuf;

use plinth_abi::AbiError;
use thiserror::Error;

/// Filesystem failures while scanning the plugin directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("plugin directory {path} is unreadable: {reason}")]
    UnreadableRoot { path: PathBuf, reason: String },

    #[error("artifact {path} is unreadable: {reason}")]
    UnreadableFile { path: PathBuf, reason: String },
}

/// Per-artifact load failures. Never fatal to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to open library: {0}")]
    Open(String),

    #[error("missing required symbol `{0}`")]
    MissingSymbol(String),

    #[error("ABI version mismatch: plugin declares {found}, host expects {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("manifest id `{manifest}` does not match artifact identity `{artifact}`")]
    IdentityMismatch { manifest: String, artifact: String },

    #[error("io error: {0}")]
    Io(String),
}

impl From<AbiError> for LoadError {
    fn from(err: AbiError) -> Self {
        match err {
            AbiError::VersionMismatch { found, expected } => {
                LoadError::VersionMismatch { found, expected }
            }
            other => LoadError::MalformedManifest(other.to_string()),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err.to_string())
    }
}

/// Per-request dispatch failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("plugin {plugin} did not respond within {timeout_ms} ms")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("plugin {plugin} handler fault: {reason}")]
    HandlerFault { plugin: String, reason: String },
}

/// Failures while unmapping a drained library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnloadError {
    #[error("failed to close library for {plugin}: {reason}")]
    CloseFailed { plugin: String, reason: String },
}

/// Registry-level errors.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin host is shut down")]
    ShutDown,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_unreadable_root() {
        let err = DiscoveryError::UnreadableRoot {
            path: PathBuf::from("/srv/plugins"),
            reason: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "plugin directory /srv/plugins is unreadable: permission denied"
        );
    }

    #[test]
    fn test_display_missing_symbol() {
        let err = LoadError::MissingSymbol("plinth_manifest_v1".into());
        assert_eq!(err.to_string(), "missing required symbol `plinth_manifest_v1`");
    }

    #[test]
    fn test_display_version_mismatch() {
        let err = LoadError::VersionMismatch {
            found: 2,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "ABI version mismatch: plugin declares 2, host expects 1"
        );
    }

    #[test]
    fn test_display_identity_mismatch() {
        let err = LoadError::IdentityMismatch {
            manifest: "clock".into(),
            artifact: "weather".into(),
        };
        assert_eq!(
            err.to_string(),
            "manifest id `clock` does not match artifact identity `weather`"
        );
    }

    #[test]
    fn test_display_not_found_route() {
        let err = DispatchError::NotFound {
            method: "GET".into(),
            path: "/clock/now".into(),
        };
        assert_eq!(err.to_string(), "no route for GET /clock/now");
    }

    #[test]
    fn test_display_timeout() {
        let err = DispatchError::Timeout {
            plugin: "slow".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "plugin slow did not respond within 250 ms");
    }

    #[test]
    fn test_display_handler_fault() {
        let err = DispatchError::HandlerFault {
            plugin: "weather".into(),
            reason: "handler panicked: boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "plugin weather handler fault: handler panicked: boom"
        );
    }

    #[test]
    fn test_display_close_failed() {
        let err = UnloadError::CloseFailed {
            plugin: "weather".into(),
            reason: "dlclose failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to close library for weather: dlclose failed"
        );
    }

    #[test]
    fn test_display_host_not_found() {
        let err = HostError::NotFound("ghost".into());
        assert_eq!(err.to_string(), "plugin not found: ghost");
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_abi_version_mismatch() {
        let err: LoadError = AbiError::VersionMismatch {
            found: 9,
            expected: 1,
        }
        .into();
        assert_eq!(
            err,
            LoadError::VersionMismatch {
                found: 9,
                expected: 1
            }
        );
    }

    #[test]
    fn test_from_abi_bad_magic_is_malformed() {
        let err: LoadError = AbiError::BadMagic.into();
        assert!(matches!(err, LoadError::MalformedManifest(_)));
    }

    #[test]
    fn test_from_io_error() {
        let err: LoadError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, LoadError::Io("gone".into()));
    }

    #[test]
    fn test_from_discovery_error() {
        let err: HostError = DiscoveryError::UnreadableRoot {
            path: PathBuf::from("/nope"),
            reason: "missing".into(),
        }
        .into();
        assert!(matches!(err, HostError::Discovery(_)));
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("[[[broken").unwrap_err();
        let err: HostError = toml_err.into();
        assert!(err.to_string().starts_with("TOML parse error"));
    }
}
