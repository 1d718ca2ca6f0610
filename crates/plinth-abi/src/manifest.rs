//! Manifest wire format.
//!
//! A manifest is a fixed 12-byte header followed by a UTF-8 JSON document:
//!
//! ```text
//! 0..4   magic "PLNT"
//! 4..8   ABI version, u32 little endian
//! 8      buffer release mode (0 = static, 1 = exported free function)
//! 9..12  reserved, zero
//! 12..   JSON ManifestDocument
//! ```
//!
//! The version is read before anything else. A reader that sees a version it
//! does not understand must stop there: the rest of the buffer may follow a
//! different layout.

use serde::{Deserialize, Serialize};

use crate::error::AbiError;
use crate::ABI_VERSION;

pub const MANIFEST_MAGIC: &[u8; 4] = b"PLNT";

pub const MANIFEST_HEADER_LEN: usize = 12;

const VERSION_END: usize = 8;

/// Offset of the release-mode byte, directly after the version tag.
pub const RELEASE_MODE_OFFSET: usize = VERSION_END;

/// How the host must release buffers produced by an artifact.
///
/// Declared once per artifact in the manifest header and applied to every
/// buffer that artifact hands out, the manifest buffer included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReleaseMode {
    /// Buffers point at memory that lives as long as the library. The host
    /// copies and never releases them.
    Static = 0,
    /// Every buffer is released by passing it back to the artifact's own
    /// `plinth_buffer_free`.
    Exported = 1,
}

impl ReleaseMode {
    pub fn from_byte(byte: u8) -> Result<Self, AbiError> {
        match byte {
            0 => Ok(Self::Static),
            1 => Ok(Self::Exported),
            other => Err(AbiError::UnknownReleaseMode(other)),
        }
    }
}

/// Decoded fixed-size manifest header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestHeader {
    pub version: u32,
    pub release: ReleaseMode,
}

impl ManifestHeader {
    /// Read only the magic and the version tag.
    ///
    /// This never looks past byte 8, so it is safe to call on a buffer built
    /// against any ABI revision.
    pub fn read_version(bytes: &[u8]) -> Result<u32, AbiError> {
        if bytes.len() < VERSION_END {
            return Err(AbiError::Truncated {
                len: bytes.len(),
                needed: VERSION_END,
            });
        }
        if &bytes[..4] != MANIFEST_MAGIC {
            return Err(AbiError::BadMagic);
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..VERSION_END]);
        Ok(u32::from_le_bytes(version))
    }

    /// Parse the header, rejecting any version other than `expected` before
    /// the release mode byte is interpreted.
    pub fn parse(bytes: &[u8], expected: u32) -> Result<Self, AbiError> {
        let version = Self::read_version(bytes)?;
        if version != expected {
            return Err(AbiError::VersionMismatch {
                found: version,
                expected,
            });
        }
        if bytes.len() < MANIFEST_HEADER_LEN {
            return Err(AbiError::Truncated {
                len: bytes.len(),
                needed: MANIFEST_HEADER_LEN,
            });
        }
        let release = ReleaseMode::from_byte(bytes[RELEASE_MODE_OFFSET])?;
        Ok(Self { version, release })
    }
}

/// One route a plugin serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDeclaration {
    /// HTTP method, case-insensitive.
    pub method: String,
    /// Path pattern: literal segments and `:name` parameters.
    pub path: String,
    /// Exported handler symbol in the same artifact.
    pub symbol: String,
}

impl RouteDeclaration {
    pub fn new(method: &str, path: &str, symbol: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

/// The self-describing part of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Whether the artifact embeds a UI bundle.
    #[serde(default)]
    pub bundle: bool,
    #[serde(default)]
    pub bundle_content_type: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteDeclaration>,
}

impl ManifestDocument {
    /// Decode a full manifest buffer (header + JSON) built for `expected`.
    pub fn decode(bytes: &[u8], expected: u32) -> Result<(ManifestHeader, Self), AbiError> {
        let header = ManifestHeader::parse(bytes, expected)?;
        let document = serde_json::from_slice(&bytes[MANIFEST_HEADER_LEN..])?;
        Ok((header, document))
    }
}

/// Encode a manifest for the current [`ABI_VERSION`].
pub fn encode_manifest(
    document: &ManifestDocument,
    release: ReleaseMode,
) -> Result<Vec<u8>, AbiError> {
    encode_manifest_with_version(document, release, ABI_VERSION)
}

/// Encode a manifest with an explicit version tag.
///
/// Only useful for producing artifacts that target another host revision.
pub fn encode_manifest_with_version(
    document: &ManifestDocument,
    release: ReleaseMode,
    version: u32,
) -> Result<Vec<u8>, AbiError> {
    let json = serde_json::to_vec(document)?;
    let mut out = Vec::with_capacity(MANIFEST_HEADER_LEN + json.len());
    out.extend_from_slice(MANIFEST_MAGIC);
    out.extend_from_slice(&version.to_le_bytes());
    out.push(release as u8);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&json);
    Ok(out)
}
