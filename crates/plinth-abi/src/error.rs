//! Decoding errors for data crossing the plugin boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("buffer truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("bad manifest magic: not a plinth plugin")]
    BadMagic,

    #[error("ABI version mismatch: plugin declares {found}, host expects {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("unknown buffer release mode: {0}")]
    UnknownReleaseMode(u8),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
