//! HTTP server configuration.
//!
//! Layered like the host configuration: defaults, then the `[server]` table
//! of the `PLINTH_CONFIG` file, then `PLINTH_*` environment variables.

use std::net::SocketAddr;
use std::path::Path;

use plinth_host::config::{parse_var, read_config_table, CONFIG_FILE_ENV};
use plinth_host::HostError;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (default: `0.0.0.0:8080`).
    pub bind: SocketAddr,
    /// Largest request body forwarded to a plugin (default: 16 MiB).
    pub max_body_bytes: usize,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 16 * 1024 * 1024,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Like [`from_env`](Self::from_env), with the `[server]` table of the
    /// `PLINTH_CONFIG` file as the base.
    pub fn load() -> Result<Self, HostError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => read_config_table::<Self>(Path::new(&path), "server")?.unwrap_or_default(),
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, "PLINTH_BIND") {
            self.bind = v;
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_MAX_BODY_BYTES") {
            self.max_body_bytes = v;
        }
        if let Some(v) = lookup("PLINTH_CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}
