//! Host configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, the
//! `[host]` table of the TOML file named by `PLINTH_CONFIG`, and `PLINTH_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::HostError;

/// Environment variable naming the optional TOML config file.
pub const CONFIG_FILE_ENV: &str = "PLINTH_CONFIG";

/// Configuration for [`PluginHost`](crate::PluginHost).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned for plugin artifacts (default: `./plugins`).
    pub plugin_dir: PathBuf,
    /// Upper bound on a single dispatched call (default: 5000 ms).
    pub handler_timeout_ms: u64,
    /// Concurrent calls allowed into one plugin (default: 16).
    pub max_concurrent_calls: usize,
    /// How long an explicit unload waits for in-flight calls (default: 5000 ms).
    pub drain_timeout_ms: u64,
    /// Watch the plugin directory and rescan on change (default: true).
    pub watch: bool,
    /// Filesystem events within this window are coalesced (default: 500 ms).
    pub watch_debounce_ms: u64,
    /// Interval at which pending drains are retried (default: 1000 ms).
    pub retire_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            handler_timeout_ms: 5_000,
            max_concurrent_calls: 16,
            drain_timeout_ms: 5_000,
            watch: true,
            watch_debounce_ms: 500,
            retire_interval_ms: 1_000,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Full layered load: defaults, then the `PLINTH_CONFIG` file, then env.
    pub fn load() -> Result<Self, HostError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => read_config_table::<Self>(Path::new(&path), "host")?.unwrap_or_default(),
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `PLINTH_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("PLINTH_PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_HANDLER_TIMEOUT_MS") {
            self.handler_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_MAX_CONCURRENT_CALLS") {
            self.max_concurrent_calls = v;
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = v;
        }
        if let Some(v) = lookup("PLINTH_WATCH") {
            self.watch = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_WATCH_DEBOUNCE_MS") {
            self.watch_debounce_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PLINTH_RETIRE_INTERVAL_MS") {
            self.retire_interval_ms = v;
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn retire_interval(&self) -> Duration {
        Duration::from_millis(self.retire_interval_ms.max(1))
    }

    /// A concurrency cap of zero would make every call time out.
    pub fn call_permits(&self) -> usize {
        self.max_concurrent_calls.max(1)
    }
}

/// Parse an environment value, ignoring it when it does not parse.
pub fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Read one top-level table of a TOML config file.
///
/// Returns `Ok(None)` when the file has no such table.
pub fn read_config_table<T: DeserializeOwned>(
    path: &Path,
    table: &str,
) -> Result<Option<T>, HostError> {
    let text = std::fs::read_to_string(path)?;
    let mut document: toml::Table = toml::from_str(&text)?;
    match document.remove(table) {
        Some(value) => Ok(Some(value.try_into::<T>()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.plugin_dir, PathBuf::from("plugins"));
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_calls, 16);
        assert!(config.watch);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HostConfig::default();
        config.apply_overrides(lookup_from(&[
            ("PLINTH_PLUGIN_DIR", "/srv/plugins"),
            ("PLINTH_HANDLER_TIMEOUT_MS", "250"),
            ("PLINTH_MAX_CONCURRENT_CALLS", "2"),
            ("PLINTH_DRAIN_TIMEOUT_MS", "100"),
            ("PLINTH_WATCH", "false"),
            ("PLINTH_WATCH_DEBOUNCE_MS", "50"),
            ("PLINTH_RETIRE_INTERVAL_MS", "750"),
        ]));
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.handler_timeout_ms, 250);
        assert_eq!(config.max_concurrent_calls, 2);
        assert_eq!(config.drain_timeout_ms, 100);
        assert!(!config.watch);
        assert_eq!(config.watch_debounce_ms, 50);
        assert_eq!(config.retire_interval_ms, 750);
        assert_eq!(config.retire_interval(), Duration::from_millis(750));
    }

    #[test]
    fn test_unparseable_override_keeps_value() {
        let mut config = HostConfig::default();
        config.apply_overrides(lookup_from(&[("PLINTH_HANDLER_TIMEOUT_MS", "soon")]));
        assert_eq!(config.handler_timeout_ms, 5_000);
    }

    #[test]
    fn test_watch_accepts_one() {
        let mut config = HostConfig {
            watch: false,
            ..Default::default()
        };
        config.apply_overrides(lookup_from(&[("PLINTH_WATCH", "1")]));
        assert!(config.watch);
    }

    #[test]
    fn test_zero_permits_clamped() {
        let config = HostConfig {
            max_concurrent_calls: 0,
            ..Default::default()
        };
        assert_eq!(config.call_permits(), 1);
    }

    #[test]
    fn test_read_config_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[host]\nplugin_dir = \"/opt/plinth\"\nhandler_timeout_ms = 1000\n\n[server]\nbind = \"0.0.0.0:9000\""
        )
        .unwrap();

        let config: HostConfig = read_config_table(file.path(), "host").unwrap().unwrap();
        assert_eq!(config.plugin_dir, PathBuf::from("/opt/plinth"));
        assert_eq!(config.handler_timeout_ms, 1000);
        // Unset keys keep their defaults.
        assert_eq!(config.max_concurrent_calls, 16);
    }

    #[test]
    fn test_read_config_missing_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"0.0.0.0:9000\"").unwrap();
        let config: Option<HostConfig> = read_config_table(file.path(), "host").unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn test_read_config_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[host\nplugin_dir = ").unwrap();
        let err = read_config_table::<HostConfig>(file.path(), "host").unwrap_err();
        assert!(matches!(err, HostError::TomlParse(_)));
    }
}
