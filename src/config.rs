//! Engine configuration
//!
//! Defaults match the legacy runtime. `from_env` reads `ADO_*` variables after
//! loading a `.env` file; malformed values quietly keep the default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How desktop-file descriptors pick their provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMode {
    /// Force the host's default desktop provider
    Auto,
    /// Keep the provider named in the descriptor
    Keep,
}

#[derive(Debug, Clone)]
pub struct DataAccessConfig {
    /// Ping timeout applied when a wire connection is opened
    pub ping_timeout: Duration,
    pub default_page_size: i64,
    pub bridge_mode: BridgeMode,
    pub embedded_default_path: PathBuf,
    /// Upper bound for statements prepared without an explicit timeout
    pub statement_timeout: Option<Duration>,
}

impl Default for DataAccessConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            default_page_size: 10,
            bridge_mode: BridgeMode::Auto,
            embedded_default_path: PathBuf::from("./database.db"),
            statement_timeout: None,
        }
    }
}

impl DataAccessConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
        };

        if let Some(timeout) = secs("ADO_PING_TIMEOUT_SECS") {
            config.ping_timeout = timeout;
        }
        if let Some(timeout) = secs("ADO_STATEMENT_TIMEOUT_SECS") {
            config.statement_timeout = Some(timeout);
        }
        if let Some(size) = lookup("ADO_PAGE_SIZE").and_then(|v| v.trim().parse::<i64>().ok()) {
            if size > 0 {
                config.default_page_size = size;
            }
        }
        if let Some(mode) = lookup("ADO_BRIDGE_PROVIDER") {
            config.bridge_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "keep" | "descriptor" => BridgeMode::Keep,
                _ => BridgeMode::Auto,
            };
        }
        if let Some(path) = lookup("ADO_EMBEDDED_PATH").filter(|p| !p.trim().is_empty()) {
            config.embedded_default_path = PathBuf::from(path.trim());
        }
        config
    }
}

/// Reads `<PREFIX>_<NAME>` from the environment with a default
pub(crate) fn env_or(prefix: &str, name: &str, default: &str) -> String {
    env::var(format!("{prefix}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DataAccessConfig::default();
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.bridge_mode, BridgeMode::Auto);
        assert!(config.statement_timeout.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = DataAccessConfig::from_lookup(lookup(&[
            ("ADO_PING_TIMEOUT_SECS", "2"),
            ("ADO_PAGE_SIZE", "25"),
            ("ADO_BRIDGE_PROVIDER", "KEEP"),
            ("ADO_STATEMENT_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.default_page_size, 25);
        assert_eq!(config.bridge_mode, BridgeMode::Keep);
        assert_eq!(config.statement_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let config = DataAccessConfig::from_lookup(lookup(&[
            ("ADO_PING_TIMEOUT_SECS", "soon"),
            ("ADO_PAGE_SIZE", "-4"),
        ]));
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.default_page_size, 10);
    }
}
