//! Configuration management for chainview

use crate::error::ViewError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Inner notification threads used unless the role or config says otherwise
pub const DEFAULT_INNER_THREAD_COUNT: usize = 2;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_network_id")]
    pub network_id: String,
    /// When set, the `shutdown` command must carry this value as its first argument
    #[serde(default)]
    pub shutdown_cookie: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network_id: default_network_id(),
            shutdown_cookie: None,
            log_level: default_log_level(),
        }
    }
}

/// Role of the node the server runs against.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Bare,
    #[default]
    Full,
    /// Full-archival database; inner notification pool scales with the host
    Super,
    UnitTest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub node_role: NodeRole,
    #[serde(default)]
    pub inner_thread_count: Option<usize>,
    #[serde(default = "default_enabled")]
    pub enable_garbage_collector: bool,
    #[serde(default = "default_gc_interval", with = "duration_str")]
    pub gc_interval: Duration,
    #[serde(default = "default_poll_timeout", with = "duration_str")]
    pub callback_poll_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_role: NodeRole::default(),
            inner_thread_count: None,
            enable_garbage_collector: default_enabled(),
            gc_interval: default_gc_interval(),
            callback_poll_timeout: default_poll_timeout(),
        }
    }
}

impl RegistryConfig {
    /// Config preset for tests: unit-test role, no garbage collector.
    pub fn unit_test() -> Self {
        Self {
            node_role: NodeRole::UnitTest,
            enable_garbage_collector: false,
            callback_poll_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Validate and resolve the knobs the registry is built from.
    pub fn resolve(&self) -> Result<RegistrySettings, ViewError> {
        if self.inner_thread_count == Some(0) {
            return Err(ViewError::Config(
                "registry.inner_thread_count must be at least 1".to_string(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(ViewError::Config(
                "registry.gc_interval must be non-zero".to_string(),
            ));
        }
        if self.callback_poll_timeout.is_zero() {
            return Err(ViewError::Config(
                "registry.callback_poll_timeout must be non-zero".to_string(),
            ));
        }

        let (inner_thread_count, enable_garbage_collector) = match self.node_role {
            NodeRole::UnitTest => (DEFAULT_INNER_THREAD_COUNT, false),
            NodeRole::Super => (
                self.inner_thread_count.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(DEFAULT_INNER_THREAD_COUNT)
                }),
                self.enable_garbage_collector,
            ),
            NodeRole::Bare | NodeRole::Full => (
                self.inner_thread_count.unwrap_or(DEFAULT_INNER_THREAD_COUNT),
                self.enable_garbage_collector,
            ),
        };

        Ok(RegistrySettings {
            node_role: self.node_role,
            inner_thread_count,
            enable_garbage_collector,
            gc_interval: self.gc_interval,
            callback_poll_timeout: self.callback_poll_timeout,
        })
    }
}

/// Validated registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub node_role: NodeRole,
    pub inner_thread_count: usize,
    pub enable_garbage_collector: bool,
    pub gc_interval: Duration,
    pub callback_poll_timeout: Duration,
}

/// Durations are written as humantime strings ("60s", "5m").
mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    // Missing or empty file falls back to defaults
    let config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    if config.server.network_id.is_empty() {
        return Err("server.network_id must be set in config.toml".into());
    }
    config.registry.resolve()?;

    Ok(config)
}

fn default_network_id() -> String {
    "mainnet".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.server.network_id, "mainnet");
        assert_eq!(config.registry.node_role, NodeRole::Full);
        assert_eq!(config.registry.gc_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[server]\nnetwork_id = \"testnet\"\nshutdown_cookie = \"abc\"\n\n\
             [registry]\nnode_role = \"super\"\ninner_thread_count = 6\ngc_interval = \"5m\""
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.network_id, "testnet");
        assert_eq!(config.server.shutdown_cookie.as_deref(), Some("abc"));
        let settings = config.registry.resolve().unwrap();
        assert_eq!(settings.node_role, NodeRole::Super);
        assert_eq!(settings.inner_thread_count, 6);
        assert_eq!(settings.gc_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_unit_test_role_forces_small_pool_and_no_gc() {
        let config = RegistryConfig {
            node_role: NodeRole::UnitTest,
            inner_thread_count: Some(16),
            enable_garbage_collector: true,
            ..RegistryConfig::default()
        };
        let settings = config.resolve().unwrap();
        assert_eq!(settings.inner_thread_count, DEFAULT_INNER_THREAD_COUNT);
        assert!(!settings.enable_garbage_collector);
    }

    #[test]
    fn test_super_role_scales_with_host() {
        let config = RegistryConfig {
            node_role: NodeRole::Super,
            ..RegistryConfig::default()
        };
        let settings = config.resolve().unwrap();
        assert!(settings.inner_thread_count >= 1);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = RegistryConfig {
            inner_thread_count: Some(0),
            ..RegistryConfig::default()
        };
        assert!(matches!(config.resolve(), Err(ViewError::Config(_))));
    }
}
