//! Process configuration
//!
//! Defaults, then an optional JSON file named by `HOPDB_CONFIG`, then
//! `HOPDB_*` environment overrides.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Upper bound on automatically sized shard sets
const MAX_AUTO_SHARDS: usize = 16;

/// Server configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// memcached listener, `None` to disable
    pub memcache_port: Option<u16>,
    /// HTTP diagnostics listener, `None` to disable
    pub http_port: Option<u16>,
    /// 0 picks one shard per CPU core
    pub num_shards: usize,
    /// Route `{tag}` keys by their tag only
    pub lock_on_hashtags: bool,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            memcache_port: Some(11211),
            http_port: Some(8080),
            num_shards: 0,
            lock_on_hashtags: false,
            log_filter: "info".to_string(),
        }
    }
}

/// The part of the configuration fixed for the lifetime of the shard set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSetConfig {
    pub num_shards: usize,
    pub lock_on_hashtags: bool,
}

impl ServerConfig {
    /// Load from `HOPDB_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("HOPDB_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => ServerConfig::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read a JSON config file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `HOPDB_*` overrides looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("HOPDB_BIND") {
            self.bind = bind;
        }
        if let Some(value) = lookup("HOPDB_PORT") {
            self.port = parse_env("HOPDB_PORT", &value)?;
        }
        if let Some(value) = lookup("HOPDB_MEMCACHE_PORT") {
            self.memcache_port = parse_optional_port("HOPDB_MEMCACHE_PORT", &value)?;
        }
        if let Some(value) = lookup("HOPDB_HTTP_PORT") {
            self.http_port = parse_optional_port("HOPDB_HTTP_PORT", &value)?;
        }
        if let Some(value) = lookup("HOPDB_SHARDS") {
            self.num_shards = parse_env("HOPDB_SHARDS", &value)?;
        }
        if let Some(value) = lookup("HOPDB_HASHTAGS") {
            self.lock_on_hashtags = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "HOPDB_HASHTAGS",
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    /// Resolve the shard count (one per core when unset, at most 16)
    pub fn shard_set(&self) -> ShardSetConfig {
        let num_shards = match self.num_shards {
            0 => num_cpus::get().clamp(1, MAX_AUTO_SHARDS),
            n => n,
        };
        ShardSetConfig {
            num_shards,
            lock_on_hashtags: self.lock_on_hashtags,
        }
    }

    pub fn resp_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn memcache_addr(&self) -> Option<String> {
        self.memcache_port.map(|port| format!("{}:{}", self.bind, port))
    }

    pub fn http_addr(&self) -> Option<String> {
        self.http_port.map(|port| format!("{}:{}", self.bind, port))
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

fn parse_optional_port(name: &'static str, value: &str) -> Result<Option<u16>, ConfigError> {
    match value.trim() {
        "0" | "off" => Ok(None),
        port => parse_env(name, port).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.resp_addr(), "127.0.0.1:6379");
        assert_eq!(config.memcache_addr().as_deref(), Some("127.0.0.1:11211"));
        let shards = config.shard_set().num_shards;
        assert!((1..=MAX_AUTO_SHARDS).contains(&shards));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("HOPDB_PORT", "7000"),
                ("HOPDB_SHARDS", "3"),
                ("HOPDB_HTTP_PORT", "off"),
                ("HOPDB_HASHTAGS", "on"),
            ]))
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.http_addr(), None);
        assert_eq!(
            config.shard_set(),
            ShardSetConfig {
                num_shards: 3,
                lock_on_hashtags: true
            }
        );
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[("HOPDB_PORT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: "HOPDB_PORT", .. }));
    }

    #[test]
    fn test_partial_json() {
        let config: ServerConfig = serde_json::from_str(r#"{"port": 6400, "num_shards": 2}"#).unwrap();
        assert_eq!(config.port, 6400);
        assert_eq!(config.num_shards, 2);
        assert_eq!(config.bind, "127.0.0.1");
    }
}
