//! Configuration management for Gatekeeper.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::Algorithm;

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Limiter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Which limiter store to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process token buckets
    #[default]
    Memory,
    /// Shared state in Redis
    Redis,
}

/// Limiter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: Backend,

    /// Settings for the in-memory store
    #[serde(default)]
    pub memory: MemoryStoreConfig,

    /// Settings for the Redis store
    #[serde(default)]
    pub redis: RedisStoreConfig,
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Janitor sweep interval and idle eviction threshold, in seconds.
    ///
    /// Must be at least as long as the longest normal gap between requests
    /// for a key, or active buckets get evicted and come back full.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

fn default_idle_ttl() -> u64 {
    600
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every rate limit key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Window length of the fixed window algorithm, in seconds
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Algorithm to apply
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Deadline for one round trip to Redis, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Deadline for establishing the connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl(),
            algorithm: Algorithm::default(),
            timeout_ms: default_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RedisStoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(GatekeeperError::Config("redis url must not be empty".to_string()));
        }
        if self.default_ttl_secs == 0 {
            return Err(GatekeeperError::Config(
                "redis default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "redis timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "redis connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_ttl() -> u64 {
    60
}

fn default_timeout() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    2_000
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file, with `GATEKEEPER__*` environment
    /// variables layered on top (e.g. `GATEKEEPER__STORE__BACKEND=redis`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: GatekeeperConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix("GATEKEEPER").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the stores would reject.
    pub fn validate(&self) -> Result<()> {
        if self.store.memory.idle_ttl_secs == 0 {
            return Err(GatekeeperError::Config(
                "memory idle_ttl_secs must be greater than zero".to_string(),
            ));
        }
        self.store.redis.validate()
    }
}
