//! Typed configuration surface for a broker. Constructed programmatically by an embedder; this crate does
//! not parse CLI flags, environment variables, or files — that is outside
//! the core.
//!
//! NOTE: default values should make sense, so most embedders only need to
//! override `ns`, `clustername`, and `redis`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// LRU parameters for the broker's worker→address routing cache.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerCacheConfig {
    pub max: usize,
    pub max_age: Duration,
}

impl Default for BrokerCacheConfig {
    fn default() -> Self {
        Self {
            max: 10_000,
            max_age: Duration::from_secs(300),
        }
    }
}

/// Backoff policy for find/ask/tell retries.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            duration: Duration::from_secs(10),
        }
    }
}

/// Connection coordinates for the shared registry. An embedder may instead hand in
/// already-open client handles through `RegistryClient` directly; this
/// struct only covers the bring-your-own-coordinates path.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

/// The complete configuration surface recognized by the core.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Registry key prefix.
    #[serde(default = "Config::default_ns")]
    pub ns: String,
    /// Default cluster membership for this broker.
    pub clustername: String,
    /// Per-ask deadline.
    #[serde(default = "Config::default_rpc_timeout")]
    pub rpc_timeout: Duration,
    /// Maximum age a worker may have and still be recovered. `0` means
    /// unlimited.
    #[serde(default)]
    pub ttl: Duration,
    /// Max workers fetched per recovery iteration.
    #[serde(default = "Config::default_batch_read_size")]
    pub batch_read_size: usize,
    #[serde(default)]
    pub broker_cache: BrokerCacheConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    /// Router idle timeout; server side uses 2x this value.
    #[serde(default = "Config::default_soc_timeout")]
    pub soc_timeout: Duration,
    /// `0` disables the periodic health check.
    #[serde(default = "Config::default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Config {
    pub fn default_ns() -> String {
        "warden".to_string()
    }

    pub fn default_rpc_timeout() -> Duration {
        Duration::from_millis(3000)
    }

    pub fn default_batch_read_size() -> usize {
        16
    }

    pub fn default_soc_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_health_check_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub fn new(clustername: impl Into<String>) -> Self {
        Self {
            clustername: clustername.into(),
            ..Self::default()
        }
    }

    /// Server-side idle timeout for accepted connections: always 2x the
    /// client-side value, to avoid simultaneous-close races.
    pub fn server_soc_timeout(&self) -> Duration {
        self.soc_timeout * 2
    }

    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = ns.into();
        self
    }

    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.redis = redis;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ns: Self::default_ns(),
            clustername: "default".to_string(),
            rpc_timeout: Self::default_rpc_timeout(),
            ttl: Duration::ZERO,
            batch_read_size: Self::default_batch_read_size(),
            broker_cache: BrokerCacheConfig::default(),
            retries: RetryConfig::default(),
            soc_timeout: Self::default_soc_timeout(),
            health_check_interval: Self::default_health_check_interval(),
            redis: RedisConfig::default(),
        }
    }
}
