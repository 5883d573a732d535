//! Application configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the builder below
//! 2. **Config file**: TOML file specified by the `PORTCULLIS_CONFIG` env var
//! 3. **Environment variables**: flat, unprefixed names (`DATABASE_URL`,
//!    `DEFAULT_RATE_LIMIT_RPS`, `DEPLOYMENT_MODE`, ...)
//!
//! Validation happens at load time; a missing persistence URL or an invalid
//! bind address is fatal and the process exits non-zero.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, time::Duration};

/// Deployment mode. `demo` forces the in-process fallback KV store even when
/// a Redis URL is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Normal,
    Demo,
}

/// Root application configuration.
///
/// Flat on purpose: every field maps 1:1 to an environment variable of the
/// same name in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite connection URL for the configuration store. Required.
    pub database_url: String,

    /// Redis connection URL for the shared KV backend. Empty disables the
    /// shared backend and the gateway starts degraded on the fallback store.
    #[serde(default)]
    pub redis_url: String,

    #[serde(default)]
    pub deployment_mode: DeploymentMode,

    /// IP address the gateway binds to. Defaults to `127.0.0.1`.
    pub bind_address: String,

    /// Port the gateway listens on. Must be greater than 0. Defaults to `8080`.
    pub bind_port: u16,

    /// Maximum in-flight requests before the server sheds load. Defaults to `1024`.
    pub max_concurrent_requests: usize,

    /// Rate limit applied when a key carries no override. Defaults to `100`.
    pub default_rate_limit_rps: f64,

    /// Burst capacity applied when a key carries no override. Defaults to `200`.
    pub default_rate_limit_burst: u32,

    /// EWMA smoothing factor for the abuse detector, in (0, 1]. Defaults to `0.3`.
    pub abuse_ewma_alpha: f64,

    /// Z-score above which a key is soft-blocked. Defaults to `3.0`.
    pub abuse_zscore_threshold: f64,

    /// Soft-block duration in seconds. Defaults to `300`.
    pub abuse_block_duration_seconds: u64,

    /// Expected distinct items in the negative-cache bloom filter. Defaults to `10000`.
    pub bloom_expected_items: u64,

    /// Target bloom false positive rate, in (0, 1). Defaults to `0.01`.
    pub bloom_false_positive_rate: f64,

    /// Upstream deadline applied when a route carries no timeout. Defaults to `30000`.
    pub upstream_default_timeout_ms: u64,

    /// Bound on any single KV operation on the hot path. Defaults to `250`.
    pub kv_op_timeout_ms: u64,

    /// Single-flight lease TTL in seconds. Defaults to `10`.
    pub cache_lock_ttl_seconds: u64,

    /// Extra KV record lifetime beyond `ttl + stale`, in seconds. Defaults to `60`.
    pub cache_safety_margin_seconds: u64,

    /// Size of the background revalidation worker pool. Defaults to `4`.
    pub revalidation_workers: usize,

    /// Full config-catalog re-read interval in seconds. Defaults to `30`.
    pub catalog_refresh_seconds: u64,

    /// Capacity of the request-log queue; overflow drops oldest. Defaults to `4096`.
    pub log_queue_capacity: usize,

    /// Log level (e.g. "info", "debug"). Defaults to `"info"`.
    pub log_level: String,

    /// Log output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: String::new(),
            deployment_mode: DeploymentMode::Normal,
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            max_concurrent_requests: 1024,
            default_rate_limit_rps: 100.0,
            default_rate_limit_burst: 200,
            abuse_ewma_alpha: 0.3,
            abuse_zscore_threshold: 3.0,
            abuse_block_duration_seconds: 300,
            bloom_expected_items: 10_000,
            bloom_false_positive_rate: 0.01,
            upstream_default_timeout_ms: 30_000,
            kv_op_timeout_ms: 250,
            cache_lock_ttl_seconds: 10,
            cache_safety_margin_seconds: 60,
            revalidation_workers: 4,
            catalog_refresh_seconds: 30,
            log_queue_capacity: 4096,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from an optional TOML file with environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or a value fails
    /// to deserialize.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("database_url", "")?
            .set_default("redis_url", "")?
            .set_default("deployment_mode", "normal")?
            .set_default("bind_address", "127.0.0.1")?
            .set_default("bind_port", 8080)?
            .set_default("max_concurrent_requests", 1024)?
            .set_default("default_rate_limit_rps", 100.0)?
            .set_default("default_rate_limit_burst", 200)?
            .set_default("abuse_ewma_alpha", 0.3)?
            .set_default("abuse_zscore_threshold", 3.0)?
            .set_default("abuse_block_duration_seconds", 300)?
            .set_default("bloom_expected_items", 10_000)?
            .set_default("bloom_false_positive_rate", 0.01)?
            .set_default("upstream_default_timeout_ms", 30_000)?
            .set_default("kv_op_timeout_ms", 250)?
            .set_default("cache_lock_ttl_seconds", 10)?
            .set_default("cache_safety_margin_seconds", 60)?
            .set_default("revalidation_workers", 4)?
            .set_default("catalog_refresh_seconds", 30)?
            .set_default("log_queue_capacity", 4096)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::default())
            .build()?;

        builder.try_deserialize()
    }

    /// Loads configuration from `config/portcullis.toml` (overridable via
    /// `PORTCULLIS_CONFIG`) with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("PORTCULLIS_CONFIG")
            .unwrap_or_else(|_| "config/portcullis.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Whether the fallback KV must be used regardless of `redis_url`.
    #[must_use]
    pub fn force_fallback_kv(&self) -> bool {
        self.deployment_mode == DeploymentMode::Demo || self.redis_url.is_empty()
    }

    /// Returns the parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .map_err(|_| format!("Invalid socket address: {}:{}", self.bind_address, self.bind_port))
    }

    #[must_use]
    pub fn kv_op_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_op_timeout_ms)
    }

    #[must_use]
    pub fn upstream_default_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_default_timeout_ms)
    }

    #[must_use]
    pub fn abuse_block_duration(&self) -> Duration {
        Duration::from_secs(self.abuse_block_duration_seconds)
    }

    #[must_use]
    pub fn catalog_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_seconds)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails; startup treats
    /// this as fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("DATABASE_URL is required".to_string());
        }

        if self.bind_port == 0 {
            return Err("Bind port must be greater than 0".to_string());
        }

        if self.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }

        if !(self.abuse_ewma_alpha > 0.0 && self.abuse_ewma_alpha <= 1.0) {
            return Err("ABUSE_EWMA_ALPHA must be in (0, 1]".to_string());
        }

        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err("BLOOM_FALSE_POSITIVE_RATE must be in (0, 1)".to_string());
        }

        if self.bloom_expected_items == 0 {
            return Err("BLOOM_EXPECTED_ITEMS must be greater than 0".to_string());
        }

        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err("Log format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
