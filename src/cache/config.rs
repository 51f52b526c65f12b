//! Configuration for the cache system

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment variable read by [`CacheConfig::from_env`]
pub const ENV_PREFIX: &str = "QUERY_CACHE_";

/// Configuration for the bounded cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live of an entry, refreshed on every store
    pub ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0), spreads expiry of entries stored together
    pub ttl_jitter: f64,

    /// Maximum number of entries in the table
    pub max_entries: usize,

    /// Maximum total payload bytes across all entries
    pub max_memory_bytes: u64,

    /// Maximum payload bytes of a single entry
    pub max_entry_bytes: u64,

    /// Observations a key needs before it is admitted
    pub min_uses: u64,

    /// Idle time after which a usage counter is forgotten
    pub usage_retention: Duration,

    /// How often idle usage counters are swept
    pub usage_sweep_interval: Duration,

    /// How often TTL-expired entries are purged
    pub expiry_sweep_interval: Duration,

    /// Default time a coalesced lookup waits for the populating request
    pub wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let max_memory_bytes = 1_000_000;
        Self {
            ttl: Duration::from_secs(60 * 60),
            ttl_jitter: 0.0,
            max_entries: 1000,
            max_memory_bytes,
            max_entry_bytes: max_memory_bytes / 10,
            min_uses: 0,
            usage_retention: Duration::from_secs(12 * 60 * 60),
            usage_sweep_interval: Duration::from_secs(10 * 60),
            expiry_sweep_interval: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from `QUERY_CACHE_*` environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_memory_bytes =
            parse_var(&lookup, "MAX_MEMORY_BYTES")?.unwrap_or(defaults.max_memory_bytes);

        let config = Self {
            ttl: parse_secs(&lookup, "TTL_SECS")?.unwrap_or(defaults.ttl),
            ttl_jitter: parse_var(&lookup, "TTL_JITTER")?.unwrap_or(defaults.ttl_jitter),
            max_entries: parse_var(&lookup, "MAX_ENTRIES")?.unwrap_or(defaults.max_entries),
            max_memory_bytes,
            max_entry_bytes: parse_var(&lookup, "MAX_ENTRY_BYTES")?
                .unwrap_or(max_memory_bytes / 10),
            min_uses: parse_var(&lookup, "MIN_USES")?.unwrap_or(defaults.min_uses),
            usage_retention: parse_secs(&lookup, "USAGE_RETENTION_SECS")?
                .unwrap_or(defaults.usage_retention),
            usage_sweep_interval: parse_secs(&lookup, "USAGE_SWEEP_SECS")?
                .unwrap_or(defaults.usage_sweep_interval),
            expiry_sweep_interval: parse_secs(&lookup, "EXPIRY_SWEEP_SECS")?
                .unwrap_or(defaults.expiry_sweep_interval),
            wait_timeout: parse_secs(&lookup, "WAIT_TIMEOUT_SECS")?
                .unwrap_or(defaults.wait_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_memory_bytes == 0 {
            return Err(CacheError::Config(
                "max_memory_bytes must be greater than 0".to_string(),
            ));
        }

        if self.max_entry_bytes > self.max_memory_bytes {
            return Err(CacheError::Config(format!(
                "max_entry_bytes ({}) must not exceed max_memory_bytes ({})",
                self.max_entry_bytes, self.max_memory_bytes
            )));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::Config(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.ttl.is_zero()
            || self.usage_sweep_interval.is_zero()
            || self.expiry_sweep_interval.is_zero()
        {
            return Err(CacheError::Config(
                "ttl and sweep intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.ttl;
        }

        let base_secs = self.ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.001);

        Duration::from_secs_f64(final_secs)
    }
}

fn parse_var<T, F>(lookup: &F, suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let name = format!("{ENV_PREFIX}{suffix}");
    match lookup(&name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{name}={raw:?}: {e}"))),
    }
}

fn parse_secs<F>(lookup: &F, suffix: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, F>(lookup, suffix)?.map(Duration::from_secs))
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    max_entries: Option<usize>,
    max_memory_bytes: Option<u64>,
    max_entry_bytes: Option<u64>,
    min_uses: Option<u64>,
    usage_retention: Option<Duration>,
    usage_sweep_interval: Option<Duration>,
    expiry_sweep_interval: Option<Duration>,
    wait_timeout: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set TTL for cache entries
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set the memory budget in bytes.
    ///
    /// Unless set explicitly, the per-entry limit follows at a tenth of it.
    pub fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Set the per-entry size limit in bytes
    pub fn max_entry_bytes(mut self, bytes: u64) -> Self {
        self.max_entry_bytes = Some(bytes);
        self
    }

    /// Set the admission threshold
    pub fn min_uses(mut self, uses: u64) -> Self {
        self.min_uses = Some(uses);
        self
    }

    pub fn usage_retention(mut self, retention: Duration) -> Self {
        self.usage_retention = Some(retention);
        self
    }

    pub fn usage_sweep_interval(mut self, interval: Duration) -> Self {
        self.usage_sweep_interval = Some(interval);
        self
    }

    pub fn expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiry_sweep_interval = Some(interval);
        self
    }

    /// Set the default coalescing wait timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        let max_memory_bytes = self.max_memory_bytes.unwrap_or(defaults.max_memory_bytes);

        CacheConfig {
            ttl: self.ttl.unwrap_or(defaults.ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            max_memory_bytes,
            max_entry_bytes: self.max_entry_bytes.unwrap_or(max_memory_bytes / 10),
            min_uses: self.min_uses.unwrap_or(defaults.min_uses),
            usage_retention: self.usage_retention.unwrap_or(defaults.usage_retention),
            usage_sweep_interval: self
                .usage_sweep_interval
                .unwrap_or(defaults.usage_sweep_interval),
            expiry_sweep_interval: self
                .expiry_sweep_interval
                .unwrap_or(defaults.expiry_sweep_interval),
            wait_timeout: self.wait_timeout.unwrap_or(defaults.wait_timeout),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Small footprint for tests and memory-constrained deployments
    pub fn small() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            max_entries: 100,
            max_memory_bytes: 100_000,
            max_entry_bytes: 10_000,
            ..Default::default()
        }
    }

    /// Large dashboards fleet: 2 GiB budget, hot-query admission
    pub fn large() -> Self {
        let max_memory_bytes = 2 * 1024 * 1024 * 1024;
        Self {
            max_entries: 100_000,
            max_memory_bytes,
            max_entry_bytes: max_memory_bytes / 10,
            min_uses: 2,
            ..Default::default()
        }
    }
}
