//! Configuration Module
//!
//! Handles loading and managing cache and prefetch configuration from
//! environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Cache-wide configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// Default age after which an entry may be evicted
    pub default_ttl: Duration,
    /// Default age after which an entry is due for revalidation
    pub default_stale_time: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_retry_delay: Duration,
    /// Background GC frequency
    pub gc_interval: Duration,
    /// Reject fetch results issued before the entry's latest write
    pub monotonic_writes: bool,
    /// Prefetch manager tuning
    pub prefetch: PrefetchConfig,
}

/// Prefetch manager tuning.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Number of navigations kept for behavior prediction
    pub history_limit: usize,
    /// How long a predicted route blocks re-triggering
    pub prediction_timeout: Duration,
    /// Delay used when the host cannot report idle periods
    pub idle_fallback_delay: Duration,
    /// Below this downlink all non-critical prefetching stops
    pub min_downlink_mbps: f64,
    /// At or above this downlink every priority tier may run
    pub high_bandwidth_mbps: f64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `QUERY_CACHE_MAX_ENTRIES` - Maximum cache entries (default: 1000)
    /// - `QUERY_CACHE_DEFAULT_TTL_MS` - Default TTL (default: 300000)
    /// - `QUERY_CACHE_STALE_TIME_MS` - Default stale time (default: 30000)
    /// - `QUERY_CACHE_MAX_RETRIES` - Retries per fetch (default: 3)
    /// - `QUERY_CACHE_RETRY_DELAY_MS` - Backoff base delay (default: 1000)
    /// - `QUERY_CACHE_MAX_RETRY_DELAY_MS` - Backoff ceiling (default: 30000)
    /// - `QUERY_CACHE_GC_INTERVAL_MS` - GC frequency (default: 60000)
    /// - `QUERY_CACHE_MONOTONIC_WRITES` - Drop superseded fetch results (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env_or("QUERY_CACHE_MAX_ENTRIES", defaults.max_entries),
            default_ttl: env_ms_or("QUERY_CACHE_DEFAULT_TTL_MS", defaults.default_ttl),
            default_stale_time: env_ms_or("QUERY_CACHE_STALE_TIME_MS", defaults.default_stale_time),
            max_retries: env_or("QUERY_CACHE_MAX_RETRIES", defaults.max_retries),
            retry_delay: env_ms_or("QUERY_CACHE_RETRY_DELAY_MS", defaults.retry_delay),
            max_retry_delay: env_ms_or("QUERY_CACHE_MAX_RETRY_DELAY_MS", defaults.max_retry_delay),
            gc_interval: env_ms_or("QUERY_CACHE_GC_INTERVAL_MS", defaults.gc_interval),
            monotonic_writes: env_or("QUERY_CACHE_MONOTONIC_WRITES", defaults.monotonic_writes),
            prefetch: PrefetchConfig::from_env(),
        }
    }
}

impl PrefetchConfig {
    /// Loads prefetch tuning from `PREFETCH_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            history_limit: env_or("PREFETCH_HISTORY_LIMIT", defaults.history_limit),
            prediction_timeout: env_ms_or(
                "PREFETCH_PREDICTION_TIMEOUT_MS",
                defaults.prediction_timeout,
            ),
            idle_fallback_delay: env_ms_or(
                "PREFETCH_IDLE_FALLBACK_MS",
                defaults.idle_fallback_delay,
            ),
            min_downlink_mbps: env_or("PREFETCH_MIN_DOWNLINK_MBPS", defaults.min_downlink_mbps),
            high_bandwidth_mbps: env_or(
                "PREFETCH_HIGH_BANDWIDTH_MBPS",
                defaults.high_bandwidth_mbps,
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            default_stale_time: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(30),
            gc_interval: Duration::from_secs(60),
            monotonic_writes: false,
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            prediction_timeout: Duration::from_secs(30),
            idle_fallback_delay: Duration::from_secs(1),
            min_downlink_mbps: 1.0,
            high_bandwidth_mbps: 5.0,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
