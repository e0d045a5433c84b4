//! Configuration for convocart-memory

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::Namespace;
use crate::error::{Error, Result};

/// Default total cache size (1 GB)
pub const DEFAULT_CACHE_BYTES: u64 = 1_000_000_000;

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Cache sizing and per-namespace policy
    pub cache: CacheConfig,

    /// How long a conversation stays continuous after the last turn
    pub session_window: Duration,

    /// Freshness window of the short-term context snapshot
    pub short_term_ttl: Duration,

    /// Maximum number of turns carried in a conversation context
    pub max_context_turns: usize,

    /// How long a memoized memory profile stays fresh
    pub profile_ttl: Duration,

    /// Maximum number of recommendations returned
    pub max_recommendations: usize,

    /// Upper bound for any memoized computation or context rebuild
    pub compute_timeout: Duration,

    /// Upper bound for long-term aggregation writes
    pub aggregation_timeout: Duration,

    /// Interval of the background expired-entry sweep
    pub sweep_interval: Duration,

    /// Interval of the session -> long-term promotion pass
    pub promotion_interval: Duration,

    /// Retry policy for retryable failures
    pub retry: RetryConfig,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("convocart-memory");

        Self {
            data_dir,
            cache: CacheConfig::default(),
            session_window: Duration::from_secs(30 * 60),
            short_term_ttl: Duration::from_secs(30 * 60),
            max_context_turns: 20, // 10 customer/assistant exchanges
            profile_ttl: Duration::from_secs(2 * 3600),
            max_recommendations: 5,
            compute_timeout: Duration::from_secs(10),
            aggregation_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            promotion_interval: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
            server_port: 8430,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `CONVOCART_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CONVOCART_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_parse::<u64>("CONVOCART_CACHE_BYTES")? {
            config.cache = CacheConfig::with_total_bytes(bytes);
        }
        if let Some(port) = env_parse::<u16>("CONVOCART_PORT")? {
            config.server_port = port;
        }
        if let Some(secs) = env_parse::<u64>("CONVOCART_SESSION_WINDOW_SECS")? {
            config.session_window = Duration::from_secs(secs);
            config.short_term_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;

        if self.session_window.is_zero() {
            return Err(Error::config("session_window must be greater than 0"));
        }
        if self.short_term_ttl.is_zero() {
            return Err(Error::config("short_term_ttl must be greater than 0"));
        }
        if self.max_context_turns == 0 {
            return Err(Error::config("max_context_turns must be greater than 0"));
        }
        if self.compute_timeout.is_zero() || self.aggregation_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("retry.backoff_multiplier must be >= 1.0"));
        }

        Ok(())
    }
}

/// Policy of a single cache namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Byte budget of the namespace
    pub quota_bytes: u64,

    /// TTL used when callers ask for the namespace default
    pub default_ttl: Option<Duration>,
}

/// Cache store sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Configured total store size; namespace quotas must fit inside it
    pub total_bytes: u64,

    pub namespaces: BTreeMap<Namespace, NamespaceConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_total_bytes(DEFAULT_CACHE_BYTES)
    }
}

impl CacheConfig {
    /// Split `total_bytes` 60/20/15/5 across main/analytics/ai/session
    pub fn with_total_bytes(total_bytes: u64) -> Self {
        let share = |percent: u64| total_bytes / 100 * percent;

        let mut namespaces = BTreeMap::new();
        namespaces.insert(
            Namespace::Main,
            NamespaceConfig {
                quota_bytes: share(60),
                default_ttl: Some(Duration::from_secs(3600)),
            },
        );
        namespaces.insert(
            Namespace::Analytics,
            NamespaceConfig {
                quota_bytes: share(20),
                default_ttl: Some(Duration::from_secs(6 * 3600)),
            },
        );
        namespaces.insert(
            Namespace::Ai,
            NamespaceConfig {
                quota_bytes: share(15),
                default_ttl: Some(Duration::from_secs(3600)),
            },
        );
        namespaces.insert(
            Namespace::Session,
            NamespaceConfig {
                quota_bytes: share(5),
                default_ttl: Some(Duration::from_secs(30 * 60)),
            },
        );

        Self {
            total_bytes,
            namespaces,
        }
    }

    /// Override the quota of one namespace
    pub fn with_quota(mut self, namespace: Namespace, quota_bytes: u64) -> Self {
        self.namespaces
            .entry(namespace)
            .or_insert(NamespaceConfig {
                quota_bytes: 0,
                default_ttl: None,
            })
            .quota_bytes = quota_bytes;
        self
    }

    /// Override the default TTL of one namespace
    pub fn with_default_ttl(mut self, namespace: Namespace, ttl: Option<Duration>) -> Self {
        self.namespaces
            .entry(namespace)
            .or_insert(NamespaceConfig {
                quota_bytes: 0,
                default_ttl: None,
            })
            .default_ttl = ttl;
        self
    }

    /// Policy for a namespace; unconfigured namespaces get a zero quota
    pub fn namespace(&self, namespace: Namespace) -> NamespaceConfig {
        self.namespaces
            .get(&namespace)
            .copied()
            .unwrap_or(NamespaceConfig {
                quota_bytes: 0,
                default_ttl: None,
            })
    }

    pub fn validate(&self) -> Result<()> {
        let allotted: u64 = self.namespaces.values().map(|ns| ns.quota_bytes).sum();
        if allotted > self.total_bytes {
            return Err(Error::config(format!(
                "namespace quotas add up to {} bytes, more than the {} byte store",
                allotted, self.total_bytes
            )));
        }
        Ok(())
    }
}

/// Retry policy for retryable failures (timeouts)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        // overflow lands on the cap
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
