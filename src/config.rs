//! Worker configuration.
//!
//! Every component receives an explicit config struct. Defaults are the
//! documented values below; `WorkerConfig::from_env` overrides them from
//! environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `REDIS_URL` | `redis://127.0.0.1/` |
//! | `EXPORT_STORAGE_ROOT` | `./storage` |
//! | `EXPORT_DEFAULT_TEMPLATE` | built-in template |
//! | `SOFFICE_BIN` | `soffice` |
//! | `WORKER_CONCURRENCY` | 2 |
//! | `TEMPLATE_PREWARM_LIMIT` | 20 |
//! | `EXPORT_MIN_CONCURRENCY` / `EXPORT_MAX_CONCURRENCY` | 1 / 10 |
//! | `EXPORT_POLL_INTERVAL_MS` / `EXPORT_COOLDOWN_MS` | 5000 / 30000 |
//! | `EXPORT_SCALE_UP_THRESHOLD` / `EXPORT_SCALE_DOWN_THRESHOLD` | 10 / 3 |
//! | `TEMPLATE_CACHE_MAX_CAPACITY` | 100 |
//! | `TEMPLATE_CACHE_MEMORY_LIMIT_BYTES` | 268435456 (256 MiB) |
//! | `TEMPLATE_CACHE_DEFAULT_TTL_MS` | 3600000 (1 h) |
//! | `RESULT_CACHE_TTL_HOURS` | 24 |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
const DEFAULT_STORAGE_ROOT: &str = "./storage";
const DEFAULT_SOFFICE_BIN: &str = "soffice";
const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_PREWARM_LIMIT: usize = 20;

/// AutoScaler bounds, timing and thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    pub cooldown_ms: u64,
    /// Scale up when queue depth is strictly above this value.
    pub scale_up_threshold: usize,
    /// Scale down when queue depth is strictly below this value.
    pub scale_down_threshold: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 10,
            poll_interval_ms: 5_000,
            cooldown_ms: 30_000,
            scale_up_threshold: 10,
            scale_down_threshold: 3,
        }
    }
}

impl AutoScalerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Replaces settings the scaler cannot run with by their defaults:
    /// inverted concurrency bounds and a zero poll interval.
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        let mut config = self;
        if config.min_concurrency > config.max_concurrency {
            warn!(
                min_concurrency = config.min_concurrency,
                max_concurrency = config.max_concurrency,
                default_min = defaults.min_concurrency,
                default_max = defaults.max_concurrency,
                "Concurrency bounds are inverted, using defaults"
            );
            config.min_concurrency = defaults.min_concurrency;
            config.max_concurrency = defaults.max_concurrency;
        }
        if config.poll_interval_ms == 0 {
            warn!(
                default = defaults.poll_interval_ms,
                "Autoscaler poll interval must be positive, using default"
            );
            config.poll_interval_ms = defaults.poll_interval_ms;
        }
        config
    }
}

/// In-process template cache limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCacheConfig {
    pub max_capacity: usize,
    pub memory_limit_bytes: usize,
    pub default_ttl_ms: u64,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100,
            memory_limit_bytes: 256 * 1024 * 1024,
            default_ttl_ms: 60 * 60 * 1000,
        }
    }
}

/// Rendered-document cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCacheConfig {
    pub ttl_hours: u32,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Root directory of the filesystem object store.
    pub storage_root: PathBuf,
    /// Object path of the default document template; the built-in template
    /// is used when unset.
    pub default_template_path: Option<String>,
    pub soffice_bin: String,
    pub initial_concurrency: usize,
    pub pre_warm_limit: usize,
    pub autoscaler: AutoScalerConfig,
    pub template_cache: TemplateCacheConfig,
    pub result_cache: ResultCacheConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            default_template_path: None,
            soffice_bin: DEFAULT_SOFFICE_BIN.to_string(),
            initial_concurrency: DEFAULT_CONCURRENCY,
            pre_warm_limit: DEFAULT_PREWARM_LIMIT,
            autoscaler: AutoScalerConfig::default(),
            template_cache: TemplateCacheConfig::default(),
            result_cache: ResultCacheConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup. Unparseable
    /// values keep their default and log a warning, as do autoscaler
    /// settings that fail [`AutoScalerConfig::validated`].
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let autoscaler = AutoScalerConfig {
            min_concurrency: parse_or(&lookup, "EXPORT_MIN_CONCURRENCY", defaults.autoscaler.min_concurrency),
            max_concurrency: parse_or(&lookup, "EXPORT_MAX_CONCURRENCY", defaults.autoscaler.max_concurrency),
            poll_interval_ms: parse_or(&lookup, "EXPORT_POLL_INTERVAL_MS", defaults.autoscaler.poll_interval_ms),
            cooldown_ms: parse_or(&lookup, "EXPORT_COOLDOWN_MS", defaults.autoscaler.cooldown_ms),
            scale_up_threshold: parse_or(&lookup, "EXPORT_SCALE_UP_THRESHOLD", defaults.autoscaler.scale_up_threshold),
            scale_down_threshold: parse_or(&lookup, "EXPORT_SCALE_DOWN_THRESHOLD", defaults.autoscaler.scale_down_threshold),
        }
        .validated();

        let template_cache = TemplateCacheConfig {
            max_capacity: parse_or(&lookup, "TEMPLATE_CACHE_MAX_CAPACITY", defaults.template_cache.max_capacity),
            memory_limit_bytes: parse_or(
                &lookup,
                "TEMPLATE_CACHE_MEMORY_LIMIT_BYTES",
                defaults.template_cache.memory_limit_bytes,
            ),
            default_ttl_ms: parse_or(&lookup, "TEMPLATE_CACHE_DEFAULT_TTL_MS", defaults.template_cache.default_ttl_ms),
        };

        let result_cache = ResultCacheConfig {
            ttl_hours: parse_or(&lookup, "RESULT_CACHE_TTL_HOURS", defaults.result_cache.ttl_hours),
        };

        Self {
            redis_url: text("REDIS_URL").unwrap_or(defaults.redis_url),
            storage_root: text("EXPORT_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            default_template_path: text("EXPORT_DEFAULT_TEMPLATE"),
            soffice_bin: text("SOFFICE_BIN").unwrap_or(defaults.soffice_bin),
            initial_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", defaults.initial_concurrency),
            pre_warm_limit: parse_or(&lookup, "TEMPLATE_PREWARM_LIMIT", defaults.pre_warm_limit),
            autoscaler,
            template_cache,
            result_cache,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, default = %default, "Ignoring unparseable configuration value");
                default
            }
        },
        _ => default,
    }
}

#[cfg(test)]
mod tests;
