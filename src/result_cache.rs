//! Content-addressable cache of rendered documents in object storage.
//!
//! Objects live at `exports/cache/{cache_key}.{format}` and carry `cached-at`
//! and `ttl-hours` metadata. Staleness is decided from metadata alone, so an
//! expired entry never costs a body transfer. Everything except the final copy
//! to the job's delivery path degrades to a cache miss on failure.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache_key::{compute_cache_key, CacheKeyInput, ExportFormat};
use crate::config::ResultCacheConfig;
use crate::error::StorageError;
use crate::storage::{ObjectHead, ObjectStore};

/// Prefix under which rendered documents are cached.
pub const CACHE_PREFIX: &str = "exports/cache";

/// Metadata key holding the ISO-8601 write time.
pub const META_CACHED_AT: &str = "cached-at";

/// Metadata key holding the entry lifetime in hours.
pub const META_TTL_HOURS: &str = "ttl-hours";

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub cache_hit: bool,
    pub buffer: Option<Vec<u8>>,
    pub cache_key: String,
}

impl CacheLookup {
    fn miss(cache_key: &str) -> Self {
        Self {
            cache_hit: false,
            buffer: None,
            cache_key: cache_key.to_string(),
        }
    }
}

pub struct ResultCache {
    store: Arc<dyn ObjectStore>,
    ttl_hours: u32,
}

impl ResultCache {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ResultCacheConfig) -> Self {
        Self {
            store,
            ttl_hours: config.ttl_hours,
        }
    }

    /// Object path of the cached render for `cache_key`.
    pub fn cache_path(cache_key: &str, format: ExportFormat) -> String {
        format!("{}/{}.{}", CACHE_PREFIX, cache_key, format.extension())
    }

    /// Computes the key for `input` and looks it up.
    pub async fn lookup(&self, input: &CacheKeyInput) -> CacheLookup {
        let cache_key = compute_cache_key(input);
        self.lookup_key(&cache_key, input.format).await
    }

    /// Looks up an already computed key. Never fails: errors are logged and
    /// reported as a miss.
    pub async fn lookup_key(&self, cache_key: &str, format: ExportFormat) -> CacheLookup {
        let path = Self::cache_path(cache_key, format);
        match self.fetch_fresh(&path, Utc::now()).await {
            Ok(Some(buffer)) => {
                debug!(cache_key = %cache_key, bytes = buffer.len(), "Result cache hit");
                CacheLookup {
                    cache_hit: true,
                    buffer: Some(buffer),
                    cache_key: cache_key.to_string(),
                }
            }
            Ok(None) => {
                debug!(cache_key = %cache_key, "Result cache miss");
                CacheLookup::miss(cache_key)
            }
            Err(e) => {
                warn!(cache_key = %cache_key, error = %e, "Result cache lookup failed, treating as miss");
                CacheLookup::miss(cache_key)
            }
        }
    }

    async fn fetch_fresh(
        &self,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(head) = self.store.head(path).await? else {
            return Ok(None);
        };

        if is_expired(&head, self.ttl_hours, now)? {
            debug!(path = %path, "Result cache entry expired");
            return Ok(None);
        }

        let body = self.store.get(path).await?;
        if body.is_empty() {
            warn!(path = %path, "Result cache entry has an empty body");
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Writes a rendered document to the cache. Failures are logged and
    /// swallowed; the job proceeds without a cache entry.
    pub async fn store(&self, cache_key: &str, format: ExportFormat, buffer: Vec<u8>) {
        let path = Self::cache_path(cache_key, format);
        let mut metadata = HashMap::new();
        metadata.insert(META_CACHED_AT.to_string(), Utc::now().to_rfc3339());
        metadata.insert(META_TTL_HOURS.to_string(), self.ttl_hours.to_string());

        let bytes = buffer.len();
        match self.store.put(&path, buffer, metadata).await {
            Ok(()) => info!(cache_key = %cache_key, bytes, "Stored rendered export in result cache"),
            Err(e) => warn!(cache_key = %cache_key, error = %e, "Failed to store rendered export in result cache"),
        }
    }

    /// Copies the cached object to the job's delivery path. Unlike lookups and
    /// stores, failures propagate: the job has no artifact without this copy.
    pub async fn copy_to_result_path(
        &self,
        cache_key: &str,
        format: ExportFormat,
        dest_path: &str,
    ) -> Result<(), StorageError> {
        let path = Self::cache_path(cache_key, format);
        self.store.copy(&path, dest_path).await?;
        debug!(cache_key = %cache_key, dest = %dest_path, "Copied cached export to result path");
        Ok(())
    }
}

/// An entry without `cached-at` never expires. Malformed metadata is an
/// error, which the caller reports as a miss.
fn is_expired(head: &ObjectHead, default_ttl_hours: u32, now: DateTime<Utc>) -> Result<bool, StorageError> {
    let Some(cached_at) = head.metadata.get(META_CACHED_AT) else {
        return Ok(false);
    };
    let cached_at = DateTime::parse_from_rfc3339(cached_at)
        .map_err(|e| StorageError::Backend(format!("malformed {META_CACHED_AT} `{cached_at}`: {e}")))?
        .with_timezone(&Utc);

    let ttl_hours = match head.metadata.get(META_TTL_HOURS) {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|e| StorageError::Backend(format!("malformed {META_TTL_HOURS} `{raw}`: {e}")))?,
        None => i64::from(default_ttl_hours),
    };
    let ttl = Some(ttl_hours)
        .filter(|hours| *hours >= 0)
        .and_then(Duration::try_hours)
        .ok_or_else(|| StorageError::Backend(format!("malformed {META_TTL_HOURS} `{ttl_hours}`: out of range")))?;

    Ok(now.signed_duration_since(cached_at) > ttl)
}
