//! In-process cache of raw template buffers.
//!
//! Entries are bounded three ways: entry count, total bytes and a per-entry
//! TTL. Eviction removes expired entries first and then least-recently-used
//! entries until both limits hold again.
//!
//! `TemplateCache` itself is single-owner state; `SharedTemplateCache` adds the
//! mutex the worker's tasks synchronize on. Nothing is shared across processes.

use lru::LruCache;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::TemplateCacheConfig;
use crate::lock::mutex_lock;

const SOURCE: &str = "template_cache";

/// Expiry used when `now + ttl` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct TemplateCacheEntry {
    buffer: Arc<[u8]>,
    size_bytes: usize,
    created_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
}

impl TemplateCacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before the first request.
    pub hit_ratio: f64,
    pub entry_count: usize,
    pub total_size_bytes: usize,
    /// Age of the oldest entry, `None` when empty.
    pub oldest_entry_age: Option<Duration>,
    pub max_capacity: usize,
    pub memory_limit_bytes: usize,
    pub default_ttl: Duration,
}

pub struct TemplateCache {
    entries: LruCache<String, TemplateCacheEntry>,
    max_capacity: usize,
    memory_limit_bytes: usize,
    default_ttl: Duration,
    total_size_bytes: usize,
    hits: u64,
    misses: u64,
}

impl TemplateCache {
    pub fn new(config: &TemplateCacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_capacity: config.max_capacity,
            memory_limit_bytes: config.memory_limit_bytes,
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            total_size_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the buffer for `key` and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<[u8]>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&mut self, key: &str, now: Instant) -> Option<Arc<[u8]>> {
        let expired = match self.entries.peek(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.remove(key);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.entries.get_mut(key).map(|entry| {
            entry.last_accessed_at = now;
            entry.buffer.clone()
        })
    }

    /// Inserts or replaces `key`, then evicts until both limits hold. `ttl`
    /// overrides the configured default for this entry.
    pub fn set(&mut self, key: &str, buffer: impl Into<Arc<[u8]>>, ttl: Option<Duration>) {
        self.set_at(key, buffer.into(), ttl, Instant::now());
    }

    fn set_at(&mut self, key: &str, buffer: Arc<[u8]>, ttl: Option<Duration>, now: Instant) {
        self.remove(key);

        let size_bytes = buffer.len();
        let entry = TemplateCacheEntry {
            buffer,
            size_bytes,
            created_at: now,
            expires_at: expiry(now, ttl.unwrap_or(self.default_ttl)),
            last_accessed_at: now,
        };
        self.entries.put(key.to_string(), entry);
        self.total_size_bytes += size_bytes;

        self.evict(now);
    }

    /// Whether a live entry exists. Does not affect recency or hit counters.
    pub fn has(&self, key: &str) -> bool {
        self.has_at(key, Instant::now())
    }

    fn has_at(&self, key: &str, now: Instant) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Removes `key`; returns whether it was present.
    pub fn invalidate(&mut self, key: &str) -> bool {
        self.remove(key)
    }

    /// Removes every entry and resets hit/miss counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size_bytes = 0;
        self.hits = 0;
        self.misses = 0;
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(Instant::now())
    }

    fn prune_expired_at(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    fn stats_at(&self, now: Instant) -> CacheStats {
        let requests = self.hits + self.misses;
        let hit_ratio = if requests == 0 {
            0.0
        } else {
            self.hits as f64 / requests as f64
        };
        let oldest_entry_age = self
            .entries
            .iter()
            .map(|(_, entry)| entry.created_at)
            .min()
            .map(|created| now.saturating_duration_since(created));

        CacheStats {
            hits: self.hits,
            misses: self.misses,
            hit_ratio,
            entry_count: self.entries.len(),
            total_size_bytes: self.total_size_bytes,
            oldest_entry_age,
            max_capacity: self.max_capacity,
            memory_limit_bytes: self.memory_limit_bytes,
            default_ttl: self.default_ttl,
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.total_size_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    fn over_limits(&self) -> bool {
        self.entries.len() > self.max_capacity || self.total_size_bytes > self.memory_limit_bytes
    }

    fn evict(&mut self, now: Instant) {
        if !self.over_limits() {
            return;
        }

        let expired = self.prune_expired_at(now);
        let mut lru_evicted = 0;
        while self.over_limits() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_size_bytes -= entry.size_bytes;
            lru_evicted += 1;
            debug!(key = %key, size_bytes = entry.size_bytes, "Evicted least recently used template");
        }

        if expired + lru_evicted > 0 {
            debug!(
                expired,
                lru_evicted,
                entry_count = self.entries.len(),
                total_size_bytes = self.total_size_bytes,
                "Template cache eviction finished"
            );
        }
    }
}

/// `TemplateCache` behind a mutex, shared by the worker's tasks.
pub struct SharedTemplateCache {
    inner: Mutex<TemplateCache>,
}

impl SharedTemplateCache {
    pub fn new(config: &TemplateCacheConfig) -> Self {
        info!(
            max_capacity = config.max_capacity,
            memory_limit_bytes = config.memory_limit_bytes,
            default_ttl_ms = config.default_ttl_ms,
            "Template cache configured"
        );
        Self {
            inner: Mutex::new(TemplateCache::new(config)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        mutex_lock(&self.inner, SOURCE, "get").get(key)
    }

    pub fn set(&self, key: &str, buffer: impl Into<Arc<[u8]>>, ttl: Option<Duration>) {
        mutex_lock(&self.inner, SOURCE, "set").set(key, buffer, ttl);
    }

    pub fn has(&self, key: &str) -> bool {
        mutex_lock(&self.inner, SOURCE, "has").has(key)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        mutex_lock(&self.inner, SOURCE, "invalidate").invalidate(key)
    }

    pub fn clear(&self) {
        mutex_lock(&self.inner, SOURCE, "clear").clear();
    }

    pub fn stats(&self) -> CacheStats {
        mutex_lock(&self.inner, SOURCE, "stats").stats()
    }

    /// Returns the cached buffer for `key`, loading and caching it on a miss.
    ///
    /// The lock is not held while `load` runs, so two tasks missing on the
    /// same key may both load it; the later `set` replaces the earlier one.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<Arc<[u8]>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(buffer) = self.get(key) {
            return Ok(buffer);
        }

        let buffer: Arc<[u8]> = load().await?.into();
        self.set(key, buffer.clone(), None);
        Ok(buffer)
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
