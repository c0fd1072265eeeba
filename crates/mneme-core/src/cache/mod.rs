//! Search result cache
//!
//! A byte-budgeted cache with per-entry TTL in front of read operations.
//! Keys are `(query, hex sha256 of canonical params JSON)`. Eviction under
//! memory pressure is moka's TinyLFU policy, which approximates LRU while
//! resisting one-off scans. Entries larger than the whole budget are never
//! admitted.
//!
//! Every [`SearchResultCache::clear`] advances a generation counter. Read
//! paths that load from storage and then populate the cache use
//! [`SearchResultCache::set_if_current`] with the generation taken before
//! the load, so a result read before a concurrent write never outlives that
//! write's invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheSettings;

/// Identity of a cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub params_hash: String,
}

impl CacheKey {
    /// Object keys in `serde_json::Value` are ordered, so equal params hash
    /// equally regardless of how they were built.
    pub fn new(query: impl Into<String>, params: Option<&Value>) -> Self {
        let mut hasher = Sha256::new();
        if let Some(params) = params {
            hasher.update(params.to_string().as_bytes());
        }
        Self {
            query: query.into(),
            params_hash: hex::encode(hasher.finalize()),
        }
    }

    /// Key for a serializable parameter struct
    pub fn for_params<P: Serialize>(query: impl Into<String>, params: &P) -> Self {
        let params = serde_json::to_value(params).unwrap_or(Value::Null);
        Self::new(query, Some(&params))
    }

    fn size_bytes(&self) -> usize {
        self.query.len() + self.params_hash.len()
    }
}

struct CacheEntry<V> {
    value: V,
    size_bytes: u32,
    ttl: Duration,
}

struct PerEntryTtl;

impl<V> Expiry<CacheKey, Arc<CacheEntry<V>>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<CacheEntry<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    // overwriting a key restarts its clock with the new TTL
    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Arc<CacheEntry<V>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup
    pub hit_rate: f64,
    pub entry_count: u64,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
}

/// Byte-budgeted TTL cache for search results
pub struct SearchResultCache<V> {
    inner: Cache<CacheKey, Arc<CacheEntry<V>>>,
    settings: CacheSettings,
    hits: AtomicU64,
    misses: AtomicU64,
    generation: AtomicU64,
}

impl<V> SearchResultCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(settings: CacheSettings) -> Self {
        let inner = Cache::builder()
            .max_capacity(settings.max_size_bytes)
            .weigher(|_key: &CacheKey, entry: &Arc<CacheEntry<V>>| entry.size_bytes)
            .expire_after(PerEntryTtl)
            .build();

        Self {
            inner,
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Store `value` under `key`, with the default TTL unless given.
    ///
    /// Insertion is best effort. Under size pressure moka's TinyLFU
    /// admission may drop the new entry instead of evicting existing ones.
    pub fn set(&self, key: CacheKey, value: V, ttl: Option<Duration>) {
        let value_size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        let size = (value_size + key.size_bytes()).min(u32::MAX as usize) as u32;
        if u64::from(size) > self.settings.max_size_bytes {
            debug!(query = %key.query, size, "Result larger than cache budget, not cached");
            return;
        }
        let entry = CacheEntry {
            value,
            size_bytes: size,
            ttl: ttl.unwrap_or_else(|| self.settings.default_ttl()),
        };
        self.inner.insert(key, Arc::new(entry));
    }

    /// Current invalidation generation; take it before loading a result
    /// that will be passed to [`Self::set_if_current`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Like [`Self::set`], but only while no [`Self::clear`] has happened
    /// since `generation` was read. Returns whether the entry was kept.
    pub fn set_if_current(
        &self,
        key: CacheKey,
        value: V,
        ttl: Option<Duration>,
        generation: u64,
    ) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.set(key.clone(), value, ttl);
        // a clear that raced the insert may have run before it landed
        if self.generation() != generation {
            self.inner.invalidate(&key);
            return false;
        }
        true
    }

    /// Look up a live entry, counting the hit or miss
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        match self.inner.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a live entry exists. Does not affect statistics.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn delete(&self, key: &CacheKey) {
        self.inner.invalidate(key);
    }

    /// Drop every entry and advance the generation. Hit and miss counters
    /// are kept.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate_all();
    }

    /// Sweep expired entries now instead of on later access
    pub fn remove_expired(&self) {
        self.inner.run_pending_tasks();
    }

    pub fn get_stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.inner.entry_count(),
            size_bytes: self.inner.weighted_size(),
            max_size_bytes: self.settings.max_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_size_bytes: u64, default_ttl_ms: u64) -> SearchResultCache<Value> {
        SearchResultCache::new(CacheSettings {
            max_size_bytes,
            default_ttl_ms,
        })
    }

    #[test]
    fn test_params_hash_ignores_key_order() {
        let a = CacheKey::new("q", Some(&json!({"limit": 5, "types": ["x"]})));
        let b = CacheKey::new("q", Some(&json!({"types": ["x"], "limit": 5})));
        let c = CacheKey::new("q", Some(&json!({"limit": 6, "types": ["x"]})));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.params_hash.len(), 64);
    }

    #[test]
    fn test_hits_and_misses() {
        let cache = cache(1024 * 1024, 60_000);
        let key = CacheKey::new("alice", None);

        assert!(cache.get(&key).is_none());
        cache.set(key.clone(), json!({"entities": []}), None);
        assert!(cache.has(&key));
        assert_eq!(cache.get(&key), Some(json!({"entities": []})));
        assert!(cache.get(&key).is_some());
        assert!(cache.get(&key).is_some());
        assert!(cache.get(&CacheKey::new("bob", None)).is_none());

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 0.6).abs() < 1e-9);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_entries_expire() {
        let cache = cache(1024 * 1024, 60_000);
        let key = CacheKey::new("short", None);
        cache.set(key.clone(), json!(1), Some(Duration::from_millis(50)));
        cache.set(CacheKey::new("long", None), json!(2), None);

        std::thread::sleep(Duration::from_millis(120));

        assert!(!cache.has(&key));
        assert!(cache.get(&key).is_none());
        cache.remove_expired();
        assert_eq!(cache.get_stats().entry_count, 1);
    }

    #[test]
    fn test_oversized_entry_not_admitted() {
        let cache = cache(64, 60_000);
        let key = CacheKey::new("big", None);
        cache.set(key.clone(), json!("x".repeat(500)), None);

        assert!(!cache.has(&key));
        assert!(cache.get_stats().size_bytes <= 64);
    }

    #[test]
    fn test_size_budget_is_respected() {
        let cache = cache(2_000, 60_000);
        for i in 0..200 {
            cache.set(CacheKey::new(format!("q{}", i), None), json!("y".repeat(50)), None);
        }

        let stats = cache.get_stats();
        assert!(stats.size_bytes <= 2_000);
        assert!(stats.entry_count < 200);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(1024 * 1024, 60_000);
        let a = CacheKey::new("a", None);
        let b = CacheKey::new("b", None);
        cache.set(a.clone(), json!(1), None);
        cache.set(b.clone(), json!(2), None);

        cache.delete(&a);
        assert!(!cache.has(&a));
        assert!(cache.has(&b));

        cache.clear();
        assert!(!cache.has(&b));
    }

    #[test]
    fn test_set_if_current_skips_results_from_before_clear() {
        let cache = cache(1024 * 1024, 60_000);
        let key = CacheKey::new("graph", None);

        let generation = cache.generation();
        cache.clear();
        assert!(!cache.set_if_current(key.clone(), json!("stale"), None, generation));
        assert!(!cache.has(&key));

        let generation = cache.generation();
        assert!(cache.set_if_current(key.clone(), json!("fresh"), None, generation));
        assert_eq!(cache.get(&key), Some(json!("fresh")));
    }
}
