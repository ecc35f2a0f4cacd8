//! Tiered search cache: L1 (hot, LFU), L2 (warm, LRU), optional distributed
//! L3.
//!
//! Promotion and demotion are pure decisions over an entry and the layer
//! stats, applied inside a single layer transition so an entry never exists
//! in two layers at once. Keys are deterministic fixed-seed hashes, stable
//! across runs.

pub mod layer;

pub use layer::{CacheEntry, CacheLayer, CacheLayerConfig, EvictionStrategy, LayerStats};

use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key/value operations a distributed L3 backend must provide. Values are
/// serialized bytes; TTLs are integer seconds; patterns are globs.
pub trait DistributedCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>>;
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>>;
    fn delete_pattern<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, anyhow::Result<usize>>;
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>>;
    fn expire<'a>(&'a self, key: &'a str, ttl_secs: u64) -> BoxFuture<'a, anyhow::Result<bool>>;
    fn keys<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;
    fn close<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCacheConfig {
    pub enabled: bool,
    pub l1: CacheLayerConfig,
    pub l2: CacheLayerConfig,
    /// TTL used when demoting into the distributed layer.
    pub l3_ttl_secs: u64,
    /// L2 hits past this access count are promoted to L1.
    pub promotion_access_threshold: u64,
    /// Values at or below this size are admitted straight into L1 when they
    /// are query responses.
    pub l1_admission_bytes: usize,
    /// Values above this size are flagged compressed.
    pub compression_threshold_bytes: usize,
}

impl Default for SearchCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1: CacheLayerConfig {
                max_entries: 1_000,
                max_bytes: 16 * 1024 * 1024,
                default_ttl_ms: Some(60_000),
                strategy: EvictionStrategy::Lfu,
            },
            l2: CacheLayerConfig {
                max_entries: 5_000,
                max_bytes: 64 * 1024 * 1024,
                default_ttl_ms: Some(600_000),
                strategy: EvictionStrategy::Lru,
            },
            l3_ttl_secs: 3_600,
            promotion_access_threshold: 5,
            l1_admission_bytes: 10 * 1024,
            compression_threshold_bytes: 10 * 1024,
        }
    }
}

/// Aggregate stats over the tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1: LayerStats,
    pub l2: LayerStats,
    pub l3_enabled: bool,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The tiered cache. Each layer is its own lock; locks are never held across
/// an await, and never both at once except during a promotion/demotion
/// transition.
pub struct SearchCache {
    config: SearchCacheConfig,
    l1: Mutex<CacheLayer>,
    l2: Mutex<CacheLayer>,
    l3: Option<Box<dyn DistributedCache>>,
    l3_hits: AtomicU64,
    l3_misses: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl SearchCache {
    pub fn new(
        config: SearchCacheConfig,
        clock: Arc<dyn Clock>,
        l3: Option<Box<dyn DistributedCache>>,
    ) -> Self {
        Self {
            l1: Mutex::new(CacheLayer::new("l1", config.l1.clone())),
            l2: Mutex::new(CacheLayer::new("l2", config.l2.clone())),
            l3,
            l3_hits: AtomicU64::new(0),
            l3_misses: AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Deterministic key for a query response: normalized query plus the
    /// option fields that change the result.
    pub fn query_key(normalized_query: &str, options_fingerprint: &str) -> String {
        format!("q:{}", hash_key(&format!("{normalized_query}|{options_fingerprint}")))
    }

    pub fn term_key(term: &str) -> String {
        format!("t:{term}")
    }

    pub fn index_key(name: &str) -> String {
        format!("idx:{name}")
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let now_ms = self.clock.now_ms();

        if let Some(value) = self.lock_l1().get(key, now_ms) {
            return Some(value);
        }

        // L2 hit: maybe promote into L1 inside one transition
        let promoted = {
            let mut l2 = self.lock_l2();
            match l2.get(key, now_ms) {
                Some(value) => {
                    let access_count = l2.access_count(key).unwrap_or(0);
                    let taken = l2.take(key);
                    let promotable = taken
                        .and_then(|entry| {
                            let promote = access_count > self.config.promotion_access_threshold
                                || (entry.size_bytes <= self.config.l1_admission_bytes
                                    && entry.key.starts_with("q:"));
                            if promote {
                                Some(entry)
                            } else {
                                // not promotable; put it back untouched
                                l2.insert_entry(entry, now_ms);
                                None
                            }
                        });
                    Some((value, promotable))
                }
                None => None,
            }
        };
        if let Some((value, promotable)) = promoted {
            if let Some(entry) = promotable {
                debug!(key, "promoting cache entry to l1");
                let demoted = self.lock_l1().insert_entry(entry, now_ms);
                self.demote_from_l1(demoted, now_ms).await;
            }
            return Some(value);
        }

        // distributed layer; its outcome settles the request's hit/miss
        // accounting, since an L2 miss was already counted above
        if let Some(l3) = &self.l3 {
            match l3.get(key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        self.l3_hits.fetch_add(1, Ordering::Relaxed);
                        let size = bytes.len();
                        let evicted = self.lock_l2().set(
                            key.to_string(),
                            value.clone(),
                            None,
                            size,
                            size > self.config.compression_threshold_bytes,
                            now_ms,
                        );
                        self.demote_from_l2(evicted).await;
                        return Some(value);
                    }
                    Err(err) => {
                        self.l3_misses.fetch_add(1, Ordering::Relaxed);
                        warn!(key, %err, "discarding undecodable l3 value");
                    }
                },
                Ok(None) => {
                    self.l3_misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.l3_misses.fetch_add(1, Ordering::Relaxed);
                    warn!(key, %err, "l3 get failed; treating as miss");
                }
            }
        }
        None
    }

    pub async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) {
        if !self.config.enabled {
            return;
        }
        let now_ms = self.clock.now_ms();
        let size_bytes = estimate_size(&value);
        let compressed = size_bytes > self.config.compression_threshold_bytes;

        // small query payloads go hot; everything else starts warm
        if size_bytes <= self.config.l1_admission_bytes {
            let demoted =
                self.lock_l1()
                    .set(key.to_string(), value, ttl_ms, size_bytes, compressed, now_ms);
            self.demote_from_l1(demoted, now_ms).await;
        } else {
            let evicted =
                self.lock_l2()
                    .set(key.to_string(), value, ttl_ms, size_bytes, compressed, now_ms);
            self.demote_from_l2(evicted).await;
        }
    }

    pub async fn has(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now_ms = self.clock.now_ms();
        if self.lock_l1().has(key, now_ms) || self.lock_l2().has(key, now_ms) {
            return true;
        }
        if let Some(l3) = &self.l3 {
            match l3.exists(key).await {
                Ok(exists) => return exists,
                Err(err) => warn!(key, %err, "l3 exists failed"),
            }
        }
        false
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut deleted = self.lock_l1().delete(key);
        deleted |= self.lock_l2().delete(key);
        if let Some(l3) = &self.l3 {
            match l3.delete(key).await {
                Ok(l3_deleted) => deleted |= l3_deleted,
                Err(err) => warn!(key, %err, "l3 delete failed"),
            }
        }
        deleted
    }

    /// Remove every key matching the glob pattern. Returns how many in-memory
    /// entries were dropped.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let now_ms = self.clock.now_ms();
        let Ok(compiled) = glob::Pattern::new(pattern) else {
            warn!(pattern, "invalid cache invalidation pattern");
            return 0;
        };
        let mut removed = 0;
        for layer in [&self.l1, &self.l2] {
            let mut guard = lock(layer);
            let matching: Vec<String> = guard
                .keys(now_ms)
                .into_iter()
                .filter(|key| compiled.matches(key))
                .collect();
            for key in matching {
                if guard.delete(&key) {
                    removed += 1;
                }
            }
        }
        if let Some(l3) = &self.l3 {
            if let Err(err) = l3.delete_pattern(pattern).await {
                warn!(pattern, %err, "l3 delete_pattern failed");
            }
        }
        removed
    }

    pub async fn clear(&self) {
        self.lock_l1().clear();
        self.lock_l2().clear();
        if let Some(l3) = &self.l3 {
            if let Err(err) = l3.delete_pattern("*").await {
                warn!(%err, "l3 clear failed");
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_ms: u64) -> bool {
        let now_ms = self.clock.now_ms();
        let mut updated = self.lock_l1().expire(key, ttl_ms, now_ms);
        updated |= self.lock_l2().expire(key, ttl_ms, now_ms);
        if let Some(l3) = &self.l3 {
            match l3.expire(key, ttl_ms.div_ceil(1_000)).await {
                Ok(l3_updated) => updated |= l3_updated,
                Err(err) => warn!(key, %err, "l3 expire failed"),
            }
        }
        updated
    }

    /// Live keys across the in-memory tiers, optionally filtered by glob.
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let now_ms = self.clock.now_ms();
        let compiled = pattern.and_then(|p| glob::Pattern::new(p).ok());
        let mut keys = self.lock_l1().keys(now_ms);
        keys.extend(self.lock_l2().keys(now_ms));
        keys.sort_unstable();
        keys.dedup();
        match compiled {
            Some(compiled) => keys.into_iter().filter(|k| compiled.matches(k)).collect(),
            None => keys,
        }
    }

    /// Pre-populate the warm tier.
    pub async fn warm(&self, entries: Vec<(String, Value, Option<u64>)>) {
        let now_ms = self.clock.now_ms();
        for (key, value, ttl_ms) in entries {
            let size = estimate_size(&value);
            let compressed = size > self.config.compression_threshold_bytes;
            let evicted = self.lock_l2().set(key, value, ttl_ms, size, compressed, now_ms);
            self.demote_from_l2(evicted).await;
        }
    }

    /// Invalidate everything touching a document: keys embedding its id, plus
    /// categorized keys (`category:X`, `tag:Y`).
    pub async fn invalidate_document(&self, doc_id: &str, category: &str, tags: &[String]) {
        self.delete_pattern(&format!("*{doc_id}*")).await;
        self.delete_pattern(&format!("*category:{category}*")).await;
        for tag in tags {
            self.delete_pattern(&format!("*tag:{tag}*")).await;
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        let l1 = self.lock_l1().stats();
        let l2 = self.lock_l2().stats();
        let l3_hits = self.l3_hits.load(Ordering::Relaxed);
        let l3_misses = self.l3_misses.load(Ordering::Relaxed);
        CacheStats {
            hits: l1.hits + l2.hits + l3_hits,
            // a miss in one tier answered by a deeper tier is still a cache
            // hit; only the last tier's misses are real misses
            misses: if self.l3.is_some() { l3_misses } else { l2.misses },
            l3_enabled: self.l3.is_some(),
            l3_hits,
            l3_misses,
            l1,
            l2,
        }
    }

    /// Drop expired entries in both in-memory tiers.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.lock_l1().purge_expired(now_ms) + self.lock_l2().purge_expired(now_ms)
    }

    /// Flush and close the distributed layer.
    pub async fn close(&self) {
        if let Some(l3) = &self.l3 {
            if let Err(err) = l3.close().await {
                warn!(%err, "l3 close failed");
            }
        }
    }

    /// L1 evictees with more than one access are still warm; keep them in L2.
    async fn demote_from_l1(&self, evicted: Vec<CacheEntry>, now_ms: i64) {
        let mut l2_evicted = Vec::new();
        {
            let mut l2 = self.lock_l2();
            for entry in evicted {
                if entry.access_count > 1 {
                    debug!(key = %entry.key, "demoting cache entry to l2");
                    l2_evicted.extend(l2.insert_entry(entry, now_ms));
                }
            }
        }
        self.demote_from_l2(l2_evicted).await;
    }

    /// L2 evictees that were ever accessed spill into the distributed layer.
    async fn demote_from_l2(&self, evicted: Vec<CacheEntry>) {
        let Some(l3) = &self.l3 else {
            return;
        };
        for entry in evicted {
            if entry.access_count == 0 {
                continue;
            }
            match serde_json::to_vec(&entry.value) {
                Ok(bytes) => {
                    if let Err(err) = l3.set(&entry.key, bytes, Some(self.config.l3_ttl_secs)).await
                    {
                        warn!(key = %entry.key, %err, "l3 demotion write failed");
                    }
                }
                Err(err) => warn!(key = %entry.key, %err, "unserializable cache value"),
            }
        }
    }

    fn lock_l1(&self) -> MutexGuard<'_, CacheLayer> {
        lock(&self.l1)
    }

    fn lock_l2(&self) -> MutexGuard<'_, CacheLayer> {
        lock(&self.l2)
    }
}

fn lock(layer: &Mutex<CacheLayer>) -> MutexGuard<'_, CacheLayer> {
    layer.lock().unwrap_or_else(|poisoned| {
        warn!("cache layer lock poisoned; continuing with recovered state");
        poisoned.into_inner()
    })
}

/// Fixed-seed deterministic hash, stable across runs.
pub fn hash_key(input: &str) -> String {
    use ahash::RandomState;
    let build_hasher = RandomState::with_seeds(
        0x0123_4567_89ab_cdef,
        0xfedc_ba98_7654_3210,
        0x1111_1111_1111_1111,
        0x2222_2222_2222_2222,
    );
    format!("{:x}", build_hasher.hash_one(input))
}

/// Size estimate from the serialized shape of the value.
pub fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::collections::HashMap;

    fn cache_with_clock() -> (SearchCache, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        let cache = SearchCache::new(SearchCacheConfig::default(), clock.clone(), None);
        (cache, clock)
    }

    /// In-memory distributed layer for exercising the L3 path.
    #[derive(Default)]
    struct MapL3 {
        store: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl DistributedCache for MapL3 {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
            Box::pin(async move { Ok(lock_map(&self.store).get(key).cloned()) })
        }

        fn set<'a>(
            &'a self,
            key: &'a str,
            value: Vec<u8>,
            _ttl_secs: Option<u64>,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                lock_map(&self.store).insert(key.to_string(), value);
                Ok(())
            })
        }

        fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
            Box::pin(async move { Ok(lock_map(&self.store).remove(key).is_some()) })
        }

        fn delete_pattern<'a>(&'a self, _pattern: &'a str) -> BoxFuture<'a, anyhow::Result<usize>> {
            Box::pin(async move {
                let mut store = lock_map(&self.store);
                let count = store.len();
                store.clear();
                Ok(count)
            })
        }

        fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
            Box::pin(async move { Ok(lock_map(&self.store).contains_key(key)) })
        }

        fn expire<'a>(&'a self, _key: &'a str, _ttl_secs: u64) -> BoxFuture<'a, anyhow::Result<bool>> {
            Box::pin(async move { Ok(false) })
        }

        fn keys<'a>(&'a self, _pattern: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
            Box::pin(async move { Ok(lock_map(&self.store).keys().cloned().collect()) })
        }

        fn close<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn lock_map(map: &Mutex<HashMap<String, Vec<u8>>>) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[tokio::test]
    async fn get_after_set_round_trips() {
        let (cache, _clock) = cache_with_clock();
        cache.set("q:1", json!({"results": []}), None).await;
        assert_eq!(cache.get("q:1").await, Some(json!({"results": []})));
        assert!(cache.has("q:1").await);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let (cache, clock) = cache_with_clock();
        cache.set("q:1", json!(1), Some(1_000)).await;
        clock.advance_ms(999);
        assert!(cache.get("q:1").await.is_some());
        clock.advance_ms(2);
        assert!(cache.get("q:1").await.is_none());
    }

    #[tokio::test]
    async fn delete_pattern_star_empties_cache() {
        let (cache, _clock) = cache_with_clock();
        cache.set("q:1", json!(1), None).await;
        cache.set("t:abend", json!(2), None).await;
        let big = json!("x".repeat(20 * 1024)); // lands in L2
        cache.set("q:big", big, None).await;
        let removed = cache.delete_pattern("*").await;
        assert_eq!(removed, 3);
        assert!(cache.keys(None).is_empty());
    }

    #[tokio::test]
    async fn delete_pattern_is_selective() {
        let (cache, _clock) = cache_with_clock();
        cache.set("q:abc", json!(1), None).await;
        cache.set("t:term", json!(2), None).await;
        let removed = cache.delete_pattern("q:*").await;
        assert_eq!(removed, 1);
        assert!(cache.get("t:term").await.is_some());
    }

    #[tokio::test]
    async fn large_values_start_in_l2_and_promote_on_traffic() {
        let (cache, _clock) = cache_with_clock();
        let big = json!("x".repeat(20 * 1024));
        cache.set("q:big", big.clone(), None).await;
        assert_eq!(cache.get_stats().l2.entries, 1);
        assert_eq!(cache.get_stats().l1.entries, 0);

        // cross the promotion threshold
        for _ in 0..7 {
            assert!(cache.get("q:big").await.is_some());
        }
        let stats = cache.get_stats();
        assert_eq!(stats.l1.entries, 1);
        // promotion never duplicates an entry across layers
        assert_eq!(stats.l2.entries, 0);
    }

    #[tokio::test]
    async fn warm_populates_the_warm_tier() {
        let (cache, _clock) = cache_with_clock();
        cache
            .warm(vec![("idx:popular_terms".to_string(), json!(["abend"]), None)])
            .await;
        assert_eq!(cache.get_stats().l2.entries, 1);
        assert_eq!(cache.get("idx:popular_terms").await, Some(json!(["abend"])));
    }

    #[tokio::test]
    async fn invalidate_document_removes_matching_keys() {
        let (cache, _clock) = cache_with_clock();
        cache.set("doc:KB-7:view", json!(1), None).await;
        cache.set("q:category:vsam:list", json!(2), None).await;
        cache.set("q:unrelated", json!(3), None).await;
        cache
            .invalidate_document("KB-7", "vsam", &["abend".to_string()])
            .await;
        assert!(cache.get("doc:KB-7:view").await.is_none());
        assert!(cache.get("q:category:vsam:list").await.is_none());
        assert!(cache.get("q:unrelated").await.is_some());
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let clock = ManualClock::new(0);
        let config = SearchCacheConfig {
            enabled: false,
            ..SearchCacheConfig::default()
        };
        let cache = SearchCache::new(config, clock, None);
        cache.set("q:1", json!(1), None).await;
        assert!(cache.get("q:1").await.is_none());
        assert!(!cache.has("q:1").await);
    }

    #[tokio::test]
    async fn l3_served_requests_count_as_hits() {
        let l3 = MapL3::default();
        l3.set("q:warm", serde_json::to_vec(&json!(42)).unwrap(), None)
            .await
            .unwrap();

        let clock = ManualClock::new(0);
        let cache = SearchCache::new(SearchCacheConfig::default(), clock, Some(Box::new(l3)));

        // misses L1 and L2, answered by L3
        assert_eq!(cache.get("q:warm").await, Some(json!(42)));
        let stats = cache.get_stats();
        assert_eq!(stats.l3_hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate(), 1.0);
        // the L3 hit was pulled up into the warm tier
        assert_eq!(stats.l2.entries, 1);

        // a true miss lands in the last tier's counter
        assert!(cache.get("q:absent").await.is_none());
        let stats = cache.get_stats();
        assert_eq!(stats.l3_misses, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.hit_rate() < 1.0);
    }

    #[test]
    fn key_helpers_are_deterministic() {
        let a = SearchCache::query_key("vsam status", "limit=10");
        let b = SearchCache::query_key("vsam status", "limit=10");
        let c = SearchCache::query_key("vsam status", "limit=20");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("q:"));
        assert_eq!(SearchCache::term_key("abend"), "t:abend");
        assert_eq!(SearchCache::index_key("stats"), "idx:stats");
    }

    #[tokio::test]
    async fn expire_updates_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.set("q:1", json!(1), Some(1_000)).await;
        assert!(cache.expire("q:1", 100_000).await);
        clock.advance_ms(50_000);
        assert!(cache.get("q:1").await.is_some());
    }
}
