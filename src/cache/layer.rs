//! One cache layer: a bounded map with TTL, byte accounting, and a pluggable
//! eviction strategy. Layers know nothing about tiering; promotion and
//! demotion decisions live in [`crate::cache`].

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Ttl,
    Size,
    Adaptive,
}

/// A stored value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub ttl_ms: Option<u64>,
    pub created_ms: i64,
    pub last_accessed_ms: i64,
    pub access_count: u64,
    pub size_bytes: usize,
    pub compressed: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now_ms - self.created_ms >= ttl as i64,
            None => false,
        }
    }

    pub fn remaining_ttl_ms(&self, now_ms: i64) -> Option<i64> {
        self.ttl_ms
            .map(|ttl| self.created_ms + ttl as i64 - now_ms)
    }

    /// Score used by the adaptive strategy; the entry with the lowest score
    /// is evicted.
    fn adaptive_score(&self, now_ms: i64) -> f64 {
        let recency_secs = ((now_ms - self.last_accessed_ms) / 1_000).max(0) as f64;
        let size_kb = self.size_bytes as f64 / 1024.0;
        let remaining_secs = self
            .remaining_ttl_ms(now_ms)
            .map(|ms| (ms / 1_000).max(0) as f64)
            .unwrap_or(0.0);
        10.0 * (1.0 + self.access_count as f64).ln() + (100.0 - recency_secs).max(0.0)
            - size_kb.sqrt()
            + remaining_secs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLayerConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub default_ttl_ms: Option<u64>,
    pub strategy: EvictionStrategy,
}

/// Counters exposed through `get_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub total_bytes: usize,
}

impl LayerStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct CacheLayer {
    name: &'static str,
    config: CacheLayerConfig,
    entries: AHashMap<String, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheLayer {
    pub fn new(name: &'static str, config: CacheLayerConfig) -> Self {
        Self {
            name,
            config,
            entries: AHashMap::new(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fetch and touch. Expired entries are dropped and reported as misses.
    pub fn get(&mut self, key: &str, now_ms: i64) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now_ms),
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            if let Some(entry) = self.entries.remove(key) {
                self.total_bytes -= entry.size_bytes;
                self.expirations += 1;
            }
            self.misses += 1;
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_ms = now_ms;
        entry.access_count += 1;
        self.hits += 1;
        Some(entry.value.clone())
    }

    /// Non-mutating presence check; expiry still applies.
    pub fn has(&self, key: &str, now_ms: i64) -> bool {
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired(now_ms))
            .unwrap_or(false)
    }

    /// Access count of a live entry, for promotion decisions.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.access_count)
    }

    /// Insert a fresh entry. Returns the entries evicted to make room, so the
    /// tier logic can demote them.
    pub fn set(
        &mut self,
        key: String,
        value: Value,
        ttl_ms: Option<u64>,
        size_bytes: usize,
        compressed: bool,
        now_ms: i64,
    ) -> Vec<CacheEntry> {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            ttl_ms: ttl_ms.or(self.config.default_ttl_ms),
            created_ms: now_ms,
            last_accessed_ms: now_ms,
            access_count: 0,
            size_bytes,
            compressed,
        };
        self.insert_entry(entry, now_ms)
    }

    /// Insert a pre-built entry (promotion/demotion path preserves counters).
    pub fn insert_entry(&mut self, entry: CacheEntry, now_ms: i64) -> Vec<CacheEntry> {
        if let Some(old) = self.entries.remove(&entry.key) {
            self.total_bytes -= old.size_bytes;
        }
        self.total_bytes += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
        self.evict_to_capacity(now_ms)
    }

    /// Remove an entry without counting it as an eviction (promotion moves).
    pub fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.take(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn keys(&self, now_ms: i64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Reset an entry's TTL window.
    pub fn expire(&mut self, key: &str, ttl_ms: u64, now_ms: i64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.ttl_ms = Some(ttl_ms);
                entry.created_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry; returns how many went.
    pub fn purge_expired(&mut self, now_ms: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired(now_ms))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                self.total_bytes -= entry.size_bytes;
                self.expirations += 1;
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
        }
    }

    fn evict_to_capacity(&mut self, now_ms: i64) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.config.max_entries
            || self.total_bytes > self.config.max_bytes
        {
            // expired entries go first; they are not demotion candidates
            if self.purge_expired(now_ms) > 0 {
                continue;
            }
            let Some(victim_key) = self.pick_victim(now_ms) else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim_key) {
                self.total_bytes -= entry.size_bytes;
                self.evictions += 1;
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Victim choice per strategy, with a key tie-break for determinism.
    fn pick_victim(&self, now_ms: i64) -> Option<String> {
        let best = |a: (f64, &str), b: (f64, &str)| -> bool {
            a.0 < b.0 || (a.0 == b.0 && a.1 < b.1)
        };
        let mut victim: Option<(f64, &str)> = None;
        for entry in self.entries.values() {
            let rank = match self.config.strategy {
                EvictionStrategy::Lru => entry.last_accessed_ms as f64,
                EvictionStrategy::Lfu => {
                    entry.access_count as f64 * 1e15 + entry.last_accessed_ms as f64
                }
                EvictionStrategy::Ttl => entry
                    .remaining_ttl_ms(now_ms)
                    .map(|ms| ms as f64)
                    .unwrap_or(f64::MAX),
                EvictionStrategy::Size => -(entry.size_bytes as f64),
                EvictionStrategy::Adaptive => entry.adaptive_score(now_ms),
            };
            let candidate = (rank, entry.key.as_str());
            victim = match victim {
                Some(current) if best(current, candidate) => Some(current),
                _ => Some(candidate),
            };
        }
        victim.map(|(_, key)| key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layer(strategy: EvictionStrategy, max_entries: usize) -> CacheLayer {
        CacheLayer::new(
            "test",
            CacheLayerConfig {
                max_entries,
                max_bytes: 1024 * 1024,
                default_ttl_ms: Some(60_000),
                strategy,
            },
        )
    }

    #[test]
    fn get_after_set_returns_value() {
        let mut l = layer(EvictionStrategy::Lru, 10);
        l.set("k1".into(), json!({"v": 1}), None, 16, false, 0);
        assert_eq!(l.get("k1", 10), Some(json!({"v": 1})));
        assert_eq!(l.stats().hits, 1);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let mut l = layer(EvictionStrategy::Lru, 10);
        l.set("k1".into(), json!(1), Some(1_000), 8, false, 0);
        assert_eq!(l.get("k1", 999), Some(json!(1)));
        assert_eq!(l.get("k1", 1_000), None);
        assert!(!l.has("k1", 1_000));
        assert_eq!(l.stats().expirations, 1);
    }

    #[test]
    fn byte_accounting_tracks_live_entries() {
        let mut l = layer(EvictionStrategy::Lru, 10);
        l.set("k1".into(), json!(1), None, 100, false, 0);
        l.set("k2".into(), json!(2), None, 200, false, 0);
        assert_eq!(l.stats().total_bytes, 300);
        l.delete("k1");
        assert_eq!(l.stats().total_bytes, 200);
        // overwrite replaces, not adds
        l.set("k2".into(), json!(3), None, 50, false, 0);
        assert_eq!(l.stats().total_bytes, 50);
        l.clear();
        assert_eq!(l.stats().total_bytes, 0);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut l = layer(EvictionStrategy::Lru, 2);
        l.set("a".into(), json!(1), None, 8, false, 0);
        l.set("b".into(), json!(2), None, 8, false, 1);
        l.get("a", 2);
        let evicted = l.set("c".into(), json!(3), None, 8, false, 3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert!(l.has("a", 4) && l.has("c", 4));
    }

    #[test]
    fn lfu_evicts_least_frequently_used() {
        let mut l = layer(EvictionStrategy::Lfu, 2);
        l.set("a".into(), json!(1), None, 8, false, 0);
        l.set("b".into(), json!(2), None, 8, false, 0);
        l.get("a", 1);
        l.get("a", 2);
        l.get("b", 3);
        let evicted = l.set("c".into(), json!(3), None, 8, false, 4);
        assert_eq!(evicted[0].key, "b");
    }

    #[test]
    fn size_strategy_evicts_largest() {
        let mut l = layer(EvictionStrategy::Size, 2);
        l.set("small".into(), json!(1), None, 8, false, 0);
        l.set("large".into(), json!(2), None, 512, false, 0);
        let evicted = l.set("c".into(), json!(3), None, 8, false, 1);
        assert_eq!(evicted[0].key, "large");
    }

    #[test]
    fn ttl_strategy_evicts_soonest_to_expire() {
        let mut l = layer(EvictionStrategy::Ttl, 2);
        l.set("short".into(), json!(1), Some(1_000), 8, false, 0);
        l.set("long".into(), json!(2), Some(60_000), 8, false, 0);
        let evicted = l.set("c".into(), json!(3), Some(30_000), 8, false, 1);
        assert_eq!(evicted[0].key, "short");
    }

    #[test]
    fn adaptive_prefers_keeping_hot_entries() {
        let mut l = layer(EvictionStrategy::Adaptive, 2);
        l.set("hot".into(), json!(1), Some(60_000), 8, false, 0);
        l.set("cold".into(), json!(2), Some(60_000), 8, false, 0);
        for t in 1..=5 {
            l.get("hot", t);
        }
        let evicted = l.set("new".into(), json!(3), Some(60_000), 8, false, 10);
        assert_eq!(evicted[0].key, "cold");
    }

    #[test]
    fn expired_entries_evict_before_live_ones() {
        let mut l = layer(EvictionStrategy::Lru, 2);
        l.set("dead".into(), json!(1), Some(10), 8, false, 0);
        l.set("live".into(), json!(2), Some(60_000), 8, false, 0);
        let evicted = l.set("new".into(), json!(3), Some(60_000), 8, false, 1_000);
        // the expired entry is purged, not demoted
        assert!(evicted.is_empty());
        assert!(!l.has("dead", 1_001));
        assert!(l.has("live", 1_001));
    }

    #[test]
    fn expire_resets_the_ttl_window() {
        let mut l = layer(EvictionStrategy::Lru, 10);
        l.set("k".into(), json!(1), Some(1_000), 8, false, 0);
        assert!(l.expire("k", 10_000, 900));
        assert!(l.has("k", 5_000));
        assert!(!l.has("k", 10_900));
        assert!(!l.expire("missing", 1_000, 0));
    }

    #[test]
    fn keys_are_sorted_and_live_only() {
        let mut l = layer(EvictionStrategy::Lru, 10);
        l.set("b".into(), json!(1), None, 8, false, 0);
        l.set("a".into(), json!(2), None, 8, false, 0);
        l.set("dead".into(), json!(3), Some(10), 8, false, 0);
        assert_eq!(l.keys(100), vec!["a".to_string(), "b".to_string()]);
    }
}
