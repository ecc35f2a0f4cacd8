//! Engine configuration: global limits, feature gates, performance knobs, and
//! the pre-baked optimization-level presets.

use crate::ranking::RankingAlgorithm;
use serde::{Deserialize, Serialize};

/// Pre-baked indexing/caching/ranking combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    /// Latency first: small batches, aggressive caching, single-algorithm ranking.
    Fast,
    #[default]
    Balanced,
    /// Quality first: combined ranking, larger candidate sets.
    Accurate,
}

/// Gates for the optional pipeline phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub auto_complete: bool,
    pub spell_correction: bool,
    pub semantic_search: bool,
    pub query_expansion: bool,
    pub result_clustering: bool,
    pub personalized_ranking: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_complete: true,
            spell_correction: true,
            semantic_search: false,
            query_expansion: false,
            result_clustering: false,
            personalized_ranking: false,
        }
    }
}

/// Throughput and resource knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Documents tokenized per batch during `build`.
    pub indexing_batch_size: usize,
    /// Internal pipeline budget; must leave margin inside `default_timeout_ms`.
    pub search_timeout_ms: u64,
    pub max_concurrent_searches: usize,
    /// Soft cap on estimated index size before `optimize` logs a warning.
    pub memory_threshold_bytes: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            indexing_batch_size: 100,
            search_timeout_ms: 800,
            max_concurrent_searches: 10,
            memory_threshold_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cap on results returned by a single call.
    pub max_results: usize,
    /// Hard per-search deadline in milliseconds.
    pub default_timeout_ms: u64,
    pub cache_enabled: bool,
    /// When false, `~` parses as a literal and the matcher is never consulted.
    pub fuzzy_enabled: bool,
    pub ranking_algorithm: RankingAlgorithm,
    pub optimization_level: OptimizationLevel,
    pub features: FeatureFlags,
    pub performance: PerformanceConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            default_timeout_ms: 1_000,
            cache_enabled: true,
            fuzzy_enabled: true,
            ranking_algorithm: RankingAlgorithm::Bm25,
            optimization_level: OptimizationLevel::Balanced,
            features: FeatureFlags::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl SearchConfig {
    /// Apply the preset for an optimization level on top of the defaults.
    pub fn with_optimization_level(level: OptimizationLevel) -> Self {
        let mut config = Self {
            optimization_level: level,
            ..Self::default()
        };
        match level {
            OptimizationLevel::Fast => {
                config.ranking_algorithm = RankingAlgorithm::Bm25;
                config.performance.indexing_batch_size = 50;
                config.performance.search_timeout_ms = 500;
                config.features.query_expansion = false;
            }
            OptimizationLevel::Balanced => {}
            OptimizationLevel::Accurate => {
                config.ranking_algorithm = RankingAlgorithm::Combined;
                config.performance.indexing_batch_size = 200;
                config.performance.search_timeout_ms = 900;
                config.features.query_expansion = true;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = SearchConfig::default();
        assert_eq!(config.max_results, 100);
        assert_eq!(config.default_timeout_ms, 1_000);
        assert!(config.cache_enabled);
        assert!(config.fuzzy_enabled);
        assert_eq!(config.ranking_algorithm, RankingAlgorithm::Bm25);
        assert_eq!(config.performance.indexing_batch_size, 100);
        assert_eq!(config.performance.max_concurrent_searches, 10);
    }

    #[test]
    fn timeout_budget_leaves_margin() {
        let config = SearchConfig::default();
        assert!(config.performance.search_timeout_ms < config.default_timeout_ms);
    }

    #[test]
    fn presets_change_ranking() {
        let fast = SearchConfig::with_optimization_level(OptimizationLevel::Fast);
        assert_eq!(fast.ranking_algorithm, RankingAlgorithm::Bm25);
        let accurate = SearchConfig::with_optimization_level(OptimizationLevel::Accurate);
        assert_eq!(accurate.ranking_algorithm, RankingAlgorithm::Combined);
        assert!(accurate.features.query_expansion);
    }
}
