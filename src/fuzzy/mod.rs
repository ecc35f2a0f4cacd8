//! Approximate string matching over the index vocabulary.
//!
//! Each candidate is scored by a weighted mean of the enabled algorithms;
//! confidence reflects how much the algorithms agree (1 minus the standard
//! deviation of their scores). A domain synonym table short-circuits variant
//! checks before any distance work.

pub mod edit;
pub mod jaro;
pub mod phonetic;

pub use edit::EditCounts;

use crate::domain;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;

const PHONETIC_MEMO_CAPACITY: usize = 4_096;

/// The matching algorithms the combiner can consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyAlgorithm {
    Levenshtein,
    DamerauLevenshtein,
    Jaro,
    JaroWinkler,
    Soundex,
    Metaphone,
}

impl FuzzyAlgorithm {
    pub const DEFAULT_SET: [FuzzyAlgorithm; 5] = [
        FuzzyAlgorithm::Levenshtein,
        FuzzyAlgorithm::DamerauLevenshtein,
        FuzzyAlgorithm::JaroWinkler,
        FuzzyAlgorithm::Soundex,
        FuzzyAlgorithm::Metaphone,
    ];
}

/// Per-algorithm weights for the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuzzyWeights {
    pub levenshtein: f64,
    pub damerau: f64,
    pub jaro: f64,
    pub jaro_winkler: f64,
    pub soundex: f64,
    pub metaphone: f64,
}

impl Default for FuzzyWeights {
    fn default() -> Self {
        Self {
            levenshtein: 0.25,
            damerau: 0.25,
            jaro: 0.2,
            jaro_winkler: 0.3,
            soundex: 0.1,
            metaphone: 0.1,
        }
    }
}

impl FuzzyWeights {
    fn weight(&self, algorithm: FuzzyAlgorithm) -> f64 {
        match algorithm {
            FuzzyAlgorithm::Levenshtein => self.levenshtein,
            FuzzyAlgorithm::DamerauLevenshtein => self.damerau,
            FuzzyAlgorithm::Jaro => self.jaro,
            FuzzyAlgorithm::JaroWinkler => self.jaro_winkler,
            FuzzyAlgorithm::Soundex => self.soundex,
            FuzzyAlgorithm::Metaphone => self.metaphone,
        }
    }
}

/// Filters and weights for one matching pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyOptions {
    /// Edit-distance ceiling; stretched by one for terms longer than eight
    /// characters, where a fixed ceiling is too strict.
    pub max_distance: usize,
    pub min_similarity: f64,
    pub algorithms: Vec<FuzzyAlgorithm>,
    pub weights: FuzzyWeights,
}

impl Default for FuzzyOptions {
    fn default() -> Self {
        Self {
            max_distance: 2,
            min_similarity: 0.5,
            algorithms: FuzzyAlgorithm::DEFAULT_SET.to_vec(),
            weights: FuzzyWeights::default(),
        }
    }
}

impl FuzzyOptions {
    pub fn with_max_distance(max_distance: usize) -> Self {
        Self {
            max_distance,
            ..Self::default()
        }
    }

    fn effective_max_distance(&self, term: &str) -> usize {
        if term.chars().count() > 8 {
            self.max_distance + 1
        } else {
            self.max_distance
        }
    }
}

/// One vocabulary term matched against the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch {
    pub term: String,
    pub distance: usize,
    pub similarity: f64,
    pub confidence: f64,
    /// The algorithm that scored this pair highest.
    pub algorithm: FuzzyAlgorithm,
    pub transformations: EditCounts,
}

/// Multi-algorithm approximate matcher with bounded phonetic memoization.
pub struct FuzzyMatcher {
    soundex_memo: Mutex<LruCache<String, String>>,
    metaphone_memo: Mutex<LruCache<String, String>>,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzyMatcher {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(PHONETIC_MEMO_CAPACITY).unwrap();
        Self {
            soundex_memo: Mutex::new(LruCache::new(capacity)),
            metaphone_memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Score every vocabulary term against `term`, returning matches that
    /// survive the distance and similarity filters, ordered by descending
    /// similarity then descending confidence.
    pub fn find_matches<'a, I>(&self, term: &str, vocabulary: I, options: &FuzzyOptions) -> Vec<FuzzyMatch>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let probe = term.to_lowercase();
        if probe.is_empty() || options.algorithms.is_empty() {
            return Vec::new();
        }
        let max_distance = options.effective_max_distance(&probe);

        let mut matches = Vec::new();
        for candidate in vocabulary {
            let candidate_lower = candidate.to_lowercase();
            let (distance, transformations) = edit::damerau_with_counts(&probe, &candidate_lower);
            if distance > max_distance {
                continue;
            }

            let mut scores = Vec::with_capacity(options.algorithms.len());
            let mut weighted_sum = 0.0;
            let mut weight_total = 0.0;
            let mut best: (FuzzyAlgorithm, f64) = (options.algorithms[0], -1.0);
            for &algorithm in &options.algorithms {
                let score = self.similarity(&probe, &candidate_lower, algorithm);
                let weight = options.weights.weight(algorithm);
                weighted_sum += weight * score;
                weight_total += weight;
                if score > best.1 {
                    best = (algorithm, score);
                }
                scores.push(score);
            }
            if weight_total <= 0.0 {
                continue;
            }
            let similarity = weighted_sum / weight_total;
            if similarity < options.min_similarity {
                continue;
            }

            matches.push(FuzzyMatch {
                term: candidate.to_string(),
                distance,
                similarity,
                confidence: confidence_from_scores(&scores),
                algorithm: best.0,
                transformations,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.term.cmp(&b.term))
        });
        matches
    }

    /// Top-k matching terms.
    pub fn suggest<'a, I>(&self, term: &str, vocabulary: I, k: usize) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.find_matches(term, vocabulary, &FuzzyOptions::default())
            .into_iter()
            .take(k)
            .map(|m| m.term)
            .collect()
    }

    /// Direct similarity between two strings under one algorithm.
    pub fn similarity(&self, a: &str, b: &str, algorithm: FuzzyAlgorithm) -> f64 {
        match algorithm {
            FuzzyAlgorithm::Levenshtein => edit_similarity(edit::levenshtein(a, b), a, b),
            FuzzyAlgorithm::DamerauLevenshtein => {
                edit_similarity(edit::damerau_levenshtein(a, b), a, b)
            }
            FuzzyAlgorithm::Jaro => jaro::jaro(a, b),
            FuzzyAlgorithm::JaroWinkler => jaro::jaro_winkler(a, b),
            FuzzyAlgorithm::Soundex => {
                let code_a = self.soundex_code(a);
                let code_b = self.soundex_code(b);
                binary_similarity(&code_a, &code_b)
            }
            FuzzyAlgorithm::Metaphone => {
                let code_a = self.metaphone_code(a);
                let code_b = self.metaphone_code(b);
                binary_similarity(&code_a, &code_b)
            }
        }
    }

    /// Domain-aware variant check: listed synonyms, or a strong
    /// Jaro-Winkler signal.
    pub fn are_variants(&self, a: &str, b: &str) -> bool {
        let a_lower = a.to_lowercase();
        let b_lower = b.to_lowercase();
        if a_lower == b_lower {
            return true;
        }
        let listed = |x: &str, y: &str| {
            domain::variants_of(x)
                .map(|vs| vs.iter().any(|v| *v == y))
                .unwrap_or(false)
        };
        if listed(&a_lower, &b_lower) || listed(&b_lower, &a_lower) {
            return true;
        }
        jaro::jaro_winkler(&a_lower, &b_lower) > 0.8
    }

    fn soundex_code(&self, word: &str) -> String {
        if let Ok(mut memo) = self.soundex_memo.lock() {
            if let Some(code) = memo.get(word) {
                return code.clone();
            }
            let code = phonetic::soundex(word);
            memo.put(word.to_string(), code.clone());
            return code;
        }
        phonetic::soundex(word)
    }

    fn metaphone_code(&self, word: &str) -> String {
        if let Ok(mut memo) = self.metaphone_memo.lock() {
            if let Some(code) = memo.get(word) {
                return code.clone();
            }
            let code = phonetic::metaphone(word);
            memo.put(word.to_string(), code.clone());
            return code;
        }
        phonetic::metaphone(word)
    }
}

fn edit_similarity(distance: usize, a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - distance as f64 / longest as f64
}

fn binary_similarity(code_a: &str, code_b: &str) -> f64 {
    if !code_a.is_empty() && code_a == code_b {
        1.0
    } else {
        0.0
    }
}

/// Agreement across algorithms: 1 minus the standard deviation of scores.
fn confidence_from_scores(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 1.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    (1.0 - variance.sqrt()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> FuzzyMatcher {
        FuzzyMatcher::new()
    }

    #[test]
    fn self_similarity_is_one_for_every_algorithm() {
        let m = matcher();
        for algorithm in FuzzyAlgorithm::DEFAULT_SET {
            for word in ["database", "vsam", "abend", "s0c7"] {
                assert_eq!(m.similarity(word, word, algorithm), 1.0, "{algorithm:?} {word}");
            }
        }
    }

    #[test]
    fn symmetric_algorithms_are_symmetric() {
        let m = matcher();
        let symmetric = [
            FuzzyAlgorithm::Levenshtein,
            FuzzyAlgorithm::DamerauLevenshtein,
            FuzzyAlgorithm::Jaro,
            FuzzyAlgorithm::JaroWinkler,
        ];
        for algorithm in symmetric {
            for (a, b) in [("databse", "database"), ("jcl", "jes2"), ("abedn", "abend")] {
                assert_eq!(
                    m.similarity(a, b, algorithm),
                    m.similarity(b, a, algorithm),
                    "{algorithm:?} {a}/{b}"
                );
            }
        }
    }

    #[test]
    fn phonetic_similarity_is_binary() {
        let m = matcher();
        for (a, b) in [("database", "databse"), ("abend", "xyz"), ("smith", "smyth")] {
            for algorithm in [FuzzyAlgorithm::Soundex, FuzzyAlgorithm::Metaphone] {
                let s = m.similarity(a, b, algorithm);
                assert!(s == 0.0 || s == 1.0, "{algorithm:?} {a}/{b} gave {s}");
            }
        }
    }

    #[test]
    fn misspelling_finds_the_right_term_first() {
        let m = matcher();
        let vocabulary = ["database", "dataset", "datacom", "deadline"];
        let matches = m.find_matches("databse", vocabulary, &FuzzyOptions::default());
        assert!(!matches.is_empty());
        assert_eq!(matches[0].term, "database");
        assert_eq!(matches[0].distance, 1);
        assert!(matches[0].similarity > 0.8);
        assert!((0.0..=1.0).contains(&matches[0].confidence));
    }

    #[test]
    fn distance_filter_prunes_far_terms() {
        let m = matcher();
        let matches = m.find_matches(
            "jcl",
            ["completely", "different"],
            &FuzzyOptions::default(),
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn suggest_returns_top_k() {
        let m = matcher();
        let suggestions = m.suggest("databse", ["database", "dataset", "databases"], 1);
        assert_eq!(suggestions, vec!["database".to_string()]);
    }

    #[test]
    fn variants_use_table_then_jaro_winkler() {
        let m = matcher();
        assert!(m.are_variants("abend", "error"));
        assert!(m.are_variants("ERROR", "abend"));
        assert!(m.are_variants("dataset", "datasets")); // jw > 0.8
        assert!(!m.are_variants("jcl", "deadlock"));
    }

    #[test]
    fn ordering_is_similarity_then_confidence() {
        let m = matcher();
        let matches = m.find_matches("status", ["status", "statut", "statue"], &FuzzyOptions::default());
        assert_eq!(matches[0].term, "status");
        assert_eq!(matches[0].similarity, 1.0);
        for pair in matches.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }
}
