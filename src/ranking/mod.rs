//! Relevance scoring: BM25, TF-IDF (three normalizations), a combined scorer,
//! and a domain-aware custom scorer, plus the post-base signals (field-match
//! and exact-phrase bonuses, popularity, freshness).
//!
//! Every score carries an auditable component breakdown. Ranking is a total
//! order: descending score, ties broken by ascending document id, so results
//! are deterministic under a fixed configuration.

use crate::domain;
use crate::index::PostingList;
use crate::models::{DocId, Document, Field, RankingScore, ScoreComponent};
use crate::query::{ParsedQuery, SearchTerms};
use crate::text::TextProcessor;
use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Scoring algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingAlgorithm {
    Tfidf,
    #[default]
    Bm25,
    Combined,
    Custom,
}

impl RankingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankingAlgorithm::Tfidf => "tfidf",
            RankingAlgorithm::Bm25 => "bm25",
            RankingAlgorithm::Combined => "combined",
            RankingAlgorithm::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    /// Query-frequency saturation.
    pub k2: f64,
    pub k3: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            k2: 100.0,
            k3: 8.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TfNormalization {
    None,
    #[default]
    Cosine,
    Pivoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TfidfParams {
    pub use_log_tf: bool,
    pub use_log_idf: bool,
    pub normalization: TfNormalization,
    /// Pivoted-normalization slope.
    pub slope: f64,
}

impl Default for TfidfParams {
    fn default() -> Self {
        Self {
            use_log_tf: true,
            use_log_idf: true,
            normalization: TfNormalization::Cosine,
            slope: 0.25,
        }
    }
}

/// Weights for the combined algorithm and the bonus signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinationWeights {
    pub tfidf: f64,
    pub bm25: f64,
    pub exact_match: f64,
    pub field_match: f64,
    pub popularity: f64,
    pub freshness: f64,
}

impl Default for CombinationWeights {
    fn default() -> Self {
        Self {
            tfidf: 0.4,
            bm25: 0.6,
            exact_match: 1.0,
            field_match: 1.0,
            popularity: 1.0,
            freshness: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopularityParams {
    pub usage_weight: f64,
    pub success_weight: f64,
}

impl Default for PopularityParams {
    fn default() -> Self {
        Self {
            usage_weight: 0.3,
            success_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreshnessParams {
    pub half_life_days: f64,
    pub max_boost: f64,
}

impl Default for FreshnessParams {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            max_boost: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RankingOptions {
    pub algorithm: RankingAlgorithm,
    pub bm25: Bm25Params,
    pub tfidf: TfidfParams,
    pub combination: CombinationWeights,
    pub popularity: PopularityParams,
    pub freshness: FreshnessParams,
}

/// Everything one ranking pass reads. The collection is the live document
/// map, so popularity and freshness read real fields.
pub struct RankingContext<'a> {
    pub parsed: &'a ParsedQuery,
    pub terms: &'a SearchTerms,
    pub postings: &'a AHashMap<String, PostingList>,
    pub collection: &'a AHashMap<DocId, Document>,
    pub doc_lengths: &'a AHashMap<DocId, u32>,
    pub total_documents: usize,
    pub average_document_length: f64,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    options: RankingOptions,
    processor: TextProcessor,
}

impl RankingEngine {
    pub fn new(options: RankingOptions) -> Self {
        Self {
            options,
            processor: TextProcessor::new(),
        }
    }

    pub fn options(&self) -> &RankingOptions {
        &self.options
    }

    /// Score and order all matching documents. Documents present in postings
    /// but missing from the collection are skipped.
    pub fn rank(&self, ctx: &RankingContext) -> Vec<RankingScore> {
        if ctx.terms.is_empty() || ctx.postings.is_empty() || ctx.total_documents == 0 {
            return Vec::new();
        }

        let scorable = self.scorable_terms(ctx);
        let mut candidates = self.candidates(ctx);
        candidates.sort_unstable();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut scores: Vec<RankingScore> = candidates
            .par_iter()
            .filter_map(|doc_id| {
                let document = ctx.collection.get(doc_id)?;
                Some(self.score_document(doc_id, document, &scorable, ctx))
            })
            .collect();

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        scores
    }

    /// Query terms the base scorers iterate over, with their user boosts.
    fn scorable_terms(&self, ctx: &RankingContext) -> Vec<(String, f64)> {
        let mut boosts: AHashMap<String, f64> = AHashMap::new();
        for term in &ctx.parsed.terms {
            if term.prohibited {
                continue;
            }
            for word in self.processor.tokenize_query(&term.text) {
                let entry = boosts.entry(word).or_insert(1.0);
                *entry = entry.max(term.boost);
            }
        }
        let mut out: Vec<(String, f64)> = ctx
            .terms
            .required
            .iter()
            .chain(ctx.terms.optional.iter())
            .chain(ctx.terms.phrases.iter().flatten())
            .map(|term| (term.clone(), *boosts.get(term).unwrap_or(&1.0)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.dedup_by(|a, b| a.0 == b.0);
        out
    }

    /// Documents that satisfy the boolean structure of the query.
    fn candidates(&self, ctx: &RankingContext) -> Vec<DocId> {
        let mut pool: AHashMap<&str, ()> = AHashMap::new();
        for term in ctx
            .terms
            .required
            .iter()
            .chain(ctx.terms.optional.iter())
            .chain(ctx.terms.phrases.iter().flatten())
        {
            if let Some(list) = ctx.postings.get(term) {
                for doc_id in list.docs.keys() {
                    pool.insert(doc_id.as_str(), ());
                }
            }
        }

        let doc_has = |doc_id: &str, term: &str| {
            ctx.postings
                .get(term)
                .map(|list| list.docs.contains_key(doc_id))
                .unwrap_or(false)
        };

        pool.keys()
            .filter(|doc_id| {
                // every required term must be present
                if !ctx.terms.required.iter().all(|t| doc_has(doc_id, t)) {
                    return false;
                }
                // no prohibited term may be present
                if ctx.terms.prohibited.iter().any(|t| doc_has(doc_id, t)) {
                    return false;
                }
                // with neither required nor optional terms, at least one
                // phrase must be fully present
                if ctx.terms.required.is_empty() && ctx.terms.optional.is_empty() {
                    return ctx
                        .terms
                        .phrases
                        .iter()
                        .any(|phrase| phrase.iter().all(|w| doc_has(doc_id, w)));
                }
                true
            })
            .map(|doc_id| doc_id.to_string())
            .collect()
    }

    fn score_document(
        &self,
        doc_id: &str,
        document: &Document,
        scorable: &[(String, f64)],
        ctx: &RankingContext,
    ) -> RankingScore {
        let mut components = Vec::new();
        let algorithm = self.options.algorithm;

        let base = match algorithm {
            RankingAlgorithm::Bm25 => {
                let value = self.bm25(doc_id, scorable, ctx, false);
                components.push(component("bm25", value, 1.0, value, "BM25 term scores"));
                value
            }
            RankingAlgorithm::Tfidf => {
                let value = self.tfidf(doc_id, scorable, ctx);
                components.push(component("tfidf", value, 1.0, value, "TF-IDF term weights"));
                value
            }
            RankingAlgorithm::Combined => {
                let weights = self.options.combination;
                let bm25 = self.bm25(doc_id, scorable, ctx, false);
                let tfidf = self.tfidf(doc_id, scorable, ctx);
                components.push(component("bm25", bm25, weights.bm25, bm25 * weights.bm25, "BM25 term scores"));
                components.push(component(
                    "tfidf",
                    tfidf,
                    weights.tfidf,
                    tfidf * weights.tfidf,
                    "TF-IDF term weights",
                ));
                bm25 * weights.bm25 + tfidf * weights.tfidf
            }
            RankingAlgorithm::Custom => {
                let value = self.bm25(doc_id, scorable, ctx, true);
                components.push(component(
                    "custom",
                    value,
                    1.0,
                    value,
                    "BM25 with domain multipliers (error codes, system names, mainframe terms)",
                ));
                value
            }
        };

        let field_bonus = self.field_match_bonus(doc_id, scorable, ctx);
        let field_weight = self.options.combination.field_match;
        if field_bonus > 0.0 {
            components.push(component(
                "field_match",
                field_bonus,
                field_weight,
                field_bonus * field_weight,
                "query terms found in title/problem/tags",
            ));
        }

        let phrase_matches = self.matched_phrases(doc_id, ctx);
        let exact_weight = self.options.combination.exact_match;
        let exact_bonus = 2.0 * phrase_matches as f64;
        if phrase_matches > 0 {
            components.push(component(
                "exact_match",
                exact_bonus,
                exact_weight,
                exact_bonus * exact_weight,
                "exact phrase occurrences",
            ));
        }

        let popularity = self.popularity(document);
        let popularity_weight = self.options.combination.popularity;
        if popularity > 0.0 && popularity_weight > 0.0 {
            components.push(component(
                "popularity",
                popularity,
                popularity_weight,
                popularity * popularity_weight,
                "usage count and success rate",
            ));
        }

        let subtotal = base
            + field_bonus * field_weight
            + exact_bonus * exact_weight
            + popularity * popularity_weight;

        // the freshness weight scales the multiplier's lift above 1.0
        let freshness_raw = self.freshness(document, ctx.now_ms);
        let freshness_weight = self.options.combination.freshness;
        let freshness = 1.0 + (freshness_raw - 1.0) * freshness_weight;
        let score = subtotal * freshness;
        if (freshness - 1.0).abs() > f64::EPSILON {
            components.push(component(
                "freshness",
                freshness_raw,
                freshness_weight,
                score - subtotal,
                "recency multiplier",
            ));
        }

        RankingScore {
            doc_id: doc_id.to_string(),
            score,
            boosted: field_bonus > 0.0 || phrase_matches > 0 || freshness > 1.0,
            components,
            algorithm: algorithm.as_str().to_string(),
        }
    }

    fn bm25(
        &self,
        doc_id: &str,
        scorable: &[(String, f64)],
        ctx: &RankingContext,
        domain_multipliers: bool,
    ) -> f64 {
        let params = self.options.bm25;
        let n = ctx.total_documents as f64;
        let avgdl = if ctx.average_document_length > 0.0 {
            ctx.average_document_length
        } else {
            1.0
        };
        let dl = *ctx.doc_lengths.get(doc_id).unwrap_or(&0) as f64;
        let qtf_factor = 1.0 / (1.0 + params.k2) * (params.k3 + 1.0);

        let mut total = 0.0;
        for (term, term_boost) in scorable {
            let Some(list) = ctx.postings.get(term) else {
                continue;
            };
            let Some(entry) = list.docs.get(doc_id) else {
                continue;
            };
            let df = list.docs.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5)).ln().max(0.0);
            let tf = entry.term_frequency as f64;
            let tf_norm = tf / (tf + params.k1 * (1.0 - params.b + params.b * dl / avgdl));
            let mut weight = idf * tf_norm * qtf_factor * entry.boost * term_boost;
            if domain_multipliers {
                weight *= domain_multiplier(term);
            }
            total += weight;
        }
        total
    }

    fn tfidf(&self, doc_id: &str, scorable: &[(String, f64)], ctx: &RankingContext) -> f64 {
        let params = self.options.tfidf;
        let n = ctx.total_documents as f64;
        let avgdl = if ctx.average_document_length > 0.0 {
            ctx.average_document_length
        } else {
            1.0
        };
        let dl = *ctx.doc_lengths.get(doc_id).unwrap_or(&0) as f64;

        let mut total = 0.0;
        let mut squared = 0.0;
        for (term, term_boost) in scorable {
            let Some(list) = ctx.postings.get(term) else {
                continue;
            };
            let Some(entry) = list.docs.get(doc_id) else {
                continue;
            };
            let df = list.docs.len() as f64;
            if df <= 0.0 {
                continue;
            }
            let raw_tf = entry.term_frequency as f64;
            let tf = if params.use_log_tf { (1.0 + raw_tf).ln() } else { raw_tf };
            let idf = if params.use_log_idf { (n / df).ln() } else { n / df };
            let weight = tf * idf * entry.boost * term_boost;
            total += weight;
            squared += weight * weight;
        }

        match params.normalization {
            TfNormalization::None => total,
            TfNormalization::Cosine => {
                if squared > 0.0 {
                    total / squared.sqrt()
                } else {
                    0.0
                }
            }
            TfNormalization::Pivoted => {
                let denom = (1.0 - params.slope) + params.slope * dl / avgdl;
                if denom > 0.0 {
                    total / denom
                } else {
                    total
                }
            }
        }
    }

    /// +2.0 per query term found in the title, +1.5 in the problem, +1.2 in
    /// tags.
    fn field_match_bonus(&self, doc_id: &str, scorable: &[(String, f64)], ctx: &RankingContext) -> f64 {
        let mut bonus = 0.0;
        for (term, _) in scorable {
            let Some(entry) = ctx.postings.get(term).and_then(|l| l.docs.get(doc_id)) else {
                continue;
            };
            if entry.fields.contains(&Field::Title) {
                bonus += 2.0;
            }
            if entry.fields.contains(&Field::Problem) {
                bonus += 1.5;
            }
            if entry.fields.contains(&Field::Tags) {
                bonus += 1.2;
            }
        }
        bonus
    }

    /// Phrases verified by positional adjacency. When an entry's position
    /// list was truncated at the cap, adjacency cannot be trusted and
    /// presence of all words counts instead.
    fn matched_phrases(&self, doc_id: &str, ctx: &RankingContext) -> usize {
        ctx.terms
            .phrases
            .iter()
            .filter(|phrase| phrase_matches(doc_id, phrase, ctx.postings))
            .count()
    }

    fn popularity(&self, document: &Document) -> f64 {
        let params = self.options.popularity;
        let usage = (1.0 + document.usage_count as f64).ln() / 101f64.ln();
        usage * params.usage_weight + document.success_rate() * params.success_weight
    }

    fn freshness(&self, document: &Document, now_ms: i64) -> f64 {
        let params = self.options.freshness;
        let age_ms = (now_ms - document.updated_at.timestamp_millis()).max(0) as f64;
        let age_days = age_ms / 86_400_000.0;
        let boost = 1.0 + 0.5f64.powf(age_days / params.half_life_days);
        boost.min(params.max_boost)
    }
}

fn component(factor: &str, value: f64, weight: f64, contribution: f64, explanation: &str) -> ScoreComponent {
    ScoreComponent {
        factor: factor.to_string(),
        value,
        weight,
        contribution,
        explanation: explanation.to_string(),
    }
}

fn domain_multiplier(term: &str) -> f64 {
    if domain::is_error_code(term) {
        3.0
    } else if domain::is_system_name(term) {
        2.0
    } else if domain::is_mainframe_term(term) {
        1.5
    } else {
        1.0
    }
}

/// True when every word of the phrase occurs in the document, with verified
/// adjacency when full position data is available.
pub fn phrase_matches(
    doc_id: &str,
    phrase: &[String],
    postings: &AHashMap<String, PostingList>,
) -> bool {
    use crate::index::MAX_POSITIONS_PER_ENTRY;

    let mut entries = Vec::with_capacity(phrase.len());
    for word in phrase {
        match postings.get(word).and_then(|list| list.docs.get(doc_id)) {
            Some(entry) => entries.push(entry),
            None => return false,
        }
    }
    if entries.len() < 2 {
        return true;
    }
    // truncated position lists cannot prove adjacency; fall back to presence
    if entries
        .iter()
        .any(|e| e.positions.len() >= MAX_POSITIONS_PER_ENTRY)
    {
        return true;
    }
    entries[0].positions.iter().any(|&start| {
        entries[1..]
            .iter()
            .enumerate()
            .all(|(offset, entry)| entry.positions.contains(&(start + offset as u32 + 1)))
    })
}
