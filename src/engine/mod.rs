//! The search orchestrator: end-to-end pipeline under a hard deadline, with a
//! cooperative concurrency cap, in-flight deduplication, tiered caching, and
//! running metrics.
//!
//! The deadline is carried by `tokio::time::timeout` around the whole inner
//! pipeline; cancellation happens at the suspension points (queue wait, cache
//! get/set), and a timed-out search never stores a partial result.

use crate::cache::{DistributedCache, SearchCache, SearchCacheConfig};
use crate::clock::{Clock, SystemClock};
use crate::config::SearchConfig;
use crate::errors::SearchError;
use crate::fuzzy::{FuzzyMatcher, FuzzyOptions};
use crate::index::{IndexStats, InvertedIndex};
use crate::models::{
    DocId, Document, Facets, ResponseMetrics, SearchOptions, SearchResponse, SearchResultItem,
    SortOrder,
};
use crate::query::{ParsedQuery, QueryParser, QueryTerm, TermOperator};
use crate::ranking::{RankingContext, RankingEngine, RankingOptions};
use crate::text::{ProcessOptions, TextProcessor};
use ahash::AHashMap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

/// Upper bound a caller may request as a per-search deadline.
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Popular stemmed tokens cached at initialization.
const WARMUP_TERM_COUNT: usize = 100;

/// Fuzzy expansions admitted per fuzzy query term.
const FUZZY_EXPANSIONS_PER_TERM: usize = 3;

/// Ranked correction candidates returned per mistyped token.
const CORRECTIONS_PER_TOKEN: usize = 5;

/// Vocabulary words admitted per wildcard term.
const WILDCARD_EXPANSIONS_PER_TERM: usize = 20;

const STATE_CREATED: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_SHUT_DOWN: u8 = 2;

type SharedResult = Result<SearchResponse, SearchError>;

/// Running counters exposed through [`SearchEngine::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub total_searches: u64,
    pub average_response_ms: f64,
    pub cache_hit_rate: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub last_index_update_ms: i64,
}

/// Engine metrics plus index and cache state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub metrics: EngineMetrics,
    pub index: IndexStats,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_searches: u64,
    total_time_ms: u64,
    errors: u64,
}

/// The orchestrated search engine. Construct, `initialize`, then serve.
pub struct SearchEngine {
    config: SearchConfig,
    clock: Arc<dyn Clock>,
    processor: TextProcessor,
    parser: QueryParser,
    matcher: FuzzyMatcher,
    index: InvertedIndex,
    ranking: RankingEngine,
    cache: SearchCache,
    documents: RwLock<AHashMap<DocId, Document>>,
    /// Normalized (unstemmed) tokens with live reference counts; feeds
    /// corrections and wildcard/fuzzy expansion.
    lexicon: Mutex<AHashMap<String, i64>>,
    state: AtomicU8,
    semaphore: Arc<Semaphore>,
    inflight: DashMap<String, broadcast::Sender<SharedResult>>,
    metrics: Mutex<MetricsInner>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock), None)
    }

    /// Full constructor with an injected clock and optional distributed
    /// cache layer.
    pub fn with_clock(
        config: SearchConfig,
        clock: Arc<dyn Clock>,
        l3: Option<Box<dyn DistributedCache>>,
    ) -> Self {
        let cache_config = SearchCacheConfig {
            enabled: config.cache_enabled,
            ..SearchCacheConfig::default()
        };
        let ranking_options = RankingOptions {
            algorithm: config.ranking_algorithm,
            ..RankingOptions::default()
        };
        let max_concurrent = config.performance.max_concurrent_searches.max(1);
        Self {
            parser: QueryParser::new(config.fuzzy_enabled),
            processor: TextProcessor::new(),
            matcher: FuzzyMatcher::new(),
            index: InvertedIndex::new(clock.clone(), config.performance.indexing_batch_size),
            ranking: RankingEngine::new(ranking_options),
            cache: SearchCache::new(cache_config, clock.clone(), l3),
            documents: RwLock::new(AHashMap::new()),
            lexicon: Mutex::new(AHashMap::new()),
            state: AtomicU8::new(STATE_CREATED),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inflight: DashMap::new(),
            metrics: Mutex::new(MetricsInner::default()),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Build the index from the document source and warm the cache.
    pub async fn initialize(&self, docs: Vec<Document>) -> Result<(), SearchError> {
        if self.state.load(Ordering::SeqCst) == STATE_SHUT_DOWN {
            return Err(SearchError::ShutDown);
        }
        let mut ids = std::collections::HashSet::new();
        for doc in &docs {
            if !ids.insert(doc.id.as_str()) {
                return Err(SearchError::Init(format!(
                    "duplicate document id '{}'",
                    doc.id
                )));
            }
        }

        self.index.build(&docs);
        {
            let mut lexicon = lock_mutex(&self.lexicon);
            lexicon.clear();
            for doc in &docs {
                self.update_lexicon_locked(&mut lexicon, doc, 1);
            }
        }
        {
            let mut documents = write_lock(&self.documents);
            documents.clear();
            for doc in docs {
                documents.insert(doc.id.clone(), doc);
            }
        }

        self.warm_popular_terms().await;
        self.state.store(STATE_READY, Ordering::SeqCst);
        info!(documents = self.index.len(), "search engine initialized");
        Ok(())
    }

    /// Execute one search under the configured deadline.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        self.ensure_ready()?;
        let budget_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        if budget_ms == 0 || budget_ms > MAX_TIMEOUT_MS {
            return Err(SearchError::InvalidQuery(format!(
                "timeout {budget_ms} ms outside (0, {MAX_TIMEOUT_MS}]"
            )));
        }

        let started = Instant::now();
        let parsed = self.parser.parse(query);
        let key = self.cache_key(&parsed, query, options);

        let outcome = tokio::time::timeout(
            Duration::from_millis(budget_ms),
            self.search_deduplicated(&key, &parsed, options, started, budget_ms),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout { budget_ms }),
        };
        self.record_search(&result, started);
        result
    }

    /// Prefix completions over the index vocabulary, most frequent first.
    pub fn suggest(&self, prefix: &str, limit: usize) -> Vec<String> {
        let trimmed = prefix.trim().to_lowercase();
        if trimmed.chars().count() < 2 {
            return Vec::new();
        }
        self.index
            .prefix(&trimmed, limit)
            .into_iter()
            .map(|(term, _)| term)
            .collect()
    }

    /// Spelling corrections for each query word missing from the corpus,
    /// best match first, up to [`CORRECTIONS_PER_TOKEN`] per token.
    pub fn correct(&self, query: &str) -> Vec<String> {
        let lexicon = lock_mutex(&self.lexicon);
        let words: Vec<String> = lexicon
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(word, _)| word.clone())
            .collect();
        drop(lexicon);

        let mut corrections = Vec::new();
        for raw in crate::text::split_text(query) {
            let word = raw.to_lowercase();
            if words.contains(&word) {
                continue;
            }
            for candidate in self.matcher.suggest(
                &word,
                words.iter().map(|w| w.as_str()),
                CORRECTIONS_PER_TOKEN,
            ) {
                if !corrections.contains(&candidate) {
                    corrections.push(candidate);
                }
            }
        }
        corrections
    }

    /// Add or replace a document; invalidates affected cache keys.
    pub async fn add(&self, doc: Document) -> Result<(), SearchError> {
        self.ensure_ready()?;
        self.index.add(&doc);
        {
            let mut documents = write_lock(&self.documents);
            if let Some(previous) = documents.remove(&doc.id) {
                let mut lexicon = lock_mutex(&self.lexicon);
                self.update_lexicon_locked(&mut lexicon, &previous, -1);
            }
            let mut lexicon = lock_mutex(&self.lexicon);
            self.update_lexicon_locked(&mut lexicon, &doc, 1);
            documents.insert(doc.id.clone(), doc.clone());
        }
        self.cache
            .invalidate_document(&doc.id, doc.category.as_str(), &doc.tags)
            .await;
        Ok(())
    }

    /// Remove a document; returns false when the id was unknown.
    pub async fn remove(&self, doc_id: &str) -> Result<bool, SearchError> {
        self.ensure_ready()?;
        let removed_doc = {
            let mut documents = write_lock(&self.documents);
            documents.remove(doc_id)
        };
        let Some(doc) = removed_doc else {
            return Ok(false);
        };
        self.index.remove(doc_id);
        {
            let mut lexicon = lock_mutex(&self.lexicon);
            self.update_lexicon_locked(&mut lexicon, &doc, -1);
        }
        self.cache
            .invalidate_document(doc_id, doc.category.as_str(), &doc.tags)
            .await;
        Ok(true)
    }

    /// Maintenance pass: drop expired cache entries, shrink index maps, and
    /// re-warm popular terms. Not a rebuild.
    pub async fn optimize(&self) {
        let purged = self.cache.purge_expired();
        self.index.compact();
        self.warm_popular_terms().await;
        let stats = self.index.stats();
        if stats.estimated_bytes > self.config.performance.memory_threshold_bytes {
            warn!(
                estimated_bytes = stats.estimated_bytes,
                threshold = self.config.performance.memory_threshold_bytes,
                "index size exceeds the configured memory threshold"
            );
        }
        debug!(purged, "optimize pass complete");
    }

    /// Transition to the rejecting state: queued searches fail, the cache
    /// flushes its persistence hooks.
    pub async fn shutdown(&self) {
        self.state.store(STATE_SHUT_DOWN, Ordering::SeqCst);
        self.semaphore.close();
        self.inflight.clear();
        self.cache.close().await;
        info!("search engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        let metrics = lock_mutex(&self.metrics);
        let cache_stats = self.cache.get_stats();
        let index = self.index.stats();
        let total = metrics.total_searches;
        EngineStats {
            metrics: EngineMetrics {
                total_searches: total,
                average_response_ms: if total == 0 {
                    0.0
                } else {
                    metrics.total_time_ms as f64 / total as f64
                },
                cache_hit_rate: cache_stats.hit_rate(),
                error_count: metrics.errors,
                error_rate: if total == 0 {
                    0.0
                } else {
                    metrics.errors as f64 / total as f64
                },
                last_index_update_ms: index.last_updated_ms,
            },
            cache_hit_rate: cache_stats.hit_rate(),
            cache_entries: cache_stats.l1.entries + cache_stats.l2.entries,
            index,
        }
    }

    // ------------------------------------------------------------------
    // pipeline internals
    // ------------------------------------------------------------------

    fn ensure_ready(&self) -> Result<(), SearchError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_READY => Ok(()),
            STATE_SHUT_DOWN => Err(SearchError::ShutDown),
            _ => Err(SearchError::NotInitialized),
        }
    }

    /// Collapse concurrent identical queries: the first caller computes, the
    /// rest subscribe to its result. A cancelled leader wakes the followers,
    /// which retry (and one becomes the new leader).
    async fn search_deduplicated(
        &self,
        key: &str,
        parsed: &ParsedQuery,
        options: &SearchOptions,
        started: Instant,
        budget_ms: u64,
    ) -> SharedResult {
        loop {
            let mut follower_rx = None;
            let leader_tx = {
                match self.inflight.entry(key.to_string()) {
                    dashmap::mapref::entry::Entry::Occupied(entry) => {
                        follower_rx = Some(entry.get().subscribe());
                        None
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        let (tx, _) = broadcast::channel(1);
                        vacant.insert(tx.clone());
                        Some(tx)
                    }
                }
            };

            if let Some(mut rx) = follower_rx {
                match rx.recv().await {
                    Ok(result) => return result,
                    // leader was cancelled; loop and take the lead
                    Err(_) => continue,
                }
            }

            let tx = leader_tx.expect("leader path has a sender");
            let guard = InflightGuard {
                map: &self.inflight,
                key: key.to_string(),
            };
            let result = self
                .execute_pipeline(key, parsed, options, started, budget_ms)
                .await;
            let _ = tx.send(result.clone());
            drop(guard);
            return result;
        }
    }

    async fn execute_pipeline(
        &self,
        key: &str,
        parsed: &ParsedQuery,
        options: &SearchOptions,
        started: Instant,
        budget_ms: u64,
    ) -> SharedResult {
        // concurrency cap; waiting in the queue counts against the deadline
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SearchError::ShutDown)?;
        self.ensure_ready()?;
        check_deadline(started, budget_ms)?;

        if self.config.cache_enabled {
            if let Some(value) = self.cache.get(key).await {
                match serde_json::from_value::<SearchResponse>(value) {
                    Ok(mut response) => {
                        response.metrics.cache_hit = true;
                        response.metrics.query_time_ms = started.elapsed().as_millis() as u64;
                        return Ok(response);
                    }
                    // cache faults are recovered locally, never surfaced
                    Err(err) => warn!(key, %err, "undecodable cached response; recomputing"),
                }
            }
        }

        let mut warnings = parsed.warnings.clone();
        if !parsed.errors.is_empty() {
            warnings.extend(parsed.errors.iter().cloned());
            let mut response = self.empty_response(parsed, options, started);
            response.warnings = warnings;
            return Ok(response);
        }

        check_deadline(started, budget_ms)?;
        let expanded = self.expand_terms(parsed);
        let terms = self.parser.extract_search_terms(&expanded);
        if terms.is_empty() {
            let mut response = self.empty_response(parsed, options, started);
            response.warnings = warnings;
            return Ok(response);
        }

        let postings = self.index.search(&terms.lookup_terms());
        let has_scorable = terms
            .required
            .iter()
            .chain(terms.optional.iter())
            .chain(terms.phrases.iter().flatten())
            .any(|t| postings.contains_key(t));
        if !has_scorable {
            let mut response = self.empty_response(parsed, options, started);
            response.warnings = warnings;
            return Ok(response);
        }

        check_deadline(started, budget_ms)?;
        // ranking reads the live collection under the read lock; no awaits
        // happen inside this block
        let (items, facets, total_candidates) = {
            let documents = read_lock(&self.documents);
            let doc_lengths = self.index.document_lengths();
            let ctx = RankingContext {
                parsed: &expanded,
                terms: &terms,
                postings: &postings,
                collection: &documents,
                doc_lengths: &doc_lengths,
                total_documents: self.index.len(),
                average_document_length: self.index.average_document_length(),
                now_ms: self.clock.now_ms(),
            };
            let mut scores = self.ranking.rank(&ctx);
            self.apply_filters(&mut scores, &expanded, options, &documents);
            match options.sort {
                SortOrder::Relevance => {}
                SortOrder::Recent => scores.sort_by(|a, b| {
                    let ta = documents.get(&a.doc_id).map(|d| d.updated_at);
                    let tb = documents.get(&b.doc_id).map(|d| d.updated_at);
                    tb.cmp(&ta).then_with(|| a.doc_id.cmp(&b.doc_id))
                }),
                SortOrder::Popular => scores.sort_by(|a, b| {
                    let ua = documents.get(&a.doc_id).map(|d| d.usage_count).unwrap_or(0);
                    let ub = documents.get(&b.doc_id).map(|d| d.usage_count).unwrap_or(0);
                    ub.cmp(&ua).then_with(|| a.doc_id.cmp(&b.doc_id))
                }),
            }
            let facets = if options.include_facets {
                build_facets(&scores, &documents)
            } else {
                None
            };
            let matched = matched_terms(&scores, &postings);
            let total = scores.len();
            let limit = options.limit.min(self.config.max_results);
            let end = (options.offset + limit).min(scores.len());
            let items: Vec<SearchResultItem> = if options.offset >= scores.len() {
                Vec::new()
            } else {
                scores[options.offset..end]
                    .iter()
                    .enumerate()
                    .filter_map(|(i, score)| {
                        let document = documents.get(&score.doc_id)?.clone();
                        Some(SearchResultItem {
                            document,
                            score: score.score,
                            rank: options.offset + i + 1,
                            matched_terms: matched.get(&score.doc_id).cloned().unwrap_or_default(),
                            explanation: options
                                .include_explanations
                                .then(|| score.components.clone()),
                        })
                    })
                    .collect()
            };
            (items, facets, total)
        };

        let mut response = SearchResponse {
            results: items,
            total: total_candidates,
            facets,
            suggestions: self.pipeline_suggestions(parsed),
            corrections: self.pipeline_corrections(parsed),
            metrics: ResponseMetrics {
                query_time_ms: started.elapsed().as_millis() as u64,
                cache_hit: false,
                total_candidates,
            },
            warnings,
        };

        // a search that blew its budget must not populate the cache
        check_deadline(started, budget_ms)?;
        if self.config.cache_enabled && !response.results.is_empty() {
            let ttl_ms = response_ttl_ms(parsed);
            match serde_json::to_value(&response) {
                Ok(value) => self.cache.set(key, value, Some(ttl_ms)).await,
                Err(err) => warn!(%err, "response not cacheable"),
            }
        }
        response.metrics.query_time_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// Expand fuzzy and wildcard terms against the corpus lexicon, folding
    /// matches back in as optional terms carrying similarity-scaled boosts.
    /// With query expansion enabled, domain synonyms join in at half boost.
    fn expand_terms(&self, parsed: &ParsedQuery) -> ParsedQuery {
        let needs_expansion = parsed.terms.iter().any(|t| {
            (t.fuzzy && self.config.fuzzy_enabled)
                || t.wildcard
                || self.config.features.query_expansion
        });
        if !needs_expansion {
            return parsed.clone();
        }

        let lexicon = lock_mutex(&self.lexicon);
        let words: Vec<String> = lexicon
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(word, _)| word.clone())
            .collect();
        drop(lexicon);

        let mut expanded = parsed.clone();
        for term in &parsed.terms {
            if term.prohibited {
                continue;
            }
            if term.fuzzy && self.config.fuzzy_enabled {
                let fuzzy_options =
                    FuzzyOptions::with_max_distance(term.proximity.unwrap_or(2) as usize);
                let matches = self.matcher.find_matches(
                    &term.text,
                    words.iter().map(|w| w.as_str()),
                    &fuzzy_options,
                );
                for matched in matches.into_iter().take(FUZZY_EXPANSIONS_PER_TERM) {
                    push_expansion(
                        &mut expanded.terms,
                        &matched.term,
                        term.boost * matched.similarity,
                    );
                }
            }
            if term.wildcard {
                if let Ok(pattern) = glob::Pattern::new(&term.text.to_lowercase()) {
                    let mut hits: Vec<&String> =
                        words.iter().filter(|w| pattern.matches(w)).collect();
                    hits.sort();
                    for word in hits.into_iter().take(WILDCARD_EXPANSIONS_PER_TERM) {
                        push_expansion(&mut expanded.terms, word, term.boost);
                    }
                }
            }
            if self.config.features.query_expansion {
                if let Some(variants) = crate::domain::variants_of(&term.text) {
                    for variant in variants {
                        if words.iter().any(|w| w == variant) {
                            push_expansion(&mut expanded.terms, variant, term.boost * 0.5);
                        }
                    }
                }
            }
        }
        expanded
    }

    fn apply_filters(
        &self,
        scores: &mut Vec<crate::models::RankingScore>,
        parsed: &ParsedQuery,
        options: &SearchOptions,
        documents: &AHashMap<DocId, Document>,
    ) {
        let category_filters: Vec<String> = parsed
            .filters
            .iter()
            .filter(|f| f.field == crate::models::Field::Category)
            .map(|f| f.value.clone())
            .chain(options.category.map(|c| c.as_str().to_string()))
            .collect();
        let tag_filters: Vec<String> = parsed
            .filters
            .iter()
            .filter(|f| f.field == crate::models::Field::Tags)
            .map(|f| f.value.clone())
            .chain(options.tags.iter().map(|t| t.to_lowercase()))
            .collect();

        if category_filters.is_empty() && tag_filters.is_empty() {
            return;
        }
        scores.retain(|score| {
            let Some(doc) = documents.get(&score.doc_id) else {
                return false;
            };
            if !category_filters.is_empty()
                && !category_filters.contains(&doc.category.as_str().to_string())
            {
                return false;
            }
            if !tag_filters.is_empty() {
                let tags_lower: Vec<String> = doc.tags.iter().map(|t| t.to_lowercase()).collect();
                if !tag_filters.iter().all(|t| tags_lower.contains(t)) {
                    return false;
                }
            }
            true
        });
    }

    fn pipeline_suggestions(&self, parsed: &ParsedQuery) -> Vec<String> {
        if !self.config.features.auto_complete {
            return Vec::new();
        }
        let seed = parsed.original.trim();
        if seed.chars().count() < 2 {
            return Vec::new();
        }
        let first_word = crate::text::split_text(seed)
            .into_iter()
            .next()
            .unwrap_or_default();
        if first_word.chars().count() < 2 {
            return Vec::new();
        }
        self.suggest(&first_word, 5)
    }

    fn pipeline_corrections(&self, parsed: &ParsedQuery) -> Vec<String> {
        if !self.config.features.spell_correction {
            return Vec::new();
        }
        self.correct(&parsed.original)
    }

    fn empty_response(
        &self,
        parsed: &ParsedQuery,
        _options: &SearchOptions,
        started: Instant,
    ) -> SearchResponse {
        SearchResponse {
            results: Vec::new(),
            total: 0,
            facets: None,
            suggestions: self.pipeline_suggestions(parsed),
            corrections: self.pipeline_corrections(parsed),
            metrics: ResponseMetrics {
                query_time_ms: started.elapsed().as_millis() as u64,
                cache_hit: false,
                total_candidates: 0,
            },
            warnings: Vec::new(),
        }
    }

    fn cache_key(&self, parsed: &ParsedQuery, original: &str, options: &SearchOptions) -> String {
        let source = if parsed.normalized.is_empty() {
            original
        } else {
            parsed.normalized.as_str()
        };
        let fingerprint = format!(
            "limit={}|offset={}|fields={:?}|category={:?}|tags={:?}|sort={:?}|facets={}|explain={}|algo={:?}",
            options.limit,
            options.offset,
            options.fields,
            options.category,
            options.tags,
            options.sort,
            options.include_facets,
            options.include_explanations,
            self.config.ranking_algorithm,
        );
        SearchCache::query_key(source, &fingerprint)
    }

    async fn warm_popular_terms(&self) {
        let top = self.index.top_terms(WARMUP_TERM_COUNT);
        if top.is_empty() {
            return;
        }
        let terms: Vec<String> = top.into_iter().map(|(term, _)| term).collect();
        match serde_json::to_value(&terms) {
            Ok(value) => {
                self.cache
                    .warm(vec![(SearchCache::index_key("popular_terms"), value, None)])
                    .await;
            }
            Err(err) => warn!(%err, "failed to serialize popular terms"),
        }
    }

    fn update_lexicon_locked(
        &self,
        lexicon: &mut AHashMap<String, i64>,
        doc: &Document,
        delta: i64,
    ) {
        let options = ProcessOptions::default();
        for field in crate::models::Field::ALL {
            for token in self.processor.process(&doc.field_text(field), field, &options) {
                let count = lexicon.entry(token.normalized).or_insert(0);
                *count += delta;
            }
        }
        if delta < 0 {
            lexicon.retain(|_, count| *count > 0);
        }
    }

    fn record_search(&self, result: &SharedResult, started: Instant) {
        let mut metrics = lock_mutex(&self.metrics);
        metrics.total_searches += 1;
        metrics.total_time_ms += started.elapsed().as_millis() as u64;
        if result.is_err() {
            metrics.errors += 1;
        }
    }
}

/// Removes the in-flight entry when the leader finishes or is cancelled, so
/// followers never wait on a dead computation.
struct InflightGuard<'a> {
    map: &'a DashMap<String, broadcast::Sender<SharedResult>>,
    key: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

fn push_expansion(terms: &mut Vec<QueryTerm>, word: &str, boost: f64) {
    if terms.iter().any(|t| t.text == word) {
        return;
    }
    terms.push(QueryTerm {
        text: word.to_string(),
        field: None,
        operator: TermOperator::Or,
        boost,
        fuzzy: false,
        proximity: None,
        required: false,
        prohibited: false,
        wildcard: false,
    });
}

/// TTL picked from query shape: short single-word queries stay hot briefly,
/// long analytical queries are worth keeping for an hour.
fn response_ttl_ms(parsed: &ParsedQuery) -> u64 {
    let token_count = crate::text::split_text(&parsed.original).len();
    if token_count <= 1 {
        60_000
    } else if token_count > 5 {
        3_600_000
    } else {
        600_000
    }
}

fn build_facets(
    scores: &[crate::models::RankingScore],
    documents: &AHashMap<DocId, Document>,
) -> Option<Facets> {
    let mut categories: BTreeMap<String, usize> = BTreeMap::new();
    let mut tags: BTreeMap<String, usize> = BTreeMap::new();
    for score in scores {
        if let Some(doc) = documents.get(&score.doc_id) {
            *categories.entry(doc.category.as_str().to_string()).or_insert(0) += 1;
            for tag in &doc.tags {
                *tags.entry(tag.to_lowercase()).or_insert(0) += 1;
            }
        }
    }
    // a facet with a single distinct value carries no information
    if categories.len() <= 1 {
        categories.clear();
    }
    if tags.len() <= 1 {
        tags.clear();
    }
    if categories.is_empty() && tags.is_empty() {
        None
    } else {
        Some(Facets { categories, tags })
    }
}

fn matched_terms(
    scores: &[crate::models::RankingScore],
    postings: &AHashMap<String, crate::index::PostingList>,
) -> AHashMap<DocId, Vec<String>> {
    let mut out: AHashMap<DocId, Vec<String>> = AHashMap::new();
    let mut terms: Vec<&String> = postings.keys().collect();
    terms.sort_unstable();
    for score in scores {
        let matched: Vec<String> = terms
            .iter()
            .filter(|term| {
                postings
                    .get(**term)
                    .map(|list| list.docs.contains_key(&score.doc_id))
                    .unwrap_or(false)
            })
            .map(|term| (*term).clone())
            .collect();
        out.insert(score.doc_id.clone(), matched);
    }
    out
}

/// Stage-boundary deadline check; `tokio::time::timeout` only fires at
/// suspension points, so synchronous stages verify the budget themselves.
fn check_deadline(started: Instant, budget_ms: u64) -> Result<(), SearchError> {
    if started.elapsed().as_millis() as u64 >= budget_ms {
        Err(SearchError::Timeout { budget_ms })
    } else {
        Ok(())
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParser;

    #[test]
    fn response_ttl_follows_query_shape() {
        let parser = QueryParser::new(true);
        assert_eq!(response_ttl_ms(&parser.parse("s0c7")), 60_000);
        assert_eq!(response_ttl_ms(&parser.parse("vsam status")), 600_000);
        assert_eq!(
            response_ttl_ms(&parser.parse("vsam status open fails on missing dataset")),
            3_600_000
        );
    }

    #[test]
    fn cache_keys_differ_by_options() {
        let engine = SearchEngine::new(SearchConfig::default());
        let parser = QueryParser::new(true);
        let parsed = parser.parse("vsam status");
        let base = SearchOptions::default();
        let paged = SearchOptions {
            offset: 10,
            ..SearchOptions::default()
        };
        let a = engine.cache_key(&parsed, "vsam status", &base);
        let b = engine.cache_key(&parsed, "vsam status", &base);
        let c = engine.cache_key(&parsed, "vsam status", &paged);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn equivalent_queries_share_a_cache_key() {
        let engine = SearchEngine::new(SearchConfig::default());
        let parser = QueryParser::new(true);
        let options = SearchOptions::default();
        let a = parser.parse("vsam && status");
        let b = parser.parse("vsam   AND status");
        assert_eq!(
            engine.cache_key(&a, "vsam && status", &options),
            engine.cache_key(&b, "vsam   AND status", &options)
        );
    }

    #[test]
    fn expansions_do_not_duplicate_terms() {
        let mut terms = vec![QueryTerm {
            text: "abend".to_string(),
            field: None,
            operator: TermOperator::Or,
            boost: 1.0,
            fuzzy: false,
            proximity: None,
            required: false,
            prohibited: false,
            wildcard: false,
        }];
        push_expansion(&mut terms, "abend", 0.9);
        assert_eq!(terms.len(), 1);
        push_expansion(&mut terms, "error", 0.9);
        assert_eq!(terms.len(), 2);
    }
}
