//! End-to-end engine scenarios: default config, BM25 ranking, fuzzy and
//! caching enabled unless a test says otherwise.

use chrono::{DateTime, Utc};
use kbsearch::cache::{BoxFuture, DistributedCache};
use kbsearch::clock::ManualClock;
use kbsearch::config::SearchConfig;
use kbsearch::engine::SearchEngine;
use kbsearch::models::{Category, Document, SearchOptions};
use kbsearch::query::{QueryParser, QueryType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn doc(id: &str, title: &str, problem: &str, solution: &str, category: Category) -> Document {
    Document {
        id: id.to_string(),
        title: title.to_string(),
        problem: problem.to_string(),
        solution: solution.to_string(),
        category,
        tags: vec!["abend".to_string()],
        created_at: ts(0),
        updated_at: ts(0),
        usage_count: 0,
        success_count: 0,
        failure_count: 0,
    }
}

fn error_code_corpus() -> Vec<Document> {
    vec![
        doc(
            "KB-1",
            "S0C7 Data Exception in payroll",
            "nightly job abends with S0C7 on packed decimal move",
            "inspect COMP-3 fields and initialize working storage",
            Category::Batch,
        ),
        doc(
            "KB-2",
            "VSAM Status 35 on open",
            "file open fails with vsam status 35, dataset not found",
            "verify the dataset exists and is cataloged",
            Category::Vsam,
        ),
        doc(
            "KB-3",
            "DB2 SQL0803N duplicate key",
            "insert fails with SQL0803N on the unique index",
            "check the key columns before inserting",
            Category::Db2,
        ),
    ]
}

async fn engine_with(docs: Vec<Document>) -> SearchEngine {
    init_tracing();
    let engine = SearchEngine::new(SearchConfig::default());
    engine.initialize(docs).await.unwrap();
    engine
}

// --- S1: exact mainframe error code -----------------------------------------

#[tokio::test]
async fn s1_exact_error_code_ranks_matching_doc_first() {
    let engine = engine_with(error_code_corpus()).await;
    let response = engine
        .search("S0C7", &SearchOptions::default())
        .await
        .unwrap();

    assert!(response.total >= 1);
    assert_eq!(response.results[0].document.id, "KB-1");
    assert!(response.results[0].matched_terms.contains(&"s0c7".to_string()));

    let parsed = QueryParser::new(true).parse("S0C7");
    assert_eq!(parsed.query_type, QueryType::Simple);
}

// --- S2: boolean with exclusion ---------------------------------------------

#[tokio::test]
async fn s2_boolean_with_exclusion() {
    let mut corpus = error_code_corpus();
    corpus.push(doc(
        "KB-4",
        "VSAM Status 37 space",
        "vsam status 37 raised when extending the file",
        "reallocate with more space",
        Category::Vsam,
    ));
    let engine = engine_with(corpus).await;

    let response = engine
        .search("VSAM AND status NOT 37", &SearchOptions::default())
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .results
        .iter()
        .map(|r| r.document.id.as_str())
        .collect();
    assert!(ids.contains(&"KB-2"));
    assert!(!ids.contains(&"KB-4"), "doc with excluded term returned");
    assert!(!ids.contains(&"KB-1"), "doc missing required term returned");

    let parsed = QueryParser::new(true).parse("VSAM AND status NOT 37");
    let vsam = parsed.terms.iter().find(|t| t.text == "VSAM").unwrap();
    let excluded = parsed.terms.iter().find(|t| t.text == "37").unwrap();
    assert!(vsam.required);
    assert!(excluded.prohibited);
}

// --- S3: phrase --------------------------------------------------------------

#[tokio::test]
async fn s3_exact_phrase_beats_scattered_words() {
    let corpus = vec![
        doc(
            "KB-1",
            "Catalog lookup failure",
            "the job stops because the file not found condition is raised",
            "check the catalog entry",
            Category::Batch,
        ),
        doc(
            "KB-2",
            "Scattered words case",
            "the file was eventually found. the member was not in the library",
            "check the library concatenation",
            Category::Batch,
        ),
    ];
    let engine = engine_with(corpus).await;

    let options = SearchOptions {
        include_explanations: true,
        ..SearchOptions::default()
    };
    let response = engine.search("\"file not found\"", &options).await.unwrap();

    assert_eq!(response.results[0].document.id, "KB-1");
    let explanation = response.results[0].explanation.as_ref().unwrap();
    assert!(
        explanation.iter().any(|c| c.factor == "exact_match"),
        "phrase bonus missing from the top result's explanation"
    );
    if response.results.len() > 1 {
        assert!(response.results[0].score > response.results[1].score);
    }
}

// --- S4: fuzzy misspelling ----------------------------------------------------

#[tokio::test]
async fn s4_fuzzy_misspelling_corrects_and_matches() {
    let corpus = vec![doc(
        "KB-1",
        "Database connection drops",
        "the database connection to db2 drops under load",
        "increase the idle timeout",
        Category::Db2,
    )];
    let engine = engine_with(corpus).await;

    assert_eq!(engine.correct("databse"), vec!["database".to_string()]);

    let parsed = QueryParser::new(true).parse("databse~2");
    assert!(parsed.terms[0].fuzzy);
    assert_eq!(parsed.terms[0].proximity, Some(2));

    let response = engine
        .search("databse~2", &SearchOptions::default())
        .await
        .unwrap();
    assert!(!response.results.is_empty(), "fuzzy expansion found nothing");
    assert_eq!(response.results[0].document.id, "KB-1");
}

// --- S5: cache hit ------------------------------------------------------------

#[tokio::test]
async fn s5_second_identical_query_hits_the_cache() {
    let engine = engine_with(error_code_corpus()).await;
    let options = SearchOptions::default();

    let first = engine.search("vsam status", &options).await.unwrap();
    assert!(!first.metrics.cache_hit);

    let second = engine.search("vsam status", &options).await.unwrap();
    assert!(second.metrics.cache_hit);
    assert!(second.metrics.query_time_ms <= first.metrics.query_time_ms);

    // structurally equal apart from execution metadata
    assert_eq!(first.results, second.results);
    assert_eq!(first.total, second.total);
    assert_eq!(first.facets, second.facets);
}

// --- S6: timeout --------------------------------------------------------------

/// Distributed layer that answers after a fixed delay, to force the deadline
/// to elapse at a suspension point.
struct SlowL3 {
    delay: Duration,
    store: Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
}

impl SlowL3 {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            store: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
        }
    }
}

impl DistributedCache for SlowL3 {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.store.lock().unwrap().get(key).cloned())
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        _ttl_secs: Option<u64>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.store.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move { Ok(self.store.lock().unwrap().remove(key).is_some()) })
    }

    fn delete_pattern<'a>(&'a self, _pattern: &'a str) -> BoxFuture<'a, anyhow::Result<usize>> {
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            let count = store.len();
            store.clear();
            Ok(count)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move { Ok(self.store.lock().unwrap().contains_key(key)) })
    }

    fn expire<'a>(&'a self, _key: &'a str, _ttl_secs: u64) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move { Ok(false) })
    }

    fn keys<'a>(&'a self, _pattern: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(async move { Ok(self.store.lock().unwrap().keys().cloned().collect()) })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

#[tokio::test]
async fn s6_timeout_fails_and_never_caches_partial_state() {
    init_tracing();
    let clock = ManualClock::new(0);
    let engine = SearchEngine::with_clock(
        SearchConfig::default(),
        clock,
        Some(Box::new(SlowL3::new(Duration::from_millis(200)))),
    );
    engine.initialize(error_code_corpus()).await.unwrap();

    let options = SearchOptions {
        timeout_ms: Some(20),
        ..SearchOptions::default()
    };
    let err = engine.search("vsam status", &options).await.unwrap_err();
    assert_eq!(err.code(), "SEARCH_TIMEOUT");

    let stats = engine.stats();
    assert_eq!(stats.metrics.error_count, 1);

    // the query key must not have been populated: a later search with a
    // healthy budget recomputes rather than hitting the cache
    let healthy = SearchOptions {
        timeout_ms: Some(5_000),
        ..SearchOptions::default()
    };
    let response = engine.search("vsam status", &healthy).await.unwrap();
    assert!(!response.metrics.cache_hit);
    assert!(!response.results.is_empty());
}

// --- lifecycle and concurrency ------------------------------------------------

#[tokio::test]
async fn search_before_initialize_is_rejected() {
    init_tracing();
    let engine = SearchEngine::new(SearchConfig::default());
    let err = engine
        .search("vsam", &SearchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SEARCH_NOT_INITIALIZED");
}

#[tokio::test]
async fn duplicate_ids_fail_initialization() {
    init_tracing();
    let engine = SearchEngine::new(SearchConfig::default());
    let mut corpus = error_code_corpus();
    corpus.push(corpus[0].clone());
    let err = engine.initialize(corpus).await.unwrap_err();
    assert_eq!(err.code(), "SEARCH_INIT_ERROR");
}

#[tokio::test]
async fn shutdown_rejects_new_and_queued_searches() {
    let engine = engine_with(error_code_corpus()).await;
    engine.shutdown().await;
    let err = engine
        .search("vsam", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, kbsearch::SearchError::ShutDown));
}

#[tokio::test]
async fn add_then_search_observes_the_document() {
    let engine = engine_with(error_code_corpus()).await;

    // prime the cache, then mutate
    engine
        .search("deadlock", &SearchOptions::default())
        .await
        .unwrap();
    engine
        .add(doc(
            "KB-9",
            "DB2 deadlock timeout",
            "application hits a db2 deadlock during the batch window",
            "retry with smaller commit scope",
            Category::Db2,
        ))
        .await
        .unwrap();

    let response = engine
        .search("deadlock", &SearchOptions::default())
        .await
        .unwrap();
    assert!(response.results.iter().any(|r| r.document.id == "KB-9"));

    assert!(engine.remove("KB-9").await.unwrap());
    assert!(!engine.remove("KB-9").await.unwrap());
    let gone = engine
        .search("deadlock", &SearchOptions::default())
        .await
        .unwrap();
    assert!(gone.results.iter().all(|r| r.document.id != "KB-9"));
}

#[tokio::test]
async fn concurrent_identical_searches_deduplicate() {
    let engine = Arc::new(engine_with(error_code_corpus()).await);
    let options = SearchOptions::default();

    let (a, b) = tokio::join!(
        engine.search("vsam status", &options),
        engine.search("vsam status", &options),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.results, b.results);
    assert_eq!(a.total, b.total);
}

#[tokio::test]
async fn concurrency_cap_queues_rather_than_failing() {
    init_tracing();
    let mut config = SearchConfig::default();
    config.performance.max_concurrent_searches = 1;
    let engine = Arc::new(SearchEngine::new(config));
    engine.initialize(error_code_corpus()).await.unwrap();

    let mut handles = Vec::new();
    for query in ["vsam", "s0c7", "sql0803n", "dataset", "payroll"] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.search(query, &SearchOptions::default()).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn facets_require_more_than_one_distinct_value() {
    let engine = engine_with(error_code_corpus()).await;
    let multi = engine
        .search("status OR exception OR duplicate", &SearchOptions::default())
        .await
        .unwrap();
    if multi.results.len() > 1 {
        let facets = multi.facets.expect("multi-category results carry facets");
        assert!(facets.categories.len() > 1);
    }

    let single = engine
        .search("payroll", &SearchOptions::default())
        .await
        .unwrap();
    // one matching category only: the category facet is suppressed
    if let Some(facets) = &single.facets {
        assert!(facets.categories.is_empty());
    }
}

#[tokio::test]
async fn suggestions_use_prefix_enumeration() {
    let engine = engine_with(error_code_corpus()).await;
    let suggestions = engine.suggest("data", 5);
    assert!(suggestions.iter().any(|s| s.starts_with("data")));
    assert!(engine.suggest("d", 5).is_empty(), "short prefixes are gated");
}

#[tokio::test]
async fn limit_and_offset_slice_the_ranking() {
    let mut corpus = Vec::new();
    for i in 0..10 {
        corpus.push(doc(
            &format!("KB-{i}"),
            "VSAM troubleshooting notes",
            "general vsam notes for operators",
            "see runbook",
            Category::Vsam,
        ));
    }
    let engine = engine_with(corpus).await;

    let page = SearchOptions {
        limit: 3,
        offset: 2,
        ..SearchOptions::default()
    };
    let response = engine.search("vsam", &page).await.unwrap();
    assert_eq!(response.total, 10);
    assert_eq!(response.results.len(), 3);
    assert_eq!(response.results[0].rank, 3);
    // identical scores tie-break by id, so paging is deterministic
    assert_eq!(response.results[0].document.id, "KB-2");
}

#[tokio::test]
async fn metrics_track_totals_and_averages() {
    let engine = engine_with(error_code_corpus()).await;
    engine
        .search("vsam", &SearchOptions::default())
        .await
        .unwrap();
    engine
        .search("vsam", &SearchOptions::default())
        .await
        .unwrap();
    let stats = engine.stats();
    assert_eq!(stats.metrics.total_searches, 2);
    assert_eq!(stats.metrics.error_count, 0);
    assert!(stats.metrics.cache_hit_rate > 0.0);
    assert_eq!(stats.index.total_documents, 3);
}

#[tokio::test]
async fn malformed_query_returns_empty_with_warnings() {
    let engine = engine_with(error_code_corpus()).await;
    let response = engine
        .search("\"unterminated", &SearchOptions::default())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(!response.warnings.is_empty());
}

#[tokio::test]
async fn timeout_above_maximum_is_invalid() {
    let engine = engine_with(error_code_corpus()).await;
    let options = SearchOptions {
        timeout_ms: Some(600_000),
        ..SearchOptions::default()
    };
    let err = engine.search("vsam", &options).await.unwrap_err();
    assert_eq!(err.code(), "SEARCH_EXECUTION_ERROR");
}

#[tokio::test]
async fn wildcard_queries_expand_against_the_corpus() {
    let engine = engine_with(error_code_corpus()).await;
    let response = engine
        .search("data*", &SearchOptions::default())
        .await
        .unwrap();
    assert!(
        !response.results.is_empty(),
        "wildcard expansion matched nothing"
    );
}
