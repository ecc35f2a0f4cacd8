//! Positional inverted index over knowledge-base documents.
//!
//! The index exclusively owns its posting lists and per-document records; all
//! reads hand out clones (snapshots), never live views. A single
//! reader/writer lock coordinates mutation - add/remove hold it only for the
//! map surgery, tokenization happens outside.

use crate::clock::Clock;
use crate::errors::SearchError;
use crate::models::{DocId, Document, Field};
use crate::text::{ProcessOptions, TextProcessor};
use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Snapshot schema tag; imports of any other version fail loudly.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Positions recorded per posting entry are bounded; overflow drops the tail.
pub const MAX_POSITIONS_PER_ENTRY: usize = 100;

/// Each field gets a disjoint position range so adjacency checks never cross
/// field boundaries.
pub const FIELD_POSITION_STRIDE: u32 = 10_000;

pub fn field_position_base(field: Field) -> u32 {
    let slot = match field {
        Field::Title => 0,
        Field::Problem => 1,
        Field::Solution => 2,
        Field::Tags => 3,
        Field::Category => 4,
    };
    slot * FIELD_POSITION_STRIDE
}

/// One document's occurrence of a term.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingEntry {
    pub doc_id: DocId,
    pub term_frequency: u32,
    pub positions: Vec<u32>,
    pub fields: BTreeSet<Field>,
    /// Maximum weight of the fields this term appears in.
    pub boost: f64,
}

/// All documents containing a term.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingList {
    pub term: String,
    /// Sum of `term_frequency` over `docs`.
    pub global_frequency: u64,
    pub docs: AHashMap<DocId, PostingEntry>,
}

/// Derived per-document record owned by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: DocId,
    pub field_lengths: BTreeMap<Field, u32>,
    pub total_terms: u32,
    pub term_frequencies: AHashMap<String, u32>,
    pub last_modified_ms: i64,
}

/// Derived statistics; never the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: usize,
    pub unique_terms: usize,
    pub total_terms: u64,
    pub average_document_length: f64,
    pub estimated_bytes: u64,
    pub last_updated_ms: i64,
}

#[derive(Debug, Default)]
struct IndexInner {
    postings: AHashMap<String, PostingList>,
    documents: AHashMap<DocId, IndexedDocument>,
    last_updated_ms: i64,
}

/// The inverted index. Thread-safe; see the module docs for the locking
/// discipline.
pub struct InvertedIndex {
    inner: RwLock<IndexInner>,
    processor: TextProcessor,
    options: ProcessOptions,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

/// Pre-tokenized form of one document, produced outside the index lock.
struct DocTerms {
    id: DocId,
    field_lengths: BTreeMap<Field, u32>,
    total_terms: u32,
    // term -> (tf, positions, fields, boost)
    terms: AHashMap<String, TermAgg>,
}

#[derive(Debug, Clone, Default)]
struct TermAgg {
    term_frequency: u32,
    positions: Vec<u32>,
    fields: BTreeSet<Field>,
    boost: f64,
}

impl InvertedIndex {
    pub fn new(clock: Arc<dyn Clock>, batch_size: usize) -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
            processor: TextProcessor::new(),
            options: ProcessOptions::default(),
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Replace the index contents with `docs`. Tokenization runs in parallel
    /// per batch; map mutation is applied serially so every add stays atomic.
    pub fn build(&self, docs: &[Document]) {
        {
            let mut inner = self.write();
            inner.postings.clear();
            inner.documents.clear();
        }
        for batch in docs.chunks(self.batch_size) {
            let tokenized: Vec<DocTerms> = batch
                .par_iter()
                .map(|doc| self.tokenize_document(doc))
                .collect();
            let now_ms = self.clock.now_ms();
            let mut inner = self.write();
            for terms in tokenized {
                Self::remove_locked(&mut inner, &terms.id);
                Self::insert_locked(&mut inner, terms, now_ms);
            }
            inner.last_updated_ms = now_ms;
        }
        debug!(documents = docs.len(), "index build complete");
    }

    /// Add or replace one document. Replacement is equivalent to
    /// remove-then-add and atomic from the caller's perspective.
    pub fn add(&self, doc: &Document) {
        let terms = self.tokenize_document(doc);
        let now_ms = self.clock.now_ms();
        let mut inner = self.write();
        Self::remove_locked(&mut inner, &terms.id);
        Self::insert_locked(&mut inner, terms, now_ms);
        inner.last_updated_ms = now_ms;
    }

    /// Remove a document; returns false when the id was not indexed.
    pub fn remove(&self, doc_id: &str) -> bool {
        let mut inner = self.write();
        let removed = Self::remove_locked(&mut inner, doc_id);
        if removed {
            inner.last_updated_ms = self.clock.now_ms();
        }
        removed
    }

    /// Posting-list snapshots for the given terms. Terms with no postings are
    /// absent from the result.
    pub fn search(&self, terms: &[String]) -> AHashMap<String, PostingList> {
        let inner = self.read();
        let mut out = AHashMap::with_capacity(terms.len());
        for term in terms {
            if out.contains_key(term) {
                continue;
            }
            if let Some(list) = inner.postings.get(term) {
                out.insert(term.clone(), list.clone());
            }
        }
        out
    }

    pub fn document(&self, doc_id: &str) -> Option<IndexedDocument> {
        self.read().documents.get(doc_id).cloned()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.read().documents.contains_key(doc_id)
    }

    pub fn len(&self) -> usize {
        self.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().documents.is_empty()
    }

    /// Token counts per document, for length normalization during ranking.
    pub fn document_lengths(&self) -> AHashMap<DocId, u32> {
        let inner = self.read();
        inner
            .documents
            .values()
            .map(|doc| (doc.id.clone(), doc.total_terms))
            .collect()
    }

    /// Terms starting with `prefix`, ordered by descending global frequency
    /// (ties alphabetically), capped at `limit`. Ordering is explicit so the
    /// underlying map type never leaks through.
    pub fn prefix(&self, prefix: &str, limit: usize) -> Vec<(String, u64)> {
        let needle = prefix.to_lowercase();
        let inner = self.read();
        let mut hits: Vec<(String, u64)> = inner
            .postings
            .values()
            .filter(|list| list.term.starts_with(&needle))
            .map(|list| (list.term.clone(), list.global_frequency))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        hits
    }

    /// Every indexed term, sorted. A snapshot for the fuzzy matcher.
    pub fn vocabulary(&self) -> Vec<String> {
        let inner = self.read();
        let mut terms: Vec<String> = inner.postings.keys().cloned().collect();
        terms.sort_unstable();
        terms
    }

    /// The `n` most frequent terms, for cache warming.
    pub fn top_terms(&self, n: usize) -> Vec<(String, u64)> {
        let inner = self.read();
        let mut terms: Vec<(String, u64)> = inner
            .postings
            .values()
            .map(|list| (list.term.clone(), list.global_frequency))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        terms.truncate(n);
        terms
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.read();
        let total_documents = inner.documents.len();
        let total_terms: u64 = inner.documents.values().map(|d| d.total_terms as u64).sum();
        let average_document_length = if total_documents == 0 {
            0.0
        } else {
            total_terms as f64 / total_documents as f64
        };
        let estimated_bytes = estimate_bytes(&inner);
        IndexStats {
            total_documents,
            unique_terms: inner.postings.len(),
            total_terms,
            average_document_length,
            estimated_bytes,
            last_updated_ms: inner.last_updated_ms,
        }
    }

    pub fn average_document_length(&self) -> f64 {
        let inner = self.read();
        if inner.documents.is_empty() {
            return 0.0;
        }
        let total: u64 = inner.documents.values().map(|d| d.total_terms as u64).sum();
        total as f64 / inner.documents.len() as f64
    }

    /// Serialize the full index state under the versioned snapshot schema.
    /// Output ordering is canonical, so identical states produce identical
    /// bytes.
    pub fn export(&self) -> IndexSnapshot {
        let inner = self.read();
        let mut documents: Vec<SnapshotDocument> = inner
            .documents
            .values()
            .map(|doc| SnapshotDocument {
                id: doc.id.clone(),
                field_lengths: doc.field_lengths.clone(),
                total_terms: doc.total_terms,
                term_frequencies: to_sorted_pairs(&doc.term_frequencies),
                last_modified_ms: doc.last_modified_ms,
            })
            .collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));

        let mut postings: Vec<SnapshotPosting> = inner
            .postings
            .values()
            .map(|list| {
                let mut entries: Vec<SnapshotPostingEntry> = list
                    .docs
                    .values()
                    .map(|entry| SnapshotPostingEntry {
                        doc_id: entry.doc_id.clone(),
                        term_frequency: entry.term_frequency,
                        positions: entry.positions.clone(),
                        fields: entry.fields.clone(),
                        boost: entry.boost,
                    })
                    .collect();
                entries.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
                SnapshotPosting {
                    term: list.term.clone(),
                    global_frequency: list.global_frequency,
                    entries,
                }
            })
            .collect();
        postings.sort_by(|a, b| a.term.cmp(&b.term));

        IndexSnapshot {
            schema_version: SNAPSHOT_VERSION,
            last_updated_ms: inner.last_updated_ms,
            documents,
            postings,
        }
    }

    /// Replace the index contents from a snapshot. Incompatible schema
    /// versions are rejected.
    pub fn import(&self, snapshot: IndexSnapshot) -> Result<(), SearchError> {
        if snapshot.schema_version != SNAPSHOT_VERSION {
            return Err(SearchError::Snapshot {
                expected: SNAPSHOT_VERSION,
                found: snapshot.schema_version,
            });
        }
        let mut inner = self.write();
        inner.postings.clear();
        inner.documents.clear();
        for doc in snapshot.documents {
            inner.documents.insert(
                doc.id.clone(),
                IndexedDocument {
                    id: doc.id,
                    field_lengths: doc.field_lengths,
                    total_terms: doc.total_terms,
                    term_frequencies: doc.term_frequencies.into_iter().collect(),
                    last_modified_ms: doc.last_modified_ms,
                },
            );
        }
        for posting in snapshot.postings {
            let docs: AHashMap<DocId, PostingEntry> = posting
                .entries
                .into_iter()
                .map(|entry| {
                    (
                        entry.doc_id.clone(),
                        PostingEntry {
                            doc_id: entry.doc_id,
                            term_frequency: entry.term_frequency,
                            positions: entry.positions,
                            fields: entry.fields,
                            boost: entry.boost,
                        },
                    )
                })
                .collect();
            inner.postings.insert(
                posting.term.clone(),
                PostingList {
                    term: posting.term,
                    global_frequency: posting.global_frequency,
                    docs,
                },
            );
        }
        inner.last_updated_ms = snapshot.last_updated_ms;
        Ok(())
    }

    /// Shrink over-allocated maps after heavy churn.
    pub fn compact(&self) {
        let mut inner = self.write();
        inner.postings.shrink_to_fit();
        inner.documents.shrink_to_fit();
        for list in inner.postings.values_mut() {
            list.docs.shrink_to_fit();
        }
    }

    fn tokenize_document(&self, doc: &Document) -> DocTerms {
        let mut terms: AHashMap<String, TermAgg> = AHashMap::new();
        let mut field_lengths = BTreeMap::new();
        let mut total_terms = 0u32;
        for field in Field::ALL {
            let text = doc.field_text(field);
            let tokens = self.processor.process(&text, field, &self.options);
            field_lengths.insert(field, tokens.len() as u32);
            total_terms += tokens.len() as u32;
            let base = field_position_base(field);
            for token in tokens {
                let agg = terms.entry(token.stemmed).or_default();
                agg.term_frequency += 1;
                if agg.positions.len() < MAX_POSITIONS_PER_ENTRY {
                    agg.positions.push(base + token.position);
                }
                agg.fields.insert(field);
                agg.boost = agg.boost.max(field.weight());
            }
        }
        DocTerms {
            id: doc.id.clone(),
            field_lengths,
            total_terms,
            terms,
        }
    }

    fn insert_locked(inner: &mut IndexInner, terms: DocTerms, now_ms: i64) {
        let mut term_frequencies = AHashMap::with_capacity(terms.terms.len());
        for (term, agg) in terms.terms {
            term_frequencies.insert(term.clone(), agg.term_frequency);
            let list = inner
                .postings
                .entry(term.clone())
                .or_insert_with(|| PostingList {
                    term,
                    global_frequency: 0,
                    docs: AHashMap::new(),
                });
            list.global_frequency += agg.term_frequency as u64;
            list.docs.insert(
                terms.id.clone(),
                PostingEntry {
                    doc_id: terms.id.clone(),
                    term_frequency: agg.term_frequency,
                    positions: agg.positions,
                    fields: agg.fields,
                    boost: agg.boost,
                },
            );
        }
        inner.documents.insert(
            terms.id.clone(),
            IndexedDocument {
                id: terms.id,
                field_lengths: terms.field_lengths,
                total_terms: terms.total_terms,
                term_frequencies,
                last_modified_ms: now_ms,
            },
        );
    }

    fn remove_locked(inner: &mut IndexInner, doc_id: &str) -> bool {
        let Some(doc) = inner.documents.remove(doc_id) else {
            return false;
        };
        for (term, tf) in &doc.term_frequencies {
            let mut drop_list = false;
            if let Some(list) = inner.postings.get_mut(term) {
                list.global_frequency = list.global_frequency.saturating_sub(*tf as u64);
                list.docs.remove(doc_id);
                drop_list = list.docs.is_empty();
            }
            if drop_list {
                inner.postings.remove(term);
            }
        }
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            warn!("index lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            warn!("index lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        })
    }
}

fn to_sorted_pairs(map: &AHashMap<String, u32>) -> Vec<(String, u32)> {
    let mut pairs: Vec<(String, u32)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

fn estimate_bytes(inner: &IndexInner) -> u64 {
    let mut bytes = 0u64;
    for (term, list) in &inner.postings {
        bytes += term.len() as u64 + 48;
        for entry in list.docs.values() {
            bytes += entry.doc_id.len() as u64
                + entry.positions.len() as u64 * 4
                + entry.fields.len() as u64
                + 40;
        }
    }
    for doc in inner.documents.values() {
        bytes += doc.id.len() as u64 + 64;
        for term in doc.term_frequencies.keys() {
            bytes += term.len() as u64 + 8;
        }
    }
    bytes
}

/// Versioned, canonical serialization of the full index state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub schema_version: u32,
    pub last_updated_ms: i64,
    pub documents: Vec<SnapshotDocument>,
    pub postings: Vec<SnapshotPosting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: DocId,
    pub field_lengths: BTreeMap<Field, u32>,
    pub total_terms: u32,
    pub term_frequencies: Vec<(String, u32)>,
    pub last_modified_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPosting {
    pub term: String,
    pub global_frequency: u64,
    pub entries: Vec<SnapshotPostingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPostingEntry {
    pub doc_id: DocId,
    pub term_frequency: u32,
    pub positions: Vec<u32>,
    pub fields: BTreeSet<Field>,
    pub boost: f64,
}
