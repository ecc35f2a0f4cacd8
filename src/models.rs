//! Shared data model: knowledge-base documents, searchable fields, ranking
//! scores, and the response types returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a knowledge-base record.
pub type DocId = String;

/// Closed category set for knowledge-base entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Jcl,
    Vsam,
    Db2,
    Cics,
    Ims,
    Batch,
    Functional,
    System,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Jcl => "jcl",
            Category::Vsam => "vsam",
            Category::Db2 => "db2",
            Category::Cics => "cics",
            Category::Ims => "ims",
            Category::Batch => "batch",
            Category::Functional => "functional",
            Category::System => "system",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Searchable fields of a document, with the ranking weight fixed at index
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Problem,
    Solution,
    Tags,
    Category,
}

impl Field {
    /// Per-field boost applied to a term's posting entry.
    pub fn weight(&self) -> f64 {
        match self {
            Field::Title => 3.0,
            Field::Problem => 2.0,
            Field::Solution => 1.8,
            Field::Tags => 1.5,
            Field::Category => 1.2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Problem => "problem",
            Field::Solution => "solution",
            Field::Tags => "tags",
            Field::Category => "category",
        }
    }

    pub fn parse(name: &str) -> Option<Field> {
        match name.to_ascii_lowercase().as_str() {
            "title" => Some(Field::Title),
            "problem" => Some(Field::Problem),
            "solution" => Some(Field::Solution),
            "tags" | "tag" => Some(Field::Tags),
            "category" => Some(Field::Category),
            _ => None,
        }
    }

    pub const ALL: [Field; 5] = [
        Field::Title,
        Field::Problem,
        Field::Solution,
        Field::Tags,
        Field::Category,
    ];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A knowledge-base record as delivered by the document source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub category: Category,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

impl Document {
    /// Ratio of successful resolutions, 0.5 when the entry has no ratings yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn field_text(&self, field: Field) -> String {
        match field {
            Field::Title => self.title.clone(),
            Field::Problem => self.problem.clone(),
            Field::Solution => self.solution.clone(),
            Field::Tags => self.tags.join(" "),
            Field::Category => self.category.as_str().to_string(),
        }
    }
}

/// One factor of a ranking score, kept so every score is auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponent {
    pub factor: String,
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
    pub explanation: String,
}

/// Relevance score for one document, with its component breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingScore {
    pub doc_id: DocId,
    pub score: f64,
    pub components: Vec<ScoreComponent>,
    pub boosted: bool,
    pub algorithm: String,
}

/// Result ordering requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Relevance,
    Recent,
    Popular,
}

/// Per-call search options. Engine-level defaults live in
/// [`crate::config::SearchConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    /// Hard deadline override in milliseconds; the engine default applies
    /// when unset.
    pub timeout_ms: Option<u64>,
    /// Restrict matching to these fields when set.
    pub fields: Option<Vec<Field>>,
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub sort: SortOrder,
    pub include_facets: bool,
    pub include_explanations: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            timeout_ms: None,
            fields: None,
            category: None,
            tags: Vec::new(),
            sort: SortOrder::Relevance,
            include_facets: true,
            include_explanations: false,
        }
    }
}

/// One materialized search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub document: Document,
    pub score: f64,
    /// 1-based rank within the full (unsliced) result list.
    pub rank: usize,
    /// Stemmed terms that matched this document, for caller-side highlighting.
    pub matched_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Vec<ScoreComponent>>,
}

/// Facet counts over the result set. A facet is only emitted when it has more
/// than one distinct value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facets {
    pub categories: BTreeMap<String, usize>,
    pub tags: BTreeMap<String, usize>,
}

/// Per-response execution metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub query_time_ms: u64,
    pub cache_hit: bool,
    /// Candidate documents considered before slicing.
    pub total_candidates: usize,
}

/// A complete, well-formed answer to one search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    /// Total matching documents before `[offset, offset+limit)` slicing.
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<Facets>,
    pub suggestions: Vec<String>,
    pub corrections: Vec<String>,
    pub metrics: ResponseMetrics,
    /// Parser warnings that did not fail the search.
    pub warnings: Vec<String>,
}

impl SearchResponse {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            total: 0,
            facets: None,
            suggestions: Vec::new(),
            corrections: Vec::new(),
            metrics: ResponseMetrics::default(),
            warnings: Vec::new(),
        }
    }
}
