//! Text processing pipeline: normalize, split, filter, classify, boost, stem.
//!
//! Splitting preserves dotted identifiers (`SYS1.PROCLIB`), hyphens
//! (`COMP-3`), and underscores, because those are meaningful tokens in
//! mainframe material. Classification runs before stemming so error codes and
//! domain keywords are never stemmed.

pub mod stemmer;
pub mod stop_words;

use crate::domain;
use crate::models::Field;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Classification of a processed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Word,
    Number,
    Code,
    Error,
    Compound,
    Acronym,
}

impl TokenKind {
    /// Per-token boost folded into the posting entry.
    pub fn boost(&self) -> f64 {
        match self {
            TokenKind::Error => 3.0,
            TokenKind::Code => 1.8,
            TokenKind::Acronym => 1.4,
            _ => 1.0,
        }
    }
}

/// One processed token of a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Original text as it appeared.
    pub text: String,
    /// Sequential position within the field.
    pub position: u32,
    pub field: Field,
    /// Index term: stemmed form, or the normalized form when stemming is
    /// skipped (error codes, domain keywords, short tokens).
    pub stemmed: String,
    pub normalized: String,
    pub kind: TokenKind,
    pub boost: f64,
}

/// Special terms pulled out of raw text without tokenization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialTerms {
    pub error_codes: Vec<String>,
    pub mainframe_terms: Vec<String>,
    pub system_names: Vec<String>,
}

/// Knobs for [`TextProcessor::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub preserve_case: bool,
    pub enable_stop_words: bool,
    pub min_length: usize,
    pub max_length: usize,
    /// A field contributes at most this many tokens; overflow truncates the
    /// tail.
    pub max_tokens_per_field: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            preserve_case: false,
            enable_stop_words: true,
            min_length: 2,
            max_length: 50,
            max_tokens_per_field: 1_000,
        }
    }
}

/// Stateless text processor. Never fails; empty input yields empty output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextProcessor;

impl TextProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Run the full pipeline over one field's text.
    pub fn process(&self, text: &str, field: Field, options: &ProcessOptions) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut position: u32 = 0;
        for raw in split_text(text) {
            if tokens.len() >= options.max_tokens_per_field {
                break;
            }
            let normalized = if options.preserve_case {
                raw.clone()
            } else {
                raw.to_lowercase()
            };
            let len = normalized.chars().count();
            if len < options.min_length || len > options.max_length {
                continue;
            }
            if options.enable_stop_words && stop_words::is_stop_word(&raw.to_lowercase()) {
                continue;
            }
            let kind = classify(&raw, &normalized);
            let stemmed = match kind {
                TokenKind::Error | TokenKind::Code => normalized.clone(),
                _ if len < 3 => normalized.clone(),
                _ => stemmer::stem(&normalized),
            };
            tokens.push(Token {
                text: raw,
                position,
                field,
                stemmed,
                normalized,
                kind,
                boost: kind.boost(),
            });
            position += 1;
        }
        tokens
    }

    /// Tokenize a query fragment into index terms (normalized + stemmed),
    /// using the same rules as document processing so query terms and index
    /// terms land in the same space.
    pub fn tokenize_query(&self, query: &str) -> Vec<String> {
        self.process(query, Field::Problem, &ProcessOptions::default())
            .into_iter()
            .map(|t| t.stemmed)
            .collect()
    }

    /// Stem one word the way the index does.
    pub fn stem(&self, word: &str) -> String {
        let lower = word.to_lowercase();
        if domain::is_error_code(&lower) || domain::is_mainframe_term(&lower) {
            return lower;
        }
        stemmer::stem(&lower)
    }

    /// Pull error codes, domain keywords, and system/dataset names out of raw
    /// text. Order of first appearance is preserved; duplicates are dropped.
    pub fn extract_special(&self, text: &str) -> SpecialTerms {
        let mut special = SpecialTerms::default();
        let upper = text.to_uppercase();

        let mut seen = HashSet::new();
        for pattern in domain::TEXT_ERROR_PATTERNS.iter() {
            for m in pattern.find_iter(&upper) {
                let code = m.as_str().to_string();
                if seen.insert(code.clone()) {
                    special.error_codes.push(code);
                }
            }
        }

        let mut seen_terms = HashSet::new();
        let mut seen_systems = HashSet::new();
        for raw in split_text(text) {
            let lower = raw.to_lowercase();
            if domain::is_mainframe_term(&lower) && seen_terms.insert(lower.clone()) {
                special.mainframe_terms.push(lower.clone());
            }
            if domain::is_system_name(&lower) && seen_systems.insert(lower.clone()) {
                special.system_names.push(lower);
            }
        }
        for m in domain::DATASET_NAME.find_iter(&upper) {
            let name = m.as_str().to_string();
            // Single matches of the error patterns also satisfy the dataset
            // shape; keep them out of the name list.
            if special.error_codes.iter().any(|c| name.contains(c.as_str())) {
                continue;
            }
            if seen_systems.insert(name.to_lowercase()) {
                special.system_names.push(name);
            }
        }
        special
    }
}

/// Split on whitespace and punctuation while keeping `.`, `-`, and `_` that
/// sit inside a token. Leading/trailing separators (sentence periods, dashes)
/// are trimmed off.
pub fn split_text(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '.' || ch == '-' || ch == '_' || ch == '/' {
            current.push(ch);
        } else if !current.is_empty() {
            push_trimmed(&mut out, &current);
            current.clear();
        }
    }
    if !current.is_empty() {
        push_trimmed(&mut out, &current);
    }
    out
}

fn push_trimmed(out: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim_matches(|c| matches!(c, '.' | '-' | '_' | '/'));
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn classify(raw: &str, normalized: &str) -> TokenKind {
    if domain::is_error_code(raw) {
        return TokenKind::Error;
    }
    if domain::is_mainframe_term(normalized) {
        return TokenKind::Code;
    }
    if raw.len() >= 2 && raw.chars().all(|c| c.is_ascii_uppercase()) {
        return TokenKind::Acronym;
    }
    if normalized.chars().all(|c| c.is_ascii_digit()) {
        return TokenKind::Number;
    }
    if normalized.contains(['.', '-', '_', '/']) {
        return TokenKind::Compound;
    }
    TokenKind::Word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_empty_output() {
        let p = TextProcessor::new();
        assert!(p.process("", Field::Title, &ProcessOptions::default()).is_empty());
        assert!(p.process("   ", Field::Title, &ProcessOptions::default()).is_empty());
    }

    #[test]
    fn splits_preserve_compound_identifiers() {
        let tokens = split_text("Check SYS1.PROCLIB, then COMP-3 fields (WS_TOTAL).");
        assert!(tokens.contains(&"SYS1.PROCLIB".to_string()));
        assert!(tokens.contains(&"COMP-3".to_string()));
        assert!(tokens.contains(&"WS_TOTAL".to_string()));
        // sentence punctuation is trimmed off
        assert!(!tokens.iter().any(|t| t.ends_with('.')));
    }

    #[test]
    fn classification_and_boosts() {
        let p = TextProcessor::new();
        let tokens = p.process(
            "S0C7 abend in VSAM dataset during CPU bound step 42",
            Field::Problem,
            &ProcessOptions::default(),
        );
        let find = |text: &str| tokens.iter().find(|t| t.text == text).unwrap();

        let s0c7 = find("S0C7");
        assert_eq!(s0c7.kind, TokenKind::Error);
        assert_eq!(s0c7.boost, 3.0);
        assert_eq!(s0c7.stemmed, "s0c7");

        let vsam = find("VSAM");
        assert_eq!(vsam.kind, TokenKind::Code);
        assert_eq!(vsam.boost, 1.8);

        let cpu = find("CPU");
        assert_eq!(cpu.kind, TokenKind::Acronym);
        assert_eq!(cpu.boost, 1.4);

        let num = find("42");
        assert_eq!(num.kind, TokenKind::Number);
        assert_eq!(num.boost, 1.0);
    }

    #[test]
    fn stop_words_and_length_filter() {
        let p = TextProcessor::new();
        let tokens = p.process(
            "the job failed with a x error",
            Field::Problem,
            &ProcessOptions::default(),
        );
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["job", "failed", "error"]);
        // positions stay sequential after drops
        let positions: Vec<u32> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn stemming_skips_errors_and_codes() {
        let p = TextProcessor::new();
        let tokens = p.process("abends processing S0C7", Field::Problem, &ProcessOptions::default());
        let find = |text: &str| tokens.iter().find(|t| t.text == text).unwrap();
        assert_eq!(find("abends").stemmed, "abend");
        assert_eq!(find("processing").stemmed, "process");
        assert_eq!(find("S0C7").stemmed, "s0c7");
    }

    #[test]
    fn field_token_cap_truncates_tail() {
        let p = TextProcessor::new();
        let text = (0..50).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let options = ProcessOptions {
            max_tokens_per_field: 10,
            ..ProcessOptions::default()
        };
        let tokens = p.process(&text, Field::Solution, &options);
        assert_eq!(tokens.len(), 10);
        assert_eq!(tokens[9].text, "word9");
    }

    #[test]
    fn extract_special_collects_all_groups() {
        let p = TextProcessor::new();
        let special = p.extract_special(
            "Job abends with S0C7 and SQL0803N; VSAM STATUS 35 on SYS1.PROCLIB under JES2. Check the dataset.",
        );
        assert!(special.error_codes.contains(&"S0C7".to_string()));
        assert!(special.error_codes.contains(&"SQL0803N".to_string()));
        assert!(special.error_codes.iter().any(|c| c.starts_with("VSAM STATUS")));
        assert!(special.mainframe_terms.contains(&"vsam".to_string()));
        assert!(special.mainframe_terms.contains(&"dataset".to_string()));
        assert!(special.system_names.contains(&"jes2".to_string()));
        assert!(special.system_names.contains(&"SYS1.PROCLIB".to_string()));
    }

    #[test]
    fn tokenize_query_matches_document_terms() {
        let p = TextProcessor::new();
        let doc_tokens = p.process("database connection failures", Field::Problem, &ProcessOptions::default());
        let query_terms = p.tokenize_query("failure database");
        for term in &query_terms {
            assert!(doc_tokens.iter().any(|t| &t.stemmed == term), "missing {term}");
        }
    }
}
