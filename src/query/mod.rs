//! Query language: lexer + recursive-descent parser.
//!
//! Grammar (whitespace separated):
//! - bare words, phrases `"..."`, fields `field:value` / `field:"..."`
//! - fuzzy `term~` / `term~N`, boost `term^F`, wildcards `*` and `?`
//! - required `+term`, prohibited `-term`
//! - operators `AND` / `OR` / `NOT` plus aliases `&&` / `||`, parentheses
//!
//! Malformed input never panics and never errors out of `parse`: the result
//! carries an empty term list with the errors attached, and the caller
//! decides whether to proceed.

use crate::models::Field;
use crate::text::TextProcessor;
use serde::{Deserialize, Serialize};
use std::iter::Peekable;
use std::str::Chars;

/// Longer queries parse but produce a warning.
pub const MAX_QUERY_LENGTH: usize = 1_000;

pub const DEFAULT_FUZZY_DISTANCE: u32 = 2;

/// Shape of the parsed query as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Simple,
    Boolean,
    Phrase,
    Field,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TermOperator {
    And,
    Or,
    Not,
    Phrase,
}

/// One parsed term with its modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTerm {
    pub text: String,
    pub field: Option<Field>,
    pub operator: TermOperator,
    pub boost: f64,
    pub fuzzy: bool,
    /// Fuzzy edit-distance budget when `fuzzy` is set.
    pub proximity: Option<u32>,
    pub required: bool,
    pub prohibited: bool,
    pub wildcard: bool,
}

impl QueryTerm {
    fn new(text: String) -> Self {
        Self {
            text,
            field: None,
            operator: TermOperator::Or,
            boost: 1.0,
            fuzzy: false,
            proximity: None,
            required: false,
            prohibited: false,
            wildcard: false,
        }
    }
}

/// Structured filter derived from `category:` / `tags:` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: Field,
    pub value: String,
}

/// Parser knobs echoed into the result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParseOptions {
    pub default_operator: TermOperator,
    pub fuzzy_distance: u32,
    pub fuzzy_enabled: bool,
}

/// The parse result. `normalized` is a canonical echo of the input: operator
/// casing and whitespace are normalized, aliases rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub query_type: QueryType,
    pub terms: Vec<QueryTerm>,
    pub filters: Vec<QueryFilter>,
    pub options: ParseOptions,
    pub original: String,
    pub normalized: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validation without the full parse result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Index-ready partition of the parsed terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchTerms {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub prohibited: Vec<String>,
    pub phrases: Vec<Vec<String>>,
}

impl SearchTerms {
    /// Union of the terms the index should be asked for (prohibited terms
    /// included so exclusion can be checked against postings).
    pub fn lookup_terms(&self) -> Vec<String> {
        let mut out = Vec::new();
        for term in self
            .required
            .iter()
            .chain(self.optional.iter())
            .chain(self.prohibited.iter())
            .chain(self.phrases.iter().flatten())
        {
            if !out.contains(term) {
                out.push(term.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.optional.is_empty()
            && self.prohibited.is_empty()
            && self.phrases.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Plus,
    Minus,
    Not,
    And,
    Or,
    LParen,
    RParen,
    Phrase { text: String, field: Option<String> },
    Word { raw: String },
}

/// Recursive-descent parser over the lexed token stream.
pub struct QueryParser {
    processor: TextProcessor,
    fuzzy_enabled: bool,
    fuzzy_distance: u32,
}

impl QueryParser {
    pub fn new(fuzzy_enabled: bool) -> Self {
        Self {
            processor: TextProcessor::new(),
            fuzzy_enabled,
            fuzzy_distance: DEFAULT_FUZZY_DISTANCE,
        }
    }

    /// Parse a query. Never fails; inspect `errors` on the result.
    pub fn parse(&self, input: &str) -> ParsedQuery {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if input.trim().is_empty() {
            warnings.push("empty query".to_string());
            return self.finish(input, Vec::new(), Vec::new(), errors, warnings, String::new());
        }
        if input.chars().count() > MAX_QUERY_LENGTH {
            warnings.push(format!(
                "query length {} exceeds {MAX_QUERY_LENGTH} characters",
                input.chars().count()
            ));
        }

        let tokens = match lex(input) {
            Ok(tokens) => tokens,
            Err(message) => {
                errors.push(message);
                return self.finish(input, Vec::new(), Vec::new(), errors, warnings, String::new());
            }
        };
        let normalized = normalize_tokens(&tokens);

        let mut state = ParserState {
            parser: self,
            tokens,
            pos: 0,
            terms: Vec::new(),
            filters: Vec::new(),
            errors,
            warnings,
        };
        state.parse_expr();
        let ParserState {
            mut terms,
            filters,
            errors,
            warnings,
            ..
        } = state;

        if !errors.is_empty() {
            terms.clear();
        }
        self.finish(input, terms, filters, errors, warnings, normalized)
    }

    /// Errors and warnings for a query without building the full result.
    pub fn validate(&self, input: &str) -> QueryValidation {
        let parsed = self.parse(input);
        QueryValidation {
            valid: parsed.errors.is_empty(),
            errors: parsed.errors,
            warnings: parsed.warnings,
        }
    }

    /// Partition parsed terms into the sets the index consumes. Term text is
    /// run through the same tokenization as documents so both sides meet in
    /// stemmed space.
    pub fn extract_search_terms(&self, parsed: &ParsedQuery) -> SearchTerms {
        let mut out = SearchTerms::default();
        for term in &parsed.terms {
            if term.operator == TermOperator::Phrase {
                let words = self.processor.tokenize_query(&term.text);
                if !words.is_empty() {
                    out.phrases.push(words);
                }
                continue;
            }
            let words = self.processor.tokenize_query(&term.text);
            for word in words {
                if term.prohibited {
                    push_unique(&mut out.prohibited, word);
                } else if term.required {
                    push_unique(&mut out.required, word);
                } else {
                    push_unique(&mut out.optional, word);
                }
            }
        }
        out
    }

    fn finish(
        &self,
        input: &str,
        terms: Vec<QueryTerm>,
        filters: Vec<QueryFilter>,
        errors: Vec<String>,
        warnings: Vec<String>,
        normalized: String,
    ) -> ParsedQuery {
        let query_type = classify_query(&terms);
        ParsedQuery {
            query_type,
            terms,
            filters,
            options: ParseOptions {
                default_operator: TermOperator::Or,
                fuzzy_distance: self.fuzzy_distance,
                fuzzy_enabled: self.fuzzy_enabled,
            },
            original: input.to_string(),
            normalized,
            errors,
            warnings,
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn classify_query(terms: &[QueryTerm]) -> QueryType {
    let has_phrase = terms.iter().any(|t| t.operator == TermOperator::Phrase);
    let has_field = terms.iter().any(|t| t.field.is_some());
    let has_bool = terms
        .iter()
        .any(|t| t.required || t.prohibited || t.operator == TermOperator::And || t.operator == TermOperator::Not);
    let kinds = usize::from(has_phrase) + usize::from(has_field) + usize::from(has_bool);
    match (kinds, has_phrase, has_field, has_bool) {
        (0, ..) => QueryType::Simple,
        (1, true, _, _) => QueryType::Phrase,
        (1, _, true, _) => QueryType::Field,
        (1, _, _, true) => QueryType::Boolean,
        _ => QueryType::Mixed,
    }
}

struct ParserState<'a> {
    parser: &'a QueryParser,
    tokens: Vec<Tok>,
    pos: usize,
    terms: Vec<QueryTerm>,
    filters: Vec<QueryFilter>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ParserState<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_expr(&mut self) {
        self.parse_or();
        // leftover tokens indicate unbalanced structure
        if let Some(tok) = self.peek() {
            if *tok == Tok::RParen {
                self.errors.push("unmatched closing parenthesis".to_string());
            } else {
                self.errors.push("unexpected trailing input".to_string());
            }
            self.pos = self.tokens.len();
        }
    }

    fn parse_or(&mut self) {
        self.parse_and();
        while let Some(Tok::Or) = self.peek() {
            self.next();
            if self.peek().is_none() {
                self.errors.push("trailing operator OR".to_string());
                return;
            }
            self.parse_and();
        }
    }

    fn parse_and(&mut self) {
        let mut last = self.parse_factor();
        loop {
            match self.peek() {
                Some(Tok::And) => {
                    self.next();
                    if self.peek().is_none() {
                        self.errors.push("trailing operator AND".to_string());
                        return;
                    }
                    let right = self.parse_factor();
                    // AND binds single terms; a parenthesized OR group keeps
                    // its members optional
                    if last.1 - last.0 == 1 {
                        self.mark_required(last);
                    }
                    if right.1 - right.0 == 1 {
                        self.mark_required(right);
                    }
                    last = right;
                }
                Some(Tok::Or) | Some(Tok::RParen) | None => break,
                // adjacency is the default operator (OR); prefixes and NOT
                // are handled inside parse_factor
                Some(_) => {
                    last = self.parse_factor();
                }
            }
        }
    }

    /// Returns the index range of terms produced by this factor.
    fn parse_factor(&mut self) -> (usize, usize) {
        let start = self.terms.len();
        match self.next() {
            Some(Tok::Plus) => {
                if self.peek().is_none() {
                    self.errors.push("trailing operator +".to_string());
                    return (start, self.terms.len());
                }
                let range = self.parse_factor();
                self.mark_required(range);
            }
            Some(Tok::Minus) | Some(Tok::Not) => {
                if self.peek().is_none() {
                    self.errors.push("trailing operator NOT".to_string());
                    return (start, self.terms.len());
                }
                let range = self.parse_factor();
                self.mark_prohibited(range);
            }
            Some(Tok::LParen) => {
                self.parse_or();
                match self.peek() {
                    Some(Tok::RParen) => {
                        self.next();
                    }
                    _ => self.errors.push("unmatched opening parenthesis".to_string()),
                }
            }
            Some(Tok::Phrase { text, field }) => {
                self.push_phrase(text, field);
            }
            Some(Tok::Word { raw }) => {
                self.push_word(raw);
            }
            Some(Tok::And) | Some(Tok::Or) => {
                self.errors.push("operator without a left-hand term".to_string());
            }
            Some(Tok::RParen) => {
                self.errors.push("unmatched closing parenthesis".to_string());
            }
            None => {
                self.errors.push("unexpected end of query".to_string());
            }
        }
        (start, self.terms.len())
    }

    fn mark_required(&mut self, range: (usize, usize)) {
        for term in &mut self.terms[range.0..range.1] {
            if !term.prohibited && term.operator != TermOperator::Phrase {
                term.required = true;
                term.operator = TermOperator::And;
            } else if term.operator == TermOperator::Phrase {
                term.required = true;
            }
        }
    }

    fn mark_prohibited(&mut self, range: (usize, usize)) {
        for term in &mut self.terms[range.0..range.1] {
            term.prohibited = true;
            term.required = false;
            if term.operator != TermOperator::Phrase {
                term.operator = TermOperator::Not;
            }
        }
    }

    fn push_phrase(&mut self, text: String, field: Option<String>) {
        let resolved = self.resolve_field(field);
        if text.trim().is_empty() {
            self.warnings.push("empty phrase ignored".to_string());
            return;
        }
        let mut term = QueryTerm::new(text);
        term.operator = TermOperator::Phrase;
        term.field = resolved;
        self.push_filter_for(&term);
        self.terms.push(term);
    }

    fn push_word(&mut self, raw: String) {
        let (field, rest) = match raw.split_once(':') {
            Some((name, value)) => {
                if value.is_empty() {
                    self.warnings
                        .push(format!("field '{name}' has no value; ignored"));
                    return;
                }
                (Some(name.to_string()), value.to_string())
            }
            None => (None, raw),
        };
        let resolved = self.resolve_field(field);

        let decorated = strip_decorations(&rest, self.parser.fuzzy_enabled);
        for warning in decorated.warnings {
            self.warnings.push(warning);
        }
        if decorated.text.is_empty() {
            return;
        }
        let mut term = QueryTerm::new(decorated.text);
        term.field = resolved;
        term.boost = decorated.boost.unwrap_or(1.0);
        term.wildcard = decorated.wildcard;
        if let Some(proximity) = decorated.fuzzy {
            term.fuzzy = true;
            term.proximity = Some(proximity.unwrap_or(self.parser.fuzzy_distance));
        }
        self.push_filter_for(&term);
        self.terms.push(term);
    }

    fn push_filter_for(&mut self, term: &QueryTerm) {
        if matches!(term.field, Some(Field::Category) | Some(Field::Tags)) {
            self.filters.push(QueryFilter {
                field: term.field.unwrap(),
                value: term.text.to_lowercase(),
            });
        }
    }

    fn resolve_field(&mut self, field: Option<String>) -> Option<Field> {
        let name = field?;
        match Field::parse(&name) {
            Some(field) => Some(field),
            None => {
                self.warnings.push(format!("unknown field '{name}'"));
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct Decorated {
    text: String,
    fuzzy: Option<Option<u32>>,
    boost: Option<f64>,
    wildcard: bool,
    warnings: Vec<String>,
}

/// Strip trailing `~N` and `^F` decorations (in either order) and detect
/// wildcard characters. With fuzzy disabled, `~` is a literal and only boost
/// decorations are interpreted.
fn strip_decorations(raw: &str, fuzzy_enabled: bool) -> Decorated {
    let mut out = Decorated::default();
    let mut text = raw.to_string();
    loop {
        if let Some(pos) = text.rfind('^') {
            let suffix = &text[pos + 1..];
            if !suffix.contains('~') {
                match suffix.parse::<f64>() {
                    Ok(boost) if boost.is_finite() && boost > 0.0 => out.boost = Some(boost),
                    _ => out
                        .warnings
                        .push(format!("invalid boost '^{suffix}'; using 1.0")),
                }
                text.truncate(pos);
                continue;
            }
        }
        if fuzzy_enabled {
            if let Some(pos) = text.rfind('~') {
                let suffix = &text[pos + 1..];
                if suffix.is_empty() {
                    out.fuzzy = Some(None);
                    text.truncate(pos);
                    continue;
                }
                if let Ok(n) = suffix.parse::<u32>() {
                    out.fuzzy = Some(Some(n));
                    text.truncate(pos);
                    continue;
                }
            }
        }
        break;
    }
    // leftover tildes and carets are literals; tokenization drops them
    text.retain(|c| c != '~' && c != '^');
    out.wildcard = text.contains('*') || text.contains('?');
    out.text = text;
    out
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric()
        || matches!(ch, '_' | '.' | '-' | '*' | '?' | '~' | '^' | ':' | '/' | '#' | '$' | '@')
}

fn lex(input: &str) -> Result<Vec<Tok>, String> {
    let mut chars = input.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Tok::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Tok::Minus);
            }
            '(' => {
                chars.next();
                tokens.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::RParen);
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                tokens.push(Tok::And);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Tok::Or);
            }
            '"' => {
                chars.next();
                let text = lex_quoted(&mut chars)?;
                tokens.push(Tok::Phrase { text, field: None });
            }
            c if is_word_char(c) => {
                let tok = lex_word(&mut chars)?;
                tokens.push(tok);
            }
            _ => {
                // unknown punctuation is skipped, matching tokenization
                chars.next();
            }
        }
    }
    Ok(tokens)
}

fn lex_quoted(chars: &mut Peekable<Chars>) -> Result<String, String> {
    let mut buf = String::new();
    let mut escaped = false;
    for ch in chars.by_ref() {
        if escaped {
            buf.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            return Ok(buf);
        } else {
            buf.push(ch);
        }
    }
    Err("unmatched quote".to_string())
}

fn lex_word(chars: &mut Peekable<Chars>) -> Result<Tok, String> {
    let mut buf = String::new();
    while let Some(&ch) = chars.peek() {
        if ch == ':' {
            // field:"quoted phrase"
            let mut ahead = chars.clone();
            ahead.next();
            if ahead.peek() == Some(&'"') {
                chars.next(); // ':'
                chars.next(); // '"'
                let text = lex_quoted(chars)?;
                return Ok(Tok::Phrase {
                    text,
                    field: Some(buf),
                });
            }
            buf.push(ch);
            chars.next();
        } else if is_word_char(ch) {
            buf.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    let upper = buf.to_ascii_uppercase();
    Ok(match upper.as_str() {
        "AND" => Tok::And,
        "OR" => Tok::Or,
        "NOT" => Tok::Not,
        _ => Tok::Word { raw: buf },
    })
}

/// Canonical echo of the token stream: single spaces, upper-case operators,
/// aliases rewritten, prefixes attached to their terms.
fn normalize_tokens(tokens: &[Tok]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut attach_next = false;
    for tok in tokens {
        let rendered = match tok {
            Tok::Plus => {
                push_attached(&mut parts, "+", &mut attach_next);
                continue;
            }
            Tok::Minus => {
                push_attached(&mut parts, "-", &mut attach_next);
                continue;
            }
            Tok::Not => "NOT".to_string(),
            Tok::And => "AND".to_string(),
            Tok::Or => "OR".to_string(),
            Tok::LParen => {
                push_attached(&mut parts, "(", &mut attach_next);
                continue;
            }
            Tok::RParen => {
                if let Some(last) = parts.last_mut() {
                    last.push(')');
                    continue;
                }
                ")".to_string()
            }
            Tok::Phrase { text, field } => match field {
                Some(name) => format!("{name}:\"{text}\""),
                None => format!("\"{text}\""),
            },
            Tok::Word { raw } => raw.clone(),
        };
        if attach_next {
            if let Some(last) = parts.last_mut() {
                last.push_str(&rendered);
                attach_next = false;
                continue;
            }
            attach_next = false;
        }
        parts.push(rendered);
    }
    parts.join(" ")
}

fn push_attached(parts: &mut Vec<String>, prefix: &str, attach_next: &mut bool) {
    if *attach_next {
        if let Some(last) = parts.last_mut() {
            last.push_str(prefix);
            return;
        }
    }
    parts.push(prefix.to_string());
    *attach_next = true;
}
