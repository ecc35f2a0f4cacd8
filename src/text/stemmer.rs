//! Porter-style suffix stripping with domain overrides.
//!
//! The rule set is the classic Porter cascade restricted to the suffixes that
//! actually occur in knowledge-base prose; domain words that the general rules
//! would mangle are short-circuited through [`crate::domain::STEM_OVERRIDES`].
//! Results are memoized behind a bounded LRU map.

use crate::domain::STEM_OVERRIDES;
use lru::LruCache;
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const MEMO_CAPACITY: usize = 10_000;

static STEM_MEMO: Lazy<Mutex<LruCache<String, String>>> =
    Lazy::new(|| Mutex::new(LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap())));

/// Stem a lower-cased word. Non-alphabetic input is returned unchanged.
pub fn stem(word: &str) -> String {
    if word.len() < 3 || !word.bytes().all(|b| b.is_ascii_lowercase()) {
        return word.to_string();
    }
    if let Some(stemmed) = STEM_OVERRIDES.get(word) {
        return (*stemmed).to_string();
    }
    if let Ok(mut memo) = STEM_MEMO.lock() {
        if let Some(hit) = memo.get(word) {
            return hit.clone();
        }
    }
    let result = stem_uncached(word);
    if let Ok(mut memo) = STEM_MEMO.lock() {
        memo.put(word.to_string(), result.clone());
    }
    result
}

fn stem_uncached(word: &str) -> String {
    let mut w = word.to_string();
    w = step1a(w);
    w = step1b(w);
    w = step2(w);
    w = step3(w);
    w = step4(w);
    w = step5a(w);
    step5b(w)
}

fn is_vowel(word: &[u8], i: usize) -> bool {
    match word[i] {
        b'a' | b'e' | b'i' | b'o' | b'u' => true,
        b'y' => i > 0 && !is_vowel(word, i - 1),
        _ => false,
    }
}

/// Number of vowel→consonant transitions (the Porter "measure").
fn measure(word: &str) -> usize {
    let bytes = word.as_bytes();
    let mut m = 0;
    let mut prev_vowel = false;
    for i in 0..bytes.len() {
        let vowel = is_vowel(bytes, i);
        if prev_vowel && !vowel {
            m += 1;
        }
        prev_vowel = vowel;
    }
    m
}

fn contains_vowel(word: &str) -> bool {
    let bytes = word.as_bytes();
    (0..bytes.len()).any(|i| is_vowel(bytes, i))
}

fn ends_double_consonant(word: &str) -> bool {
    let bytes = word.as_bytes();
    let n = bytes.len();
    n >= 2 && bytes[n - 1] == bytes[n - 2] && !is_vowel(bytes, n - 1)
}

/// consonant-vowel-consonant ending where the final consonant is not w, x, y.
fn ends_cvc(word: &str) -> bool {
    let bytes = word.as_bytes();
    let n = bytes.len();
    if n < 3 {
        return false;
    }
    !is_vowel(bytes, n - 3)
        && is_vowel(bytes, n - 2)
        && !is_vowel(bytes, n - 1)
        && !matches!(bytes[n - 1], b'w' | b'x' | b'y')
}

fn replace_suffix(word: &str, suffix: &str, replacement: &str) -> String {
    let stem_len = word.len() - suffix.len();
    let mut out = String::with_capacity(stem_len + replacement.len());
    out.push_str(&word[..stem_len]);
    out.push_str(replacement);
    out
}

/// Plurals plus `-ed`/`-ing` undoing with the vowel check.
fn step1a(word: String) -> String {
    let w = if let Some(stem) = word.strip_suffix("sses") {
        format!("{stem}ss")
    } else if let Some(stem) = word.strip_suffix("ies") {
        format!("{stem}i")
    } else if word.ends_with("ss") {
        word
    } else if let Some(stem) = word.strip_suffix('s') {
        if stem.len() > 1 {
            stem.to_string()
        } else {
            word
        }
    } else {
        word
    };

    if let Some(stem) = w.strip_suffix("eed") {
        if measure(stem) > 0 {
            return format!("{stem}ee");
        }
        return w;
    }
    if let Some(stem) = w.strip_suffix("ed") {
        if contains_vowel(stem) {
            return fixup_after_strip(stem.to_string());
        }
        return w;
    }
    if let Some(stem) = w.strip_suffix("ing") {
        if contains_vowel(stem) {
            return fixup_after_strip(stem.to_string());
        }
        return w;
    }
    w
}

/// After stripping `-ed`/`-ing`: restore a trailing `e` where the suffix was
/// part of the stem (`-at`, `-bl`, `-iz`), undo doubled consonants, and close
/// short CVC stems.
fn fixup_after_strip(stem: String) -> String {
    if stem.ends_with("at") || stem.ends_with("bl") || stem.ends_with("iz") {
        return format!("{stem}e");
    }
    if ends_double_consonant(&stem) && !matches!(stem.as_bytes()[stem.len() - 1], b'l' | b's' | b'z')
    {
        return stem[..stem.len() - 1].to_string();
    }
    if measure(&stem) == 1 && ends_cvc(&stem) {
        return format!("{stem}e");
    }
    stem
}

/// Terminal `y` becomes `i` when preceded by a consonant.
fn step1b(word: String) -> String {
    let bytes = word.as_bytes();
    let n = bytes.len();
    if n > 2 && bytes[n - 1] == b'y' && !is_vowel(bytes, n - 2) {
        return replace_suffix(&word, "y", "i");
    }
    word
}

/// Longest-match-first; replacement applies when the remaining stem has
/// measure > 0.
const STEP2_RULES: [(&str, &str); 16] = [
    ("ization", "ize"),
    ("iveness", "ive"),
    ("fulness", "ful"),
    ("ousness", "ous"),
    ("ational", "ate"),
    ("tional", "tion"),
    ("biliti", "ble"),
    ("ation", "ate"),
    ("alism", "al"),
    ("aliti", "al"),
    ("iviti", "ive"),
    ("enci", "ence"),
    ("anci", "ance"),
    ("izer", "ize"),
    ("ator", "ate"),
    ("alli", "al"),
];

fn step2(word: String) -> String {
    for (suffix, replacement) in STEP2_RULES {
        if let Some(stem) = word.strip_suffix(suffix) {
            if measure(stem) > 0 {
                return format!("{stem}{replacement}");
            }
            return word;
        }
    }
    word
}

const STEP3_RULES: [(&str, &str); 7] = [
    ("icate", "ic"),
    ("ative", ""),
    ("alize", "al"),
    ("iciti", "ic"),
    ("ical", "ic"),
    ("ful", ""),
    ("ness", ""),
];

fn step3(word: String) -> String {
    for (suffix, replacement) in STEP3_RULES {
        if let Some(stem) = word.strip_suffix(suffix) {
            if measure(stem) > 0 {
                return format!("{stem}{replacement}");
            }
            return word;
        }
    }
    word
}

/// Bare suffix removal when measure > 1; `-ion` additionally requires a
/// preceding `s` or `t`.
const STEP4_SUFFIXES: [&str; 19] = [
    "ement", "ance", "ence", "able", "ible", "ment", "ent", "ant", "ion", "ism", "ate", "iti",
    "ous", "ive", "ize", "al", "ic", "ou", "er",
];

fn step4(word: String) -> String {
    for suffix in STEP4_SUFFIXES {
        if let Some(stem) = word.strip_suffix(suffix) {
            if suffix == "ion" && !(stem.ends_with('s') || stem.ends_with('t')) {
                return word;
            }
            if measure(stem) > 1 {
                return stem.to_string();
            }
            return word;
        }
    }
    word
}

/// Drop a terminal `e` when the measure allows it.
fn step5a(word: String) -> String {
    if let Some(stem) = word.strip_suffix('e') {
        let m = measure(stem);
        if m > 1 || (m == 1 && !ends_cvc(stem)) {
            return stem.to_string();
        }
    }
    word
}

/// `-ll` collapses to `-l` when measure > 1.
fn step5b(word: String) -> String {
    if measure(&word) > 1 && word.ends_with("ll") {
        return word[..word.len() - 1].to_string();
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plurals() {
        assert_eq!(stem("caresses"), "caress");
        assert_eq!(stem("ponies"), "poni");
        assert_eq!(stem("errors"), "error");
        assert_eq!(stem("class"), "class");
    }

    #[test]
    fn ed_and_ing() {
        assert_eq!(stem("plastered"), "plaster");
        assert_eq!(stem("motoring"), "motor");
        assert_eq!(stem("failed"), "fail");
        assert_eq!(stem("sing"), "sing");
        assert_eq!(stem("controlling"), "control");
        assert_eq!(stem("sized"), "size");
    }

    #[test]
    fn y_to_i() {
        assert_eq!(stem("happy"), "happi");
        assert_eq!(stem("utility"), "util");
    }

    #[test]
    fn suffix_mappings() {
        assert_eq!(stem("relational"), "relate");
        assert_eq!(stem("hopefulness"), "hope");
        assert_eq!(stem("operator"), "oper");
        // Inflected forms of the same word collapse to one index term.
        assert_eq!(stem("conditional"), stem("condition"));
        assert_eq!(stem("initialization"), stem("initialize"));
    }

    #[test]
    fn bare_removals() {
        assert_eq!(stem("adjustable"), "adjust");
        assert_eq!(stem("adoption"), "adopt");
        assert_eq!(stem("effective"), "effect");
        assert_eq!(stem("goodness"), "good");
    }

    #[test]
    fn e_handling() {
        assert_eq!(stem("rate"), "rate");
        assert_eq!(stem("cease"), "ceas");
    }

    #[test]
    fn domain_overrides_win() {
        assert_eq!(stem("abends"), "abend");
        assert_eq!(stem("abending"), "abend");
        assert_eq!(stem("indices"), "index");
        assert_eq!(stem("datasets"), "dataset");
    }

    #[test]
    fn short_or_non_alpha_input_unchanged() {
        assert_eq!(stem("db"), "db");
        assert_eq!(stem("s0c7"), "s0c7");
        assert_eq!(stem("comp-3"), "comp-3");
    }

    #[test]
    fn memoized_results_are_stable() {
        let first = stem("searching");
        let second = stem("searching");
        assert_eq!(first, second);
        assert_eq!(first, "search");
    }
}
