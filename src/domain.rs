//! Mainframe domain knowledge loaded once and shared read-only: error-code
//! patterns, keyword sets, system names, synonym variants, and stemming
//! overrides. The text processor, query parser, fuzzy matcher, and ranking
//! engine all read from here; nothing mutates these after startup.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::HashSet;

/// Anchored patterns matched against a single upper-cased token to classify it
/// as an error code. Covers system/user abends, DB2 SQL codes, DB2/JES/IOS
/// message ids, and sort messages.
pub static TOKEN_ERROR_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        // system completion codes: S0C7, SB37, S222. At least one digit, or
        // all-hex words like SAFE would classify as codes.
        r"^S[0-9][0-9A-F]{2}$",
        r"^S[A-F][0-9][0-9A-F]$",
        r"^S[A-F]{2}[0-9]$",
        r"^U\d{4}$",              // user abend codes: U4038
        r"^SQL\d{3,5}[A-Z]?$",    // DB2 SQL codes: SQL0803N
        r"^SQLCODE-?\d+$",        // inline sqlcode references
        r"^IE[CF]\d{3}[A-Z]$",    // IEC/IEF dataset and allocation messages
        r"^IGZ\d{3}[A-Z]$",       // COBOL runtime messages
        r"^ICH\d{3}[A-Z]$",       // RACF messages
        r"^DSN[A-Z]?\d{3,4}[A-Z]?$", // DB2 subsystem messages: DSNT408I
        r"^DFS\d{3,4}[A-Z]?$",    // IMS messages
        r"^WER\d{3}[A-Z]$",       // sort product messages
        r"^VSAM\d{2}$",           // condensed VSAM status refs
    ])
    .expect("token error patterns are valid")
});

/// CICS abend codes that are plain words rather than numbered messages.
pub static CICS_ABEND_CODES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["ASRA", "ASRB", "AICA", "AKCP", "APCT", "ABM0", "AEI0", "AEY9", "ATCH", "AZTS"]
        .into_iter()
        .collect()
});

/// Free-text patterns for [`crate::text::TextProcessor::extract_special`],
/// applied to raw (unsplit) text.
pub static TEXT_ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bS[0-9][0-9A-F]{2}\b",
        r"\bS[A-F][0-9][0-9A-F]\b",
        r"\bS[A-F]{2}[0-9]\b",
        r"\bU\d{4}\b",
        r"\bSQL\d{3,5}[A-Z]?\b",
        r"\bSQLCODE\s*-?\d+\b",
        r"\bIE[CF]\d{3}[A-Z]\b",
        r"\bVSAM\s+STATUS\s+\d{2}\b",
        r"\bSTATUS\s+CODE\s+\d{2}\b",
        r"\bWER\d{3}[A-Z]\b",
        r"\bDFS\d{3,4}[A-Z]?\b",
        r"\bDSN[A-Z]?\d{3,4}[A-Z]?\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("text error pattern is valid"))
    .collect()
});

/// Dataset-name shape: qualified identifiers like SYS1.PROCLIB or
/// PROD.PAYROLL.MASTER(MEMBER).
pub static DATASET_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z#$@][A-Z0-9#$@]{0,7}(?:\.[A-Z#$@][A-Z0-9#$@]{0,7}){1,21}(?:\([A-Z#$@][A-Z0-9#$@]{0,7}\))?\b")
        .expect("dataset name pattern is valid")
});

/// Lower-cased domain keywords that classify a token as `code` and feed the
/// custom ranking multiplier.
pub static MAINFRAME_TERMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // JCL
        "jcl", "proc", "proclib", "sysout", "sysin", "dd", "disp", "pds", "gdg", "step",
        "jobcard", "cond", "restart",
        // VSAM and datasets
        "vsam", "ksds", "esds", "rrds", "dataset", "dsn", "idcams", "repro", "listcat",
        "define", "cluster", "aix",
        // COBOL
        "cobol", "copybook", "picture", "comp", "comp-3", "occurs", "redefines",
        "working-storage", "linkage", "perform", "paragraph",
        // DB2
        "db2", "sqlcode", "sqlstate", "tablespace", "bind", "plan", "package", "dbrm",
        "runstats", "reorg", "deadlock",
        // subsystems and utilities
        "cics", "ims", "mq", "sort", "syncsort", "dfsort", "abend", "dump", "sysudump",
        "sysabend", "spool", "checkpoint", "restow",
    ]
    .into_iter()
    .collect()
});

/// Known subsystem/product names; matching one multiplies the custom ranking
/// weight.
pub static SYSTEM_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "mvs", "zos", "z/os", "cics", "ims", "db2", "racf", "tso", "ispf", "jes2", "jes3",
        "sdsf", "vtam", "omegamon", "endevor", "changeman", "ca7", "controlm",
    ]
    .into_iter()
    .collect()
});

/// Domain synonym table for the fuzzy matcher's variant short-circuit.
pub static TERM_VARIANTS: Lazy<AHashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut map = AHashMap::new();
    map.insert("abend", vec!["error", "fail", "failure", "abort", "crash"]);
    map.insert("dsn", vec!["dataset", "name", "file"]);
    map.insert("jcl", vec!["job", "script"]);
    map.insert("vsam", vec!["file", "dataset"]);
    map.insert("db2", vec!["database", "sql"]);
    map.insert("cics", vec!["transaction", "online"]);
    map.insert("ims", vec!["database", "hierarchical"]);
    map.insert("cobol", vec!["program", "source"]);
    map.insert("batch", vec!["job", "nightly"]);
    map.insert("dump", vec!["sysudump", "diagnostic"]);
    map.insert("sort", vec!["dfsort", "syncsort"]);
    map.insert("password", vec!["credential", "logon"]);
    map
});

/// Stemming overrides applied before the suffix rules. These are domain words
/// the general rules would mangle.
pub static STEM_OVERRIDES: Lazy<AHashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = AHashMap::new();
    map.insert("abends", "abend");
    map.insert("abending", "abend");
    map.insert("abended", "abend");
    map.insert("datasets", "dataset");
    map.insert("indices", "index");
    map.insert("statuses", "status");
    map.insert("status", "status");
    map.insert("jcls", "jcl");
    map.insert("procs", "proc");
    map.insert("copybooks", "copybook");
    map.insert("tablespaces", "tablespace");
    map
});

/// True when the upper-cased token looks like a mainframe error code.
pub fn is_error_code(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    TOKEN_ERROR_PATTERNS.is_match(&upper) || CICS_ABEND_CODES.contains(upper.as_str())
}

/// True when the lower-cased token is a known domain keyword.
pub fn is_mainframe_term(token: &str) -> bool {
    MAINFRAME_TERMS.contains(token.to_ascii_lowercase().as_str())
}

/// True when the lower-cased token names a subsystem or product.
pub fn is_system_name(token: &str) -> bool {
    SYSTEM_NAMES.contains(token.to_ascii_lowercase().as_str())
}

/// Synonyms listed for a term, if any.
pub fn variants_of(term: &str) -> Option<&'static Vec<&'static str>> {
    TERM_VARIANTS.get(term.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_completion_and_user_codes() {
        assert!(is_error_code("S0C7"));
        assert!(is_error_code("s0c4"));
        assert!(is_error_code("SB37"));
        assert!(is_error_code("S222"));
        assert!(is_error_code("U4038"));
        assert!(!is_error_code("S0C77"));
        assert!(!is_error_code("SOC7")); // letter O, not a hex digit
        assert!(!is_error_code("SAFE")); // hex-only letters, no digit
    }

    #[test]
    fn recognizes_subsystem_messages() {
        assert!(is_error_code("SQL0803N"));
        assert!(is_error_code("IEF212I"));
        assert!(is_error_code("IEC141I"));
        assert!(is_error_code("DSNT408I"));
        assert!(is_error_code("ASRA"));
        assert!(!is_error_code("payroll"));
    }

    #[test]
    fn keyword_sets_are_case_insensitive() {
        assert!(is_mainframe_term("VSAM"));
        assert!(is_mainframe_term("idcams"));
        assert!(is_system_name("JES2"));
        assert!(!is_mainframe_term("banana"));
    }

    #[test]
    fn variants_are_directional_entries() {
        let abend = variants_of("ABEND").unwrap();
        assert!(abend.contains(&"error"));
        assert!(variants_of("nothing").is_none());
    }

    #[test]
    fn dataset_names_match() {
        assert!(DATASET_NAME.is_match("SYS1.PROCLIB"));
        assert!(DATASET_NAME.is_match("PROD.PAYROLL.MASTER(M1)"));
        assert!(!DATASET_NAME.is_match("lowercase.name"));
    }
}
