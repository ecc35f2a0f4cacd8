//! Error taxonomy for the search core.
//!
//! Every error that crosses the crate boundary carries a stable code so the
//! transport layer can map it without string matching. Cache faults are
//! deliberately *not* part of the public failure surface: the engine recovers
//! from them locally and only logs.

/// Failures surfaced by the search engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("search engine initialization failed: {0}")]
    Init(String),

    #[error("search engine is not initialized")]
    NotInitialized,

    #[error("search engine has been shut down")]
    ShutDown,

    #[error("search timed out after {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("search execution failed: {0}")]
    Execution(String),

    #[error("cache failure: {0}")]
    Cache(String),

    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    Snapshot { expected: u32, found: u32 },
}

impl SearchError {
    /// Stable boundary code for transports and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::Init(_) => "SEARCH_INIT_ERROR",
            SearchError::NotInitialized | SearchError::ShutDown => "SEARCH_NOT_INITIALIZED",
            SearchError::Timeout { .. } => "SEARCH_TIMEOUT",
            SearchError::InvalidQuery(_) | SearchError::Execution(_) | SearchError::Snapshot { .. } => {
                "SEARCH_EXECUTION_ERROR"
            }
            SearchError::Cache(_) => "CACHE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SearchError::Init("x".into()).code(), "SEARCH_INIT_ERROR");
        assert_eq!(SearchError::NotInitialized.code(), "SEARCH_NOT_INITIALIZED");
        assert_eq!(SearchError::ShutDown.code(), "SEARCH_NOT_INITIALIZED");
        assert_eq!(SearchError::Timeout { budget_ms: 20 }.code(), "SEARCH_TIMEOUT");
        assert_eq!(SearchError::Cache("x".into()).code(), "CACHE_ERROR");
        assert_eq!(
            SearchError::Snapshot { expected: 1, found: 9 }.code(),
            "SEARCH_EXECUTION_ERROR"
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = SearchError::Timeout { budget_ms: 800 };
        assert!(err.to_string().contains("800"));
    }
}
