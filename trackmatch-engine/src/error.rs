//! Engine error taxonomy
//!
//! Recoverability is part of each variant's contract:
//! - `Embedding` and `IndexQuery` are recoverable per segment; the affected
//!   segment contributes an empty evidence slot and the query continues.
//! - `UnsupportedIncrementalAdd` is structural; the caller must fall back to
//!   a full rebuild.
//! - `CacheIo` is logged and swallowed at the cache boundary (treated as a
//!   miss); it only surfaces from operations whose sole purpose is cache
//!   maintenance.
//! - `Configuration` and `DimensionMismatch` are fatal and fail the whole
//!   operation before any work starts.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the retrieval engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Embedding inference failed for a segment (recoverable per segment)
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// ANN backend failure (recoverable per segment)
    #[error("Index query failed: {0}")]
    IndexQuery(String),

    /// The index kind cannot append vectors post-build
    #[error("Incremental add unsupported: {0}")]
    UnsupportedIncrementalAdd(String),

    /// Cache read/write failure (treated as a miss by callers)
    #[error("Cache IO error: {0}")]
    CacheIo(String),

    /// Malformed model/index/query configuration (fatal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Vector dimension does not match the index dimension (fatal)
    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// I/O operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted index body or sidecar could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Whether the error is isolated to a single segment
    pub fn is_per_segment(&self) -> bool {
        matches!(self, EngineError::Embedding(_) | EngineError::IndexQuery(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_segment_classification() {
        assert!(EngineError::Embedding("x".into()).is_per_segment());
        assert!(EngineError::IndexQuery("x".into()).is_per_segment());
        assert!(!EngineError::Configuration("x".into()).is_per_segment());
        assert!(!EngineError::UnsupportedIncrementalAdd("x".into()).is_per_segment());
    }

    #[test]
    fn test_display_includes_dimensions() {
        let e = EngineError::DimensionMismatch {
            expected: 128,
            actual: 64,
        };
        let msg = e.to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("64"));
    }
}
