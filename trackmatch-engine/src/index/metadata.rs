//! Persisted index sidecar metadata
//!
//! The sidecar travels next to the index body and is the authority on the
//! body's interpretation. `ids` must stay in lock-step (same length, same
//! order) with the body's internal vector ordering; every append extends
//! both in the same order.

use crate::config::{IndexKind, MetricType};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// JSON sidecar persisted alongside the index body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Ordered segment keys; position i addresses the body's vector i
    pub ids: Vec<String>,
    pub dimension: usize,
    pub index_type: IndexKind,
    /// Declared metric; older sidecars may omit it
    #[serde(default)]
    pub metric: Option<MetricType>,
    pub num_vectors: usize,
    /// Build parameters, opaque to readers
    #[serde(default)]
    pub build_config: Option<serde_json::Value>,
    /// Arbitrary per-file side tables, opaque to the engine
    #[serde(default)]
    pub auxiliary_metadata: Option<serde_json::Value>,
}

impl IndexMetadata {
    /// Resolve the similarity metric for query-time scoring
    ///
    /// The declared metric wins. When the sidecar is silent the documented
    /// default build path (inner product) applies; the fallback is logged
    /// so incomplete sidecars are visible.
    pub fn resolve_metric(&self) -> MetricType {
        match self.metric {
            Some(metric) => metric,
            None => {
                tracing::warn!(
                    index_type = ?self.index_type,
                    "Sidecar declares no metric, assuming inner product"
                );
                MetricType::InnerProduct
            }
        }
    }

    /// Check the lock-step invariant against a body of `body_len` vectors
    pub fn check_lock_step(&self, body_len: usize) -> Result<()> {
        if self.ids.len() != body_len || self.num_vectors != body_len {
            return Err(EngineError::Serialization(format!(
                "sidecar/body mismatch: {} ids, num_vectors {}, body holds {}",
                self.ids.len(),
                self.num_vectors,
                body_len
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
