//! Vector index over unit-normalized embeddings
//!
//! Wraps one of three backends (flat scan, HNSW graph, IVF lists) behind a
//! single build/add/query surface. The sidecar metadata's ordered key list
//! is kept in lock-step with the body's internal ordering on every append;
//! that invariant is what makes segment hits addressable back to tracks.
//!
//! Cosine similarity is realized as inner product over L2-normalized
//! vectors; normalization happens on the way in (build/add) and on the way
//! through (query) whenever the metric demands it.

pub mod flat;
pub mod hnsw;
pub mod ivf;
pub mod metadata;

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
pub use ivf::IvfIndex;
pub use metadata::IndexMetadata;

use crate::config::{IndexConfig, IndexKind, MetricType};
use crate::error::{EngineError, Result};
use crate::models::{file_id_from_segment_key, SegmentHit};
use crate::utils::vector::{is_unit_norm, normalize};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const BODY_FILE: &str = "index.bin";
const SIDECAR_FILE: &str = "index.meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IndexBackend {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
    Ivf(IvfIndex),
}

impl IndexBackend {
    fn len(&self) -> usize {
        match self {
            IndexBackend::Flat(index) => index.len(),
            IndexBackend::Hnsw(index) => index.len(),
            IndexBackend::Ivf(index) => index.len(),
        }
    }

    fn kind(&self) -> IndexKind {
        match self {
            IndexBackend::Flat(_) => IndexKind::Flat,
            IndexBackend::Hnsw(_) => IndexKind::Hnsw,
            IndexBackend::Ivf(_) => IndexKind::Ivf,
        }
    }

    fn search(&self, query: &[f32], k: usize, ef: usize, metric: MetricType) -> Vec<(u32, f32)> {
        match self {
            IndexBackend::Flat(index) => index.search(query, k, metric),
            IndexBackend::Hnsw(index) => index.search(query, k, ef, metric),
            IndexBackend::Ivf(index) => index.search(query, k, metric),
        }
    }
}

/// On-disk form of the index body
#[derive(Serialize, Deserialize)]
struct PersistedBody {
    backend: IndexBackend,
    ef_search: usize,
}

/// Built vector index plus its sidecar metadata
pub struct VectorIndex {
    backend: IndexBackend,
    metadata: IndexMetadata,
    metric: MetricType,
    ef_search: usize,
}

impl VectorIndex {
    /// Build an index from vectors and their segment keys
    ///
    /// Fatal on malformed configuration, length/dimension mismatches,
    /// duplicate or malformed keys, and zero vectors.
    pub fn build(vectors: &[Vec<f32>], keys: &[String], config: &IndexConfig) -> Result<Self> {
        config.validate()?;

        if vectors.len() != keys.len() {
            return Err(EngineError::Configuration(format!(
                "{} vectors but {} keys",
                vectors.len(),
                keys.len()
            )));
        }
        validate_keys(keys, None)?;

        let prepared = prepare_vectors(vectors, config.dimension, config.metric)?;

        let backend = match config.kind {
            IndexKind::Flat => {
                let mut index = FlatIndex::new(config.dimension);
                for v in &prepared {
                    index.push(v);
                }
                IndexBackend::Flat(index)
            }
            IndexKind::Hnsw => {
                let mut index =
                    HnswIndex::new(config.dimension, config.hnsw.m, config.hnsw.ef_construction);
                for v in &prepared {
                    index.insert(v, config.metric);
                }
                IndexBackend::Hnsw(index)
            }
            IndexKind::Ivf => {
                let mut index =
                    IvfIndex::new(config.dimension, config.ivf.nlist, config.ivf.nprobe);
                index.train_and_build(&prepared, config.metric, config.ivf.train_iterations);
                IndexBackend::Ivf(index)
            }
        };

        let build_config = serde_json::json!({
            "hnsw": config.hnsw,
            "ivf": config.ivf,
        });

        let metadata = IndexMetadata {
            ids: keys.to_vec(),
            dimension: config.dimension,
            index_type: config.kind,
            metric: Some(config.metric),
            num_vectors: prepared.len(),
            build_config: Some(build_config),
            auxiliary_metadata: None,
        };

        tracing::info!(
            kind = ?config.kind,
            vectors = prepared.len(),
            dimension = config.dimension,
            "Built vector index"
        );

        Ok(Self {
            backend,
            metadata,
            metric: config.metric,
            ef_search: config.hnsw.ef_search,
        })
    }

    /// Append vectors, extending the sidecar key list in the same order
    ///
    /// Structural failure (`UnsupportedIncrementalAdd`) leaves the index
    /// untouched; the caller falls back to a full rebuild.
    pub fn add(&mut self, vectors: &[Vec<f32>], keys: &[String]) -> Result<()> {
        if vectors.len() != keys.len() {
            return Err(EngineError::Configuration(format!(
                "{} vectors but {} keys",
                vectors.len(),
                keys.len()
            )));
        }
        let existing: HashSet<&str> = self.metadata.ids.iter().map(|s| s.as_str()).collect();
        validate_keys(keys, Some(&existing))?;

        // Structural check before any mutation
        if let IndexBackend::Ivf(ivf) = &self.backend {
            if !ivf.is_trained() {
                return Err(EngineError::UnsupportedIncrementalAdd(
                    "IVF quantizer is not trained; rebuild the index".to_string(),
                ));
            }
        }

        let prepared = prepare_vectors(vectors, self.metadata.dimension, self.metric)?;

        for (vector, key) in prepared.iter().zip(keys.iter()) {
            match &mut self.backend {
                IndexBackend::Flat(index) => index.push(vector),
                IndexBackend::Hnsw(index) => index.insert(vector, self.metric),
                IndexBackend::Ivf(index) => index.add(vector, self.metric)?,
            }
            // Same append order as the body, by construction
            self.metadata.ids.push(key.clone());
        }
        self.metadata.num_vectors = self.backend.len();

        tracing::debug!(
            added = prepared.len(),
            total = self.metadata.num_vectors,
            "Appended vectors to index"
        );
        Ok(())
    }

    /// Top-K query for one vector
    pub fn query(&self, vector: &[f32], topk: usize) -> Result<Vec<SegmentHit>> {
        if vector.len() != self.metadata.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.metadata.dimension,
                actual: vector.len(),
            });
        }

        let query = if self.metric.requires_normalization() && !is_unit_norm(vector) {
            let mut owned = vector.to_vec();
            if !normalize(&mut owned) {
                return Err(EngineError::IndexQuery(
                    "query vector has zero norm".to_string(),
                ));
            }
            owned
        } else {
            vector.to_vec()
        };

        // Graph search depth must cover the requested K
        let ef = self.ef_search.max(topk);
        let raw = self.backend.search(&query, topk, ef, self.metric);

        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(i, (id, dist))| {
                let raw_score = match self.metric {
                    MetricType::InnerProduct => 1.0 - dist,
                    MetricType::L2 => dist,
                };
                SegmentHit {
                    rank: i + 1,
                    segment_key: self.metadata.ids[id as usize].clone(),
                    raw_score,
                    similarity: self.metric.similarity(raw_score),
                }
            })
            .collect())
    }

    /// Top-K query for a batch; failures stay isolated per slot
    pub fn query_batch(&self, vectors: &[Vec<f32>], topk: usize) -> Vec<Result<Vec<SegmentHit>>> {
        vectors.iter().map(|v| self.query(v, topk)).collect()
    }

    /// Number of indexed vectors
    pub fn size(&self) -> usize {
        self.backend.len()
    }

    pub fn kind(&self) -> IndexKind {
        self.backend.kind()
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Set the base graph search depth (raised to top-K per query)
    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.ef_search = ef_search.max(1);
    }

    /// Distinct file ids currently indexed
    pub fn indexed_file_ids(&self) -> HashSet<String> {
        self.metadata
            .ids
            .iter()
            .filter_map(|key| file_id_from_segment_key(key))
            .map(|id| id.to_string())
            .collect()
    }

    /// Persist body (bincode) and sidecar (JSON) under `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let body = PersistedBody {
            backend: self.backend.clone(),
            ef_search: self.ef_search,
        };
        let bytes = bincode::serialize(&body)?;
        std::fs::write(dir.join(BODY_FILE), bytes)?;
        self.metadata.save(&dir.join(SIDECAR_FILE))?;
        tracing::info!(
            dir = %dir.display(),
            vectors = self.metadata.num_vectors,
            "Persisted vector index"
        );
        Ok(())
    }

    /// Load body + sidecar from `dir`, verifying the lock-step invariant
    pub fn load(dir: &Path) -> Result<Self> {
        let metadata = IndexMetadata::load(&dir.join(SIDECAR_FILE))?;
        let bytes = std::fs::read(dir.join(BODY_FILE))?;
        let body: PersistedBody = bincode::deserialize(&bytes)?;
        metadata.check_lock_step(body.backend.len())?;

        let metric = metadata.resolve_metric();
        Ok(Self {
            backend: body.backend,
            metadata,
            metric,
            ef_search: body.ef_search,
        })
    }
}

/// Check dimensions, enforce the unit-norm invariant where the metric
/// demands it, and reject zero vectors
fn prepare_vectors(
    vectors: &[Vec<f32>],
    dimension: usize,
    metric: MetricType,
) -> Result<Vec<Vec<f32>>> {
    let mut prepared = Vec::with_capacity(vectors.len());
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dimension {
            return Err(EngineError::DimensionMismatch {
                expected: dimension,
                actual: v.len(),
            });
        }
        let mut owned = v.clone();
        if metric.requires_normalization() && !is_unit_norm(&owned) && !normalize(&mut owned) {
            return Err(EngineError::Configuration(format!(
                "vector at position {} has zero norm",
                i
            )));
        }
        prepared.push(owned);
    }
    Ok(prepared)
}

/// Segment-key well-formedness, uniqueness within the batch, and (when
/// given) uniqueness against the existing key set
fn validate_keys(keys: &[String], existing: Option<&HashSet<&str>>) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(keys.len());
    for key in keys {
        let Some(file_id) = file_id_from_segment_key(key) else {
            return Err(EngineError::Configuration(format!(
                "\"{}\" is not a segment key",
                key
            )));
        };
        if file_id.is_empty() {
            return Err(EngineError::Configuration(format!(
                "segment key \"{}\" has an empty file id",
                key
            )));
        }
        if !seen.insert(key.as_str()) {
            return Err(EngineError::Configuration(format!(
                "duplicate segment key \"{}\"",
                key
            )));
        }
        if let Some(existing) = existing {
            if existing.contains(key.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "segment key \"{}\" already indexed",
                    key
                )));
            }
        }
    }
    Ok(())
}
