//! Typed engine configuration
//!
//! Every free-form knob the engine honors is an explicit field with a
//! documented default. TOML/JSON loading rejects unknown fields instead of
//! silently ignoring them. `validate()` runs before any work starts and
//! failures are fatal.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use trackmatch_common::hash::sha256_bytes;

/// Embedding model configuration
///
/// Only the fields that change the produced vectors participate in the
/// cache identity; see [`ModelConfig::config_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Output vector dimension
    pub embedding_dim: usize,
    /// Segment length fed to the model, in seconds
    pub segment_length: f32,
    /// Sample rate the model expects, in Hz
    pub sample_rate: u32,
    /// Opaque model identifier (e.g. "clap-base")
    pub model_type: String,
}

impl ModelConfig {
    /// Hash of the normalized model configuration
    ///
    /// Canonical key-value rendering so field order and float formatting
    /// cannot produce two hashes for the same configuration.
    pub fn config_hash(&self) -> String {
        let canonical = format!(
            "embedding_dim={};segment_length={:.3};sample_rate={};model_type={}",
            self.embedding_dim, self.segment_length, self.sample_rate, self.model_type
        );
        sha256_bytes(canonical.as_bytes())
    }

    /// Copy of this configuration with a different segment length
    ///
    /// Multi-scale querying caches each scale under its own identity.
    pub fn with_segment_length(&self, segment_length: f32) -> Self {
        Self {
            segment_length,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(EngineError::Configuration(
                "embedding_dim must be non-zero".to_string(),
            ));
        }
        if !self.segment_length.is_finite() || self.segment_length <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "segment_length must be positive, got {}",
                self.segment_length
            )));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::Configuration(
                "sample_rate must be non-zero".to_string(),
            ));
        }
        if self.model_type.trim().is_empty() {
            return Err(EngineError::Configuration(
                "model_type must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Similarity metric of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Inner product over unit vectors (cosine). The documented default.
    InnerProduct,
    /// Squared L2 distance
    L2,
}

impl MetricType {
    /// Derive similarity from a raw backend score
    ///
    /// Inner product scores are already similarities; L2 distances are
    /// mapped through `1/(1+d)`.
    pub fn similarity(&self, raw_score: f32) -> f32 {
        match self {
            MetricType::InnerProduct => raw_score,
            MetricType::L2 => 1.0 / (1.0 + raw_score.max(0.0)),
        }
    }

    /// Whether vectors must be unit-normalized under this metric
    pub fn requires_normalization(&self) -> bool {
        matches!(self, MetricType::InnerProduct)
    }
}

// Sidecar files written by older tooling encode the metric as a small
// integer; current files use a string. Accept both.
impl<'de> Deserialize<'de> for MetricType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(0) => Ok(MetricType::InnerProduct),
            Raw::Num(1) => Ok(MetricType::L2),
            Raw::Num(n) => Err(serde::de::Error::custom(format!(
                "unknown metric code {}",
                n
            ))),
            Raw::Text(s) => match s.to_ascii_lowercase().as_str() {
                "inner_product" | "ip" | "cosine" => Ok(MetricType::InnerProduct),
                "l2" | "euclidean" => Ok(MetricType::L2),
                other => Err(serde::de::Error::custom(format!(
                    "unknown metric \"{}\"",
                    other
                ))),
            },
        }
    }
}

/// Index structure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact scan
    Flat,
    /// Graph-based ANN
    Hnsw,
    /// Inverted lists over trained centroids
    Ivf,
}

/// HNSW build/search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HnswParams {
    /// Max neighbors per node at layers above 0 (layer 0 keeps 2M)
    #[serde(default = "default_hnsw_m")]
    pub m: usize,
    /// Beam width during construction
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Beam width during search; raised to at least top-K before every query
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

fn default_hnsw_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

/// IVF build/search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IvfParams {
    /// Number of inverted lists (k-means centroids)
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    /// Lists probed per query
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    /// k-means refinement iterations during training
    #[serde(default = "default_train_iterations")]
    pub train_iterations: usize,
}

fn default_nlist() -> usize {
    64
}
fn default_nprobe() -> usize {
    8
}
fn default_train_iterations() -> usize {
    10
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            nlist: default_nlist(),
            nprobe: default_nprobe(),
            train_iterations: default_train_iterations(),
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Vector dimension
    pub dimension: usize,
    /// Index structure
    #[serde(default = "default_index_kind")]
    pub kind: IndexKind,
    /// Similarity metric
    #[serde(default = "default_metric")]
    pub metric: MetricType,
    #[serde(default)]
    pub hnsw: HnswParams,
    #[serde(default)]
    pub ivf: IvfParams,
}

fn default_index_kind() -> IndexKind {
    IndexKind::Flat
}
fn default_metric() -> MetricType {
    MetricType::InnerProduct
}

impl IndexConfig {
    pub fn new(dimension: usize, kind: IndexKind) -> Self {
        Self {
            dimension,
            kind,
            metric: default_metric(),
            hnsw: HnswParams::default(),
            ivf: IvfParams::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(EngineError::Configuration(
                "index dimension must be non-zero".to_string(),
            ));
        }
        if self.hnsw.m < 2 {
            return Err(EngineError::Configuration(format!(
                "hnsw.m must be at least 2, got {}",
                self.hnsw.m
            )));
        }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search == 0 {
            return Err(EngineError::Configuration(
                "hnsw beam widths must be non-zero".to_string(),
            ));
        }
        if self.ivf.nlist == 0 {
            return Err(EngineError::Configuration(
                "ivf.nlist must be non-zero".to_string(),
            ));
        }
        if self.ivf.nprobe == 0 || self.ivf.nprobe > self.ivf.nlist {
            return Err(EngineError::Configuration(format!(
                "ivf.nprobe must be in 1..={}, got {}",
                self.ivf.nlist, self.ivf.nprobe
            )));
        }
        Ok(())
    }
}

/// Weights for combining per-candidate evidence into `combined_score`
///
/// The canonical defaults sum to 1.0; overridden weights are normalized
/// before use so the combined score stays in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationWeights {
    #[serde(default = "default_w_similarity")]
    pub similarity: f32,
    #[serde(default = "default_w_rank1")]
    pub rank1: f32,
    #[serde(default = "default_w_rank5")]
    pub rank5: f32,
    #[serde(default = "default_w_match")]
    pub match_count: f32,
    #[serde(default = "default_w_temporal")]
    pub temporal: f32,
}

fn default_w_similarity() -> f32 {
    0.35
}
fn default_w_rank1() -> f32 {
    0.30
}
fn default_w_rank5() -> f32 {
    0.10
}
fn default_w_match() -> f32 {
    0.10
}
fn default_w_temporal() -> f32 {
    0.15
}

impl Default for AggregationWeights {
    fn default() -> Self {
        Self {
            similarity: default_w_similarity(),
            rank1: default_w_rank1(),
            rank5: default_w_rank5(),
            match_count: default_w_match(),
            temporal: default_w_temporal(),
        }
    }
}

impl AggregationWeights {
    fn sum(&self) -> f32 {
        self.similarity + self.rank1 + self.rank5 + self.match_count + self.temporal
    }

    /// Weights scaled to sum to exactly 1.0
    pub fn normalized(&self) -> Self {
        let sum = self.sum();
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            similarity: self.similarity / sum,
            rank1: self.rank1 / sum,
            rank5: self.rank5 / sum,
            match_count: self.match_count / sum,
            temporal: self.temporal / sum,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("similarity", self.similarity),
            ("rank1", self.rank1),
            ("rank5", self.rank5),
            ("match_count", self.match_count),
            ("temporal", self.temporal),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Configuration(format!(
                    "aggregation weight {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.sum() <= 0.0 {
            return Err(EngineError::Configuration(
                "aggregation weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Early-termination thresholds checked after the first scale
///
/// A latency/recall trade-off, not a correctness requirement; disable via
/// `enabled = false`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EarlyStopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rank-1 hit ratio needed for the ratio+floor rule
    #[serde(default = "default_rank1_ratio")]
    pub rank1_ratio: f32,
    /// Max-similarity floor paired with the rank-1 ratio rule
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
    /// Max similarity that short-circuits on its own
    #[serde(default = "default_max_similarity")]
    pub max_similarity: f32,
    /// Mean similarity for the mean+ratio rule
    #[serde(default = "default_mean_similarity")]
    pub mean_similarity: f32,
    /// Rank-1 ratio paired with the mean-similarity rule
    #[serde(default = "default_mean_rank1_ratio")]
    pub mean_rank1_ratio: f32,
}

fn default_true() -> bool {
    true
}
fn default_rank1_ratio() -> f32 {
    0.8
}
fn default_confidence_floor() -> f32 {
    0.90
}
fn default_max_similarity() -> f32 {
    0.95
}
fn default_mean_similarity() -> f32 {
    0.92
}
fn default_mean_rank1_ratio() -> f32 {
    0.7
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            rank1_ratio: default_rank1_ratio(),
            confidence_floor: default_confidence_floor(),
            max_similarity: default_max_similarity(),
            mean_similarity: default_mean_similarity(),
            mean_rank1_ratio: default_mean_rank1_ratio(),
        }
    }
}

/// Per-query configuration
///
/// Immutable once a query starts; the transform policy clones and adjusts a
/// copy before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// ANN search depth per segment
    #[serde(default = "default_topk")]
    pub topk: usize,
    /// Segment lengths (seconds) queried per scale, first scale first
    #[serde(default = "default_scale_lengths")]
    pub multi_scale_lengths: Vec<f32>,
    /// Evidence weight per scale; same length as `multi_scale_lengths`
    #[serde(default = "default_scale_weights")]
    pub multi_scale_weights: Vec<f32>,
    /// Window overlap fraction in [0, 1)
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f32,
    /// Segments whose best similarity falls below this are dropped
    /// (subject to the 70% rollback guard)
    #[serde(default = "default_min_similarity")]
    pub min_similarity_threshold: f32,
    /// Fraction of best segments kept for fusion (floor of 5 segments)
    #[serde(default = "default_fusion_ratio")]
    pub top_k_fusion_ratio: f32,
    /// Weight of the temporal-consistency signal
    #[serde(default = "default_w_temporal")]
    pub temporal_consistency_weight: f32,
    /// Apply the min-similarity filter
    #[serde(default = "default_true")]
    pub use_adaptive_threshold: bool,
    /// Credit consecutive-segment agreement
    #[serde(default = "default_true")]
    pub use_temporal_consistency: bool,
    /// Evidence combination weights
    #[serde(default)]
    pub weights: AggregationWeights,
    /// Run the second-stage re-rank over the top candidates
    #[serde(default = "default_true")]
    pub use_second_stage_rerank: bool,
    /// Candidates re-examined by the second stage
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    /// Re-sort the final list by confidence × combined_score
    #[serde(default)]
    pub sort_by_confidence: bool,
    /// Drop candidates below this confidence (never drops the last one)
    #[serde(default)]
    pub min_confidence: Option<f32>,
    /// Early-termination thresholds
    #[serde(default)]
    pub early_stop: EarlyStopConfig,
}

fn default_topk() -> usize {
    24
}
fn default_scale_lengths() -> Vec<f32> {
    vec![5.0, 10.0, 3.0]
}
fn default_scale_weights() -> Vec<f32> {
    vec![1.0, 0.8, 0.6]
}
fn default_overlap_ratio() -> f32 {
    0.5
}
fn default_min_similarity() -> f32 {
    0.45
}
fn default_fusion_ratio() -> f32 {
    1.0
}
fn default_rerank_top_n() -> usize {
    5
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            topk: default_topk(),
            multi_scale_lengths: default_scale_lengths(),
            multi_scale_weights: default_scale_weights(),
            overlap_ratio: default_overlap_ratio(),
            min_similarity_threshold: default_min_similarity(),
            top_k_fusion_ratio: default_fusion_ratio(),
            temporal_consistency_weight: default_w_temporal(),
            use_adaptive_threshold: true,
            use_temporal_consistency: true,
            weights: AggregationWeights::default(),
            use_second_stage_rerank: true,
            rerank_top_n: default_rerank_top_n(),
            sort_by_confidence: false,
            min_confidence: None,
            early_stop: EarlyStopConfig::default(),
        }
    }
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topk == 0 {
            return Err(EngineError::Configuration(
                "topk must be non-zero".to_string(),
            ));
        }
        if self.multi_scale_lengths.is_empty() {
            return Err(EngineError::Configuration(
                "at least one scale length required".to_string(),
            ));
        }
        if self.multi_scale_lengths.len() != self.multi_scale_weights.len() {
            return Err(EngineError::Configuration(format!(
                "{} scale lengths but {} scale weights",
                self.multi_scale_lengths.len(),
                self.multi_scale_weights.len()
            )));
        }
        for &len in &self.multi_scale_lengths {
            if !len.is_finite() || len <= 0.0 {
                return Err(EngineError::Configuration(format!(
                    "scale lengths must be positive, got {}",
                    len
                )));
            }
        }
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(EngineError::Configuration(format!(
                "overlap_ratio must be in [0, 1), got {}",
                self.overlap_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.top_k_fusion_ratio) || self.top_k_fusion_ratio == 0.0 {
            return Err(EngineError::Configuration(format!(
                "top_k_fusion_ratio must be in (0, 1], got {}",
                self.top_k_fusion_ratio
            )));
        }
        if let Some(min_conf) = self.min_confidence {
            if !(0.0..=1.0).contains(&min_conf) {
                return Err(EngineError::Configuration(format!(
                    "min_confidence must be in [0, 1], got {}",
                    min_conf
                )));
            }
        }
        self.weights.validate()?;
        Ok(())
    }
}
