//! Query request/response contract
//!
//! Consumed by the (out-of-scope) API layer. The engine receives decoded
//! PCM; it never opens audio containers itself.

use crate::config::QueryConfig;
use crate::models::results::SegmentQueryResult;
use crate::models::AggregatedCandidate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Decoded mono PCM handed to the engine by the decode collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Buffer duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Declared transform family of the query clip
///
/// Structure-altering transforms (pitch, tempo, speed, remix) need a much
/// deeper search than spectral ones; the policy keys off this split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Unknown,
    Equalization,
    Codec,
    NoiseOverlay,
    Reverb,
    Lowpass,
    Excerpt,
    PitchShift,
    TimeStretch,
    SpeedChange,
    Remix,
}

impl TransformKind {
    /// Whether this transform family warrants the deep-search depth band
    pub fn is_deep_search(&self) -> bool {
        matches!(
            self,
            TransformKind::PitchShift
                | TransformKind::TimeStretch
                | TransformKind::SpeedChange
                | TransformKind::Remix
        )
    }
}

/// How strongly the clip was distorted relative to its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Mild,
    #[default]
    Moderate,
    Severe,
}

/// Declared transform hint attached to a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TransformHint {
    #[serde(default)]
    pub kind: TransformKind,
    #[serde(default)]
    pub severity: Severity,
}

/// One identification query
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Id under which the query clip is known to the caller
    pub file_id: String,
    /// Decoded mono PCM of the clip
    pub audio: AudioBuffer,
    /// On-disk path of the clip, enables the embedding cache
    pub file_path: Option<PathBuf>,
    /// Declared transform type/severity
    pub transform_hint: Option<TransformHint>,
    /// Ground-truth track id; evaluation mode only
    pub expected_id: Option<String>,
    /// Per-query configuration override
    pub config_override: Option<QueryConfig>,
}

impl QueryRequest {
    pub fn new(file_id: impl Into<String>, audio: AudioBuffer) -> Self {
        Self {
            file_id: file_id.into(),
            audio,
            file_path: None,
            transform_hint: None,
            expected_id: None,
            config_override: None,
        }
    }

    pub fn with_transform_hint(mut self, hint: TransformHint) -> Self {
        self.transform_hint = Some(hint);
        self
    }

    pub fn with_file_path(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_expected_id(mut self, expected: impl Into<String>) -> Self {
        self.expected_id = Some(expected.into());
        self
    }

    pub fn with_config_override(mut self, config: QueryConfig) -> Self {
        self.config_override = Some(config);
        self
    }
}

/// Diagnostic metadata attached to each response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Unique id of this query run
    pub query_id: Uuid,
    /// Scale lengths actually queried, in execution order
    pub scales_used: Vec<f32>,
    /// Search depth used for the segment queries
    pub topk: usize,
    /// Total segments cut across all scales
    pub segments_total: usize,
    /// Segments that embedded successfully and returned hits
    pub segments_matched: usize,
    /// Whether the executor short-circuited after the first scale
    pub early_terminated: bool,
    /// Set when no segment produced usable evidence
    pub no_evidence: bool,
}

/// Ranked identification verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Whole-track candidates, best first
    pub top_candidates: Vec<AggregatedCandidate>,
    /// Per-segment evidence the verdict was fused from
    pub segment_results: Vec<SegmentQueryResult>,
    /// End-to-end engine latency
    pub latency_ms: u64,
    pub metadata: QueryMetadata,
}

impl QueryResponse {
    /// Best candidate, if any evidence existed
    pub fn best(&self) -> Option<&AggregatedCandidate> {
        self.top_candidates.first()
    }
}
