//! Aggregated whole-track candidates

use serde::{Deserialize, Serialize};

/// One whole-track candidate after evidence fusion
///
/// Created fresh per query; the ranked list is the terminal output of the
/// engine and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCandidate {
    /// Source track id recovered from segment keys
    pub file_id: String,
    /// Weighted combination of all evidence signals, in [0, 1]
    pub combined_score: f32,
    /// Similarity²-and-scale-weighted mean similarity
    pub mean_similarity: f32,
    /// Segments where this track was the rank-1 hit
    pub rank_1_count: usize,
    /// Segments where this track appeared in the top 5
    pub rank_5_count: usize,
    /// Segments where this track appeared anywhere in the top-K
    pub match_count: usize,
    /// Consecutive-agreement score in [0, 1]
    pub temporal_score: f32,
    /// Verdict confidence in [0, 1]
    pub confidence: f32,
    /// Blend of similarity strength and coverage, used by confidence
    pub quality_score: f32,
    /// Dense rank, 1-based
    pub rank: usize,
}
