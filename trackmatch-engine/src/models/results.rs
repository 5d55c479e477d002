//! Per-segment query results

use serde::{Deserialize, Serialize};

/// One ANN hit for a query segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentHit {
    /// 1-based rank within this segment's result list
    pub rank: usize,
    /// Key of the matched index entry
    pub segment_key: String,
    /// Raw backend score (inner product or L2 distance)
    pub raw_score: f32,
    /// Metric-resolved similarity in [0, 1] for unit vectors
    pub similarity: f32,
}

/// Ordered top-K hits for one query segment
///
/// `segment_index` preserves the original segmentation order; the
/// aggregation stage depends on it for temporal consistency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentQueryResult {
    /// Id of the query segment (`{stem}_seg_{0000}`)
    pub segment_id: String,
    /// Position of the segment within its scale, 0-based
    pub segment_index: usize,
    /// Scale length this segment was cut at, seconds
    pub scale_length: f32,
    /// Evidence weight of the scale
    pub scale_weight: f32,
    /// Hits ordered by descending similarity; empty when the worker failed
    /// or the segment embedded to nothing
    pub hits: Vec<SegmentHit>,
}

impl SegmentQueryResult {
    /// Empty result slot for a failed or skipped segment
    pub fn empty(segment_id: String, segment_index: usize, scale_length: f32, scale_weight: f32) -> Self {
        Self {
            segment_id,
            segment_index,
            scale_length,
            scale_weight,
            hits: Vec::new(),
        }
    }

    /// Best similarity in this segment's list, if any
    pub fn top_similarity(&self) -> Option<f32> {
        self.hits.first().map(|h| h.similarity)
    }

    /// Key of the rank-1 hit, if any
    pub fn top_key(&self) -> Option<&str> {
        self.hits.first().map(|h| h.segment_key.as_str())
    }
}
