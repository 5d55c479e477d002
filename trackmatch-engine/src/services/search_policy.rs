//! Transform-aware search depth and multi-scale policy
//!
//! One canonical table maps the declared transform hint to an ANN search
//! depth: structure-altering transforms (pitch, tempo, speed, remix) get
//! the deep band, everything else the ordinary band, scaled by severity
//! and clamped. Multi-scale activation after the first scale compares an
//! estimated Recall@5 against a severity-specific requirement. That
//! estimate needs a ground-truth id, so it is only available in evaluation
//! mode; production queries fall back to the fixed table.

use crate::models::{file_id_from_segment_key, SegmentQueryResult, Severity, TransformHint};
use serde::{Deserialize, Serialize};

/// Canonical depth table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchPolicy {
    /// Base depth for structure-altering transforms
    #[serde(default = "default_deep_base")]
    pub deep_base: usize,
    /// Base depth for ordinary transforms (and no hint at all)
    #[serde(default = "default_ordinary_base")]
    pub ordinary_base: usize,
    /// Depth clamp, low end
    #[serde(default = "default_min_depth")]
    pub min_depth: usize,
    /// Depth clamp, high end
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_deep_base() -> usize {
    120
}
fn default_ordinary_base() -> usize {
    24
}
fn default_min_depth() -> usize {
    15
}
fn default_max_depth() -> usize {
    250
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            deep_base: default_deep_base(),
            ordinary_base: default_ordinary_base(),
            min_depth: default_min_depth(),
            max_depth: default_max_depth(),
        }
    }
}

/// Severity scaling of the base depth
pub fn severity_multiplier(severity: Severity) -> f32 {
    match severity {
        Severity::Mild => 1.0,
        Severity::Moderate => 1.1,
        Severity::Severe => 1.3,
    }
}

/// Recall@5 requirement and activation threshold per severity
///
/// Mild pins its requirement at 0.95 and activates below 95% of it.
pub fn recall_requirement(severity: Severity) -> (f32, f32) {
    match severity {
        Severity::Severe => (0.70, 0.75),
        Severity::Moderate => (0.85, 0.88),
        Severity::Mild => (0.95, 0.95 * 0.95),
    }
}

impl SearchPolicy {
    /// Search depth for a declared hint (fixed table, production mode)
    pub fn search_depth(&self, hint: Option<TransformHint>) -> usize {
        let (base, severity) = match hint {
            Some(hint) if hint.kind.is_deep_search() => (self.deep_base, hint.severity),
            Some(hint) => (self.ordinary_base, hint.severity),
            None => (self.ordinary_base, Severity::default()),
        };
        let depth = (base as f32 * severity_multiplier(severity)).round() as usize;
        depth.clamp(self.min_depth, self.max_depth)
    }

    /// Default multi-scale activation when no recall estimate is available
    pub fn multi_scale_default(&self, hint: Option<TransformHint>) -> bool {
        match hint {
            Some(hint) => hint.kind.is_deep_search() || hint.severity != Severity::Mild,
            None => true,
        }
    }

    /// Evaluation-mode activation: add more scales when the first-scale
    /// recall estimate falls short of the severity's threshold
    pub fn should_activate_multi_scale(&self, severity: Severity, estimated_recall: f32) -> bool {
        let (requirement, activate_below) = recall_requirement(severity);
        let activate = estimated_recall < activate_below;
        tracing::debug!(
            ?severity,
            estimated_recall,
            requirement,
            activate_below,
            activate,
            "Multi-scale activation decision"
        );
        activate
    }
}

/// Estimated Recall@5: fraction of segments whose top-5 contains the
/// expected file
///
/// Failed segments count against the estimate: a query that lost half its
/// workers has genuinely lower recall.
pub fn estimate_recall_at_5(results: &[SegmentQueryResult], expected_id: &str) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let hits = results
        .iter()
        .filter(|result| {
            result
                .hits
                .iter()
                .take(5)
                .any(|hit| file_id_from_segment_key(&hit.segment_key) == Some(expected_id))
        })
        .count();
    hits as f32 / results.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{segment_key, SegmentHit, TransformKind};

    fn hint(kind: TransformKind, severity: Severity) -> Option<TransformHint> {
        Some(TransformHint { kind, severity })
    }

    #[test]
    fn test_depth_table_bands() {
        let policy = SearchPolicy::default();

        // Ordinary band: 15..=40 across severities
        for severity in [Severity::Mild, Severity::Moderate, Severity::Severe] {
            let depth = policy.search_depth(hint(TransformKind::Equalization, severity));
            assert!((15..=40).contains(&depth), "ordinary depth {} out of band", depth);
        }

        // Deep band: 80..=250 across severities
        for severity in [Severity::Mild, Severity::Moderate, Severity::Severe] {
            let depth = policy.search_depth(hint(TransformKind::PitchShift, severity));
            assert!((80..=250).contains(&depth), "deep depth {} out of band", depth);
        }
    }

    #[test]
    fn test_severity_scales_depth() {
        let policy = SearchPolicy::default();
        let mild = policy.search_depth(hint(TransformKind::Remix, Severity::Mild));
        let moderate = policy.search_depth(hint(TransformKind::Remix, Severity::Moderate));
        let severe = policy.search_depth(hint(TransformKind::Remix, Severity::Severe));
        assert!(mild < moderate && moderate < severe);
        assert_eq!(mild, 120);
        assert_eq!(severe, 156);
    }

    #[test]
    fn test_no_hint_uses_ordinary_base() {
        let policy = SearchPolicy::default();
        assert_eq!(
            policy.search_depth(None),
            policy.search_depth(hint(TransformKind::Unknown, Severity::Moderate))
        );
    }

    #[test]
    fn test_depth_clamped() {
        let policy = SearchPolicy {
            deep_base: 1000,
            ordinary_base: 1,
            ..SearchPolicy::default()
        };
        assert_eq!(policy.search_depth(hint(TransformKind::Remix, Severity::Severe)), 250);
        assert_eq!(policy.search_depth(hint(TransformKind::Codec, Severity::Mild)), 15);
    }

    #[test]
    fn test_recall_thresholds() {
        let policy = SearchPolicy::default();

        assert!(policy.should_activate_multi_scale(Severity::Severe, 0.74));
        assert!(!policy.should_activate_multi_scale(Severity::Severe, 0.76));

        assert!(policy.should_activate_multi_scale(Severity::Moderate, 0.87));
        assert!(!policy.should_activate_multi_scale(Severity::Moderate, 0.89));

        assert!(policy.should_activate_multi_scale(Severity::Mild, 0.90));
        assert!(!policy.should_activate_multi_scale(Severity::Mild, 0.91));
    }

    #[test]
    fn test_estimate_recall_at_5() {
        let results: Vec<SegmentQueryResult> = (0..4)
            .map(|i| {
                let file_id = if i < 3 { "expected" } else { "other" };
                SegmentQueryResult {
                    segment_id: segment_key("q", i),
                    segment_index: i,
                    scale_length: 5.0,
                    scale_weight: 1.0,
                    hits: vec![SegmentHit {
                        rank: 1,
                        segment_key: segment_key(file_id, i),
                        raw_score: 0.9,
                        similarity: 0.9,
                    }],
                }
            })
            .collect();

        let recall = estimate_recall_at_5(&results, "expected");
        assert!((recall - 0.75).abs() < 1e-6);
        assert_eq!(estimate_recall_at_5(&[], "expected"), 0.0);
    }

    #[test]
    fn test_recall_only_counts_top_5() {
        let hits: Vec<SegmentHit> = (0..10)
            .map(|rank| SegmentHit {
                rank: rank + 1,
                segment_key: segment_key(if rank == 7 { "expected" } else { "noise" }, rank),
                raw_score: 0.5,
                similarity: 0.5,
            })
            .collect();
        let results = vec![SegmentQueryResult {
            segment_id: segment_key("q", 0),
            segment_index: 0,
            scale_length: 5.0,
            scale_weight: 1.0,
            hits,
        }];
        // Expected file only appears at rank 8
        assert_eq!(estimate_recall_at_5(&results, "expected"), 0.0);
    }

    #[test]
    fn test_multi_scale_default() {
        let policy = SearchPolicy::default();
        assert!(policy.multi_scale_default(hint(TransformKind::Codec, Severity::Severe)));
        assert!(policy.multi_scale_default(hint(TransformKind::Remix, Severity::Mild)));
        assert!(!policy.multi_scale_default(hint(TransformKind::Codec, Severity::Mild)));
        assert!(policy.multi_scale_default(None));
    }
}
