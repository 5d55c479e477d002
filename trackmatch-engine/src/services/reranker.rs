//! Second-stage re-rank and confidence estimation
//!
//! The first-stage combination is tuned for recall across many noisy
//! segments; the second stage re-examines only the head of the list with a
//! blend that rewards score stability and cross-scale agreement, then
//! splices the reordered head back in front of the remainder.
//!
//! Confidence is estimated per candidate from the score gap to its
//! runner-up, rank-1 ratio, temporal score, match ratio and quality score,
//! with a small boost for candidates the second stage touched.

use crate::models::AggregatedCandidate;
use crate::services::aggregator::{assign_dense_ranks, CandidateEvidence};
use std::collections::{HashMap, HashSet};

// Second-stage blend
const RR_SIMILARITY: f32 = 0.35;
const RR_CONSISTENCY: f32 = 0.25;
const RR_RANK1: f32 = 0.20;
const RR_COVERAGE: f32 = 0.10;
const RR_CROSS_SCALE: f32 = 0.10;

// Confidence blend
const CF_GAP: f32 = 0.25;
const CF_RANK1: f32 = 0.25;
const CF_TEMPORAL: f32 = 0.20;
const CF_MATCH: f32 = 0.15;
const CF_QUALITY: f32 = 0.15;
const CF_RERANK_BOOST: f32 = 0.10;

/// Re-rank the top `top_n` candidates in place
///
/// Returns the file ids whose position changed; confidence scoring credits
/// them later.
pub(crate) fn second_stage(
    candidates: &mut [AggregatedCandidate],
    evidence: &HashMap<String, CandidateEvidence>,
    total_segments: usize,
    scales_queried: usize,
    top_n: usize,
) -> HashSet<String> {
    let window = top_n.min(candidates.len());
    if window < 2 {
        return HashSet::new();
    }

    let order_before: Vec<String> = candidates[..window]
        .iter()
        .map(|c| c.file_id.clone())
        .collect();

    let total = total_segments.max(1) as f32;
    let scales = scales_queried.max(1) as f32;

    let score_of = |candidate: &AggregatedCandidate| -> f32 {
        let ev = evidence.get(&candidate.file_id);
        let consistency = ev.map(|e| score_consistency(&e.sims)).unwrap_or(0.0);
        let cross_scale = ev
            .map(|e| e.scales.len() as f32 / scales)
            .unwrap_or(0.0)
            .min(1.0);
        let rank1_ratio = candidate.rank_1_count as f32 / total;
        let coverage = candidate.match_count as f32 / total;

        RR_SIMILARITY * candidate.mean_similarity
            + RR_CONSISTENCY * consistency
            + RR_RANK1 * rank1_ratio
            + RR_COVERAGE * coverage
            + RR_CROSS_SCALE * cross_scale
    };

    candidates[..window].sort_by(|a, b| score_of(b).total_cmp(&score_of(a)));
    assign_dense_ranks(candidates);

    let moved: HashSet<String> = candidates[..window]
        .iter()
        .zip(order_before.iter())
        .filter(|(after, before)| &after.file_id != *before)
        .map(|(after, _)| after.file_id.clone())
        .collect();

    if !moved.is_empty() {
        tracing::debug!(window, moved = moved.len(), "Second-stage re-rank reordered head");
    }
    moved
}

/// Stability of a candidate's per-segment similarities
///
/// `1 − cv` where `cv` is the coefficient of variation, clamped to [0, 1]:
/// tightly clustered similarities score near 1, erratic ones near 0.
fn score_consistency(sims: &[f32]) -> f32 {
    if sims.is_empty() {
        return 0.0;
    }
    let mean = sims.iter().sum::<f32>() / sims.len() as f32;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = sims.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / sims.len() as f32;
    (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
}

/// Compute per-candidate confidence in place
///
/// The gap term compares each candidate to the one ranked directly below
/// it (zero for the tail, full for a sole candidate).
pub(crate) fn score_confidence(
    candidates: &mut [AggregatedCandidate],
    total_segments: usize,
    moved: &HashSet<String>,
) {
    if candidates.is_empty() {
        return;
    }

    let total = total_segments.max(1) as f32;
    let scores: Vec<f32> = candidates.iter().map(|c| c.combined_score).collect();
    let len = candidates.len();

    for (i, candidate) in candidates.iter_mut().enumerate() {
        let gap = if len == 1 {
            1.0
        } else if i + 1 < len {
            let own = scores[i].max(f32::EPSILON);
            ((scores[i] - scores[i + 1]) / own).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let rank1_ratio = candidate.rank_1_count as f32 / total;
        let match_ratio = candidate.match_count as f32 / total;
        let boost = if moved.contains(&candidate.file_id) {
            CF_RERANK_BOOST
        } else {
            0.0
        };

        candidate.confidence = (CF_GAP * gap
            + CF_RANK1 * rank1_ratio
            + CF_TEMPORAL * candidate.temporal_score
            + CF_MATCH * match_ratio
            + CF_QUALITY * candidate.quality_score
            + boost)
            .clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(file_id: &str, combined: f32, mean_sim: f32, rank1: usize) -> AggregatedCandidate {
        AggregatedCandidate {
            file_id: file_id.into(),
            combined_score: combined,
            mean_similarity: mean_sim,
            rank_1_count: rank1,
            rank_5_count: rank1,
            match_count: rank1,
            temporal_score: 0.5,
            confidence: 0.0,
            quality_score: 0.6,
            rank: 0,
        }
    }

    fn evidence_with(sims: Vec<f32>, scales: &[f32]) -> CandidateEvidence {
        CandidateEvidence {
            sims,
            scales: scales.iter().map(|s| s.to_bits()).collect(),
            ..CandidateEvidence::default()
        }
    }

    #[test]
    fn test_consistency_tight_beats_erratic() {
        let tight = score_consistency(&[0.8, 0.8, 0.8, 0.8]);
        let erratic = score_consistency(&[0.2, 0.9, 0.3, 0.95]);
        assert!(tight > erratic);
        assert!((tight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_second_stage_rewards_consistency() {
        // "b" leads after stage one, but its per-segment evidence is
        // erratic and single-scale; "a" is steady across two scales
        let mut candidates = vec![
            candidate("b", 0.70, 0.72, 3),
            candidate("a", 0.69, 0.71, 3),
        ];
        let mut evidence = HashMap::new();
        evidence.insert("b".to_string(), evidence_with(vec![0.2, 0.95, 0.3, 0.9], &[5.0]));
        evidence.insert("a".to_string(), evidence_with(vec![0.7, 0.72, 0.71, 0.7], &[5.0, 10.0]));

        let moved = second_stage(&mut candidates, &evidence, 6, 2, 5);
        assert_eq!(candidates[0].file_id, "a");
        assert_eq!(candidates[0].rank, 1);
        assert!(moved.contains("a"));
        assert!(moved.contains("b"));
    }

    #[test]
    fn test_second_stage_window_respected() {
        let mut candidates = vec![
            candidate("a", 0.9, 0.9, 6),
            candidate("b", 0.8, 0.8, 4),
            candidate("c", 0.1, 0.99, 1), // outside window stays put
        ];
        let mut evidence = HashMap::new();
        evidence.insert("a".to_string(), evidence_with(vec![0.9; 6], &[5.0]));
        evidence.insert("b".to_string(), evidence_with(vec![0.8; 4], &[5.0]));
        evidence.insert("c".to_string(), evidence_with(vec![0.99], &[5.0]));

        second_stage(&mut candidates, &evidence, 6, 1, 2);
        assert_eq!(candidates[2].file_id, "c");
    }

    #[test]
    fn test_confidence_gap_separates_clear_winner() {
        let mut clear = vec![candidate("a", 0.9, 0.95, 6), candidate("b", 0.2, 0.4, 0)];
        score_confidence(&mut clear, 6, &HashSet::new());

        let mut tied = vec![candidate("a", 0.9, 0.95, 6), candidate("b", 0.89, 0.94, 5)];
        score_confidence(&mut tied, 6, &HashSet::new());

        assert!(clear[0].confidence > tied[0].confidence);
    }

    #[test]
    fn test_sole_candidate_full_gap() {
        let mut sole = vec![candidate("a", 0.9, 0.95, 6)];
        score_confidence(&mut sole, 6, &HashSet::new());
        assert!(sole[0].confidence > 0.5);
        assert!(sole[0].confidence <= 1.0);
    }

    #[test]
    fn test_rerank_boost_applied() {
        let mut plain = vec![candidate("a", 0.9, 0.95, 6), candidate("b", 0.5, 0.5, 1)];
        score_confidence(&mut plain, 6, &HashSet::new());
        let without = plain[0].confidence;

        let mut boosted = vec![candidate("a", 0.9, 0.95, 6), candidate("b", 0.5, 0.5, 1)];
        let moved: HashSet<String> = ["a".to_string()].into_iter().collect();
        score_confidence(&mut boosted, 6, &moved);

        assert!((boosted[0].confidence - without - CF_RERANK_BOOST).abs() < 1e-5);
    }

    #[test]
    fn test_confidence_clamped() {
        let mut candidates = vec![candidate("a", 5.0, 2.0, 100)];
        score_confidence(&mut candidates, 6, &HashSet::new());
        assert!(candidates[0].confidence <= 1.0);
    }
}
