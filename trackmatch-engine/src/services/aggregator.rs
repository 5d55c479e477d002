//! Multi-signal evidence fusion
//!
//! Converts noisy per-segment top-K lists into a ranked list of whole-track
//! candidates. The pipeline, in order:
//!
//! 1. Drop segments whose best similarity is under the floor, unless that
//!    would remove more than 70% of them; in that case the filter is
//!    discarded as too aggressive.
//! 2. Keep only the most confident fraction of segments (fusion ratio),
//!    never fewer than five.
//! 3. Accumulate per-candidate evidence: similarity²×scale-weighted mean
//!    similarity, rank-1 / rank-5 / match counts, temporal run scores.
//! 4. Combine into one score with normalized weights.
//! 5. Sort descending, dense ranks, `mean_similarity` breaks ties.
//! 6. Optional second-stage re-rank of the top candidates.
//! 7. Per-candidate confidence.
//! 8. Optional confidence re-sort and floor, never dropping the last
//!    remaining candidate.

use crate::config::QueryConfig;
use crate::models::{file_id_from_segment_key, AggregatedCandidate, SegmentQueryResult};
use crate::services::reranker;
use std::collections::{HashMap, HashSet};

/// Fusion floor: never keep fewer segments than this
const MIN_FUSION_SEGMENTS: usize = 5;
/// Filter rollback: discard the similarity filter when it removes more
/// than this fraction of segments
const MAX_FILTERED_FRACTION: f32 = 0.7;

/// Accumulated evidence for one candidate track
#[derive(Debug, Default, Clone)]
pub(crate) struct CandidateEvidence {
    pub weighted_sim_sum: f32,
    pub weight_sum: f32,
    pub rank1: usize,
    pub rank5: usize,
    pub matches: usize,
    /// Best similarity per contributing segment, in segment order
    pub sims: Vec<f32>,
    /// Scale lengths (as bit patterns) this candidate appeared at
    pub scales: HashSet<u32>,
    pub temporal: f32,
}

/// Evidence fusion engine
///
/// Pure function of the segment results; owns no index or cache state.
pub struct Aggregator {
    config: QueryConfig,
}

impl Aggregator {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Fuse per-segment results into a ranked candidate list
    ///
    /// `scales_queried` is the number of distinct scales dispatched; the
    /// second-stage re-rank uses it for cross-scale consistency. Returns an
    /// empty list only when no segment carries any hit.
    pub fn aggregate(
        &self,
        results: &[SegmentQueryResult],
        scales_queried: usize,
    ) -> Vec<AggregatedCandidate> {
        let selected = self.select_segments(results);
        if selected.is_empty() {
            return Vec::new();
        }
        let total = selected.len();

        let mut evidence = self.accumulate(&selected);
        if self.config.use_temporal_consistency {
            self.score_temporal(&selected, total, &mut evidence);
        }

        let mut candidates = self.combine(&evidence, total);
        sort_by_score(&mut candidates);
        assign_dense_ranks(&mut candidates);

        let moved = if self.config.use_second_stage_rerank && candidates.len() > 1 {
            reranker::second_stage(
                &mut candidates,
                &evidence,
                total,
                scales_queried.max(1),
                self.config.rerank_top_n,
            )
        } else {
            HashSet::new()
        };

        reranker::score_confidence(&mut candidates, total, &moved);

        if self.config.sort_by_confidence {
            candidates.sort_by(|a, b| {
                (b.confidence * b.combined_score).total_cmp(&(a.confidence * a.combined_score))
            });
            assign_dense_ranks(&mut candidates);
        }

        if let Some(min_confidence) = self.config.min_confidence {
            let before = candidates.len();
            let survivors: Vec<AggregatedCandidate> = candidates
                .iter()
                .filter(|c| c.confidence >= min_confidence)
                .cloned()
                .collect();
            // At least one result whenever any evidence exists
            if survivors.is_empty() {
                candidates.truncate(1);
            } else {
                candidates = survivors;
            }
            if candidates.len() != before {
                assign_dense_ranks(&mut candidates);
            }
        }

        tracing::debug!(
            segments = total,
            candidates = candidates.len(),
            top = candidates.first().map(|c| c.file_id.as_str()),
            "Aggregation complete"
        );

        candidates
    }

    /// Steps 1 and 2: similarity filter (with rollback) and fusion-ratio
    /// selection, both preserving original segment order
    fn select_segments<'a>(
        &self,
        results: &'a [SegmentQueryResult],
    ) -> Vec<&'a SegmentQueryResult> {
        let non_empty: Vec<&SegmentQueryResult> =
            results.iter().filter(|r| !r.hits.is_empty()).collect();
        if non_empty.is_empty() {
            return Vec::new();
        }

        let mut working = non_empty.clone();
        if self.config.use_adaptive_threshold {
            let filtered: Vec<&SegmentQueryResult> = non_empty
                .iter()
                .copied()
                .filter(|r| {
                    r.top_similarity().unwrap_or(0.0) >= self.config.min_similarity_threshold
                })
                .collect();
            let removed_fraction = 1.0 - filtered.len() as f32 / non_empty.len() as f32;
            if removed_fraction > MAX_FILTERED_FRACTION {
                tracing::debug!(
                    removed_fraction,
                    "Similarity filter too aggressive, using all segments"
                );
            } else {
                working = filtered;
            }
        }

        if self.config.top_k_fusion_ratio < 1.0 && working.len() > MIN_FUSION_SEGMENTS {
            let keep = ((working.len() as f32 * self.config.top_k_fusion_ratio).ceil() as usize)
                .max(MIN_FUSION_SEGMENTS)
                .min(working.len());
            if keep < working.len() {
                let mut by_confidence: Vec<usize> = (0..working.len()).collect();
                by_confidence.sort_by(|&a, &b| {
                    working[b]
                        .top_similarity()
                        .unwrap_or(0.0)
                        .total_cmp(&working[a].top_similarity().unwrap_or(0.0))
                });
                let kept: HashSet<usize> = by_confidence.into_iter().take(keep).collect();
                working = working
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| kept.contains(i))
                    .map(|(_, r)| r)
                    .collect();
            }
        }

        working
    }

    /// Step 3: per-candidate accumulation over the selected segments
    fn accumulate(&self, selected: &[&SegmentQueryResult]) -> HashMap<String, CandidateEvidence> {
        let mut evidence: HashMap<String, CandidateEvidence> = HashMap::new();

        for result in selected {
            // Per segment: best similarity and best rank per candidate
            let mut best_sim: HashMap<&str, f32> = HashMap::new();
            let mut best_rank: HashMap<&str, usize> = HashMap::new();
            for hit in &result.hits {
                let Some(file_id) = file_id_from_segment_key(&hit.segment_key) else {
                    tracing::warn!(key = %hit.segment_key, "Hit with malformed segment key");
                    continue;
                };
                let sim = best_sim.entry(file_id).or_insert(f32::MIN);
                if hit.similarity > *sim {
                    *sim = hit.similarity;
                }
                let rank = best_rank.entry(file_id).or_insert(usize::MAX);
                if hit.rank < *rank {
                    *rank = hit.rank;
                }
            }

            for (file_id, sim) in best_sim {
                let entry = evidence.entry(file_id.to_string()).or_default();
                let weight = sim * sim * result.scale_weight;
                entry.weighted_sim_sum += sim * weight;
                entry.weight_sum += weight;
                entry.matches += 1;
                entry.sims.push(sim);
                entry.scales.insert(result.scale_length.to_bits());
                match best_rank.get(file_id) {
                    Some(&1) => {
                        entry.rank1 += 1;
                        entry.rank5 += 1;
                    }
                    Some(&rank) if rank <= 5 => entry.rank5 += 1,
                    _ => {}
                }
            }
        }

        evidence
    }

    /// Temporal consistency: credit for consecutive segments agreeing on
    /// the same top hit
    ///
    /// Runs are computed within each scale (consecutiveness across scale
    /// boundaries is meaningless), then
    /// `score = 0.5·longest_run/total + 0.5·Σ(run lengths)/total`.
    fn score_temporal(
        &self,
        selected: &[&SegmentQueryResult],
        total: usize,
        evidence: &mut HashMap<String, CandidateEvidence>,
    ) {
        let mut longest: HashMap<String, usize> = HashMap::new();
        let mut run_sum: HashMap<String, usize> = HashMap::new();

        let mut scales: Vec<u32> = selected.iter().map(|r| r.scale_length.to_bits()).collect();
        scales.dedup();

        for scale in scales {
            let sequence: Vec<Option<&str>> = selected
                .iter()
                .filter(|r| r.scale_length.to_bits() == scale)
                .map(|r| r.top_key().and_then(file_id_from_segment_key))
                .collect();

            let mut run_candidate: Option<&str> = None;
            let mut run_len = 0usize;
            for top in sequence.iter().chain(std::iter::once(&None)) {
                match (*top, run_candidate) {
                    (Some(current), Some(prev)) if current == prev => run_len += 1,
                    _ => {
                        if let Some(prev) = run_candidate {
                            let entry = longest.entry(prev.to_string()).or_default();
                            *entry = (*entry).max(run_len);
                            *run_sum.entry(prev.to_string()).or_default() += run_len;
                        }
                        run_candidate = *top;
                        run_len = usize::from(top.is_some());
                    }
                }
            }
        }

        let total = total as f32;
        for (file_id, entry) in evidence.iter_mut() {
            let longest_run = longest.get(file_id).copied().unwrap_or(0) as f32;
            let runs = run_sum.get(file_id).copied().unwrap_or(0) as f32;
            entry.temporal = 0.5 * (longest_run / total) + 0.5 * (runs / total);
        }
    }

    /// Step 4: weighted combination
    ///
    /// `temporal_consistency_weight` overrides the temporal slot of the
    /// weight block so there is a single source of truth for it; weights
    /// are then normalized to sum to one.
    fn combine(
        &self,
        evidence: &HashMap<String, CandidateEvidence>,
        total: usize,
    ) -> Vec<AggregatedCandidate> {
        let mut weights = self.config.weights;
        weights.temporal = if self.config.use_temporal_consistency {
            self.config.temporal_consistency_weight
        } else {
            0.0
        };
        let weights = weights.normalized();
        let total = total as f32;

        evidence
            .iter()
            .map(|(file_id, ev)| {
                let mean_similarity = if ev.weight_sum > 0.0 {
                    ev.weighted_sim_sum / ev.weight_sum
                } else {
                    0.0
                };
                let rank1_ratio = ev.rank1 as f32 / total;
                let rank5_ratio = ev.rank5 as f32 / total;
                let match_ratio = ev.matches as f32 / total;

                let combined_score = weights.similarity * mean_similarity
                    + weights.rank1 * rank1_ratio
                    + weights.rank5 * rank5_ratio
                    + weights.match_count * match_ratio
                    + weights.temporal * ev.temporal;

                let quality_score = 0.6 * mean_similarity + 0.4 * match_ratio;

                AggregatedCandidate {
                    file_id: file_id.clone(),
                    combined_score,
                    mean_similarity,
                    rank_1_count: ev.rank1,
                    rank_5_count: ev.rank5,
                    match_count: ev.matches,
                    temporal_score: ev.temporal,
                    confidence: 0.0,
                    quality_score,
                    rank: 0,
                }
            })
            .collect()
    }
}

/// Descending combined score; `mean_similarity` breaks ties
pub(crate) fn sort_by_score(candidates: &mut [AggregatedCandidate]) {
    candidates.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then(b.mean_similarity.total_cmp(&a.mean_similarity))
    });
}

/// Dense 1..N ranks, no gaps
pub(crate) fn assign_dense_ranks(candidates: &mut [AggregatedCandidate]) {
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{segment_key, SegmentHit};

    fn hit(rank: usize, file_id: &str, seg: usize, similarity: f32) -> SegmentHit {
        SegmentHit {
            rank,
            segment_key: segment_key(file_id, seg),
            raw_score: similarity,
            similarity,
        }
    }

    fn result(index: usize, hits: Vec<SegmentHit>) -> SegmentQueryResult {
        SegmentQueryResult {
            segment_id: segment_key("q", index),
            segment_index: index,
            scale_length: 5.0,
            scale_weight: 1.0,
            hits,
        }
    }

    /// Six segments, all rank-1 for "a" with runner-up "b"
    fn clean_results() -> Vec<SegmentQueryResult> {
        (0..6)
            .map(|i| {
                result(
                    i,
                    vec![hit(1, "a", i, 0.97), hit(2, "b", i % 2, 0.55)],
                )
            })
            .collect()
    }

    fn config() -> QueryConfig {
        QueryConfig::default()
    }

    #[test]
    fn test_unanimous_evidence_ranks_first() {
        let candidates = Aggregator::new(&config()).aggregate(&clean_results(), 1);

        assert_eq!(candidates[0].file_id, "a");
        assert_eq!(candidates[0].rank, 1);
        assert_eq!(candidates[0].rank_1_count, 6);
        assert!(candidates[0].mean_similarity > 0.95);
        assert!(candidates[0].combined_score > candidates[1].combined_score);
    }

    #[test]
    fn test_dense_ranks_no_gaps() {
        let candidates = Aggregator::new(&config()).aggregate(&clean_results(), 1);
        for (i, c) in candidates.iter().enumerate() {
            assert_eq!(c.rank, i + 1);
        }
    }

    #[test]
    fn test_empty_results_empty_candidates() {
        let results: Vec<SegmentQueryResult> = (0..4)
            .map(|i| SegmentQueryResult::empty(segment_key("q", i), i, 5.0, 1.0))
            .collect();
        assert!(Aggregator::new(&config()).aggregate(&results, 1).is_empty());
    }

    #[test]
    fn test_partial_evidence_still_ranked() {
        // 2 of 6 segments returned hits
        let mut results: Vec<SegmentQueryResult> = (0..4)
            .map(|i| SegmentQueryResult::empty(segment_key("q", i), i, 5.0, 1.0))
            .collect();
        results.push(result(4, vec![hit(1, "a", 4, 0.9)]));
        results.push(result(5, vec![hit(1, "a", 5, 0.88)]));

        let candidates = Aggregator::new(&config()).aggregate(&results, 1);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file_id, "a");
        assert_eq!(candidates[0].rank, 1);
    }

    #[test]
    fn test_filter_rollback_when_too_aggressive() {
        // All six segments sit below the similarity floor: filtering would
        // remove 100% of them, so the filter must be discarded
        let results: Vec<SegmentQueryResult> = (0..6)
            .map(|i| result(i, vec![hit(1, "a", i, 0.2)]))
            .collect();

        let candidates = Aggregator::new(&config()).aggregate(&results, 1);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].match_count, 6);
    }

    #[test]
    fn test_filter_drops_weak_segments() {
        // Ten strong segments for "a", two weak ones whose top hit is "b"
        let mut results: Vec<SegmentQueryResult> = (0..10)
            .map(|i| result(i, vec![hit(1, "a", i, 0.9)]))
            .collect();
        results.push(result(10, vec![hit(1, "b", 0, 0.1)]));
        results.push(result(11, vec![hit(1, "b", 1, 0.1)]));

        let candidates = Aggregator::new(&config()).aggregate(&results, 1);
        let a = candidates.iter().find(|c| c.file_id == "a").unwrap();
        assert_eq!(a.match_count, 10);
        // The weak segments were filtered out entirely
        assert!(candidates.iter().all(|c| c.file_id != "b"));
    }

    #[test]
    fn test_temporal_consistency_favors_runs() {
        // "a" and "b" each top 4 of 8 segments with equal similarity, but
        // "a"'s wins are consecutive while "b"'s alternate
        let tops = ["a", "a", "a", "a", "b", "x1", "b", "x2"];
        let results: Vec<SegmentQueryResult> = tops
            .iter()
            .enumerate()
            .map(|(i, top)| {
                result(
                    i,
                    vec![hit(1, top, i, 0.8), hit(2, if *top == "a" { "b" } else { "a" }, i, 0.78)],
                )
            })
            .collect();

        let candidates = Aggregator::new(&config()).aggregate(&results, 1);
        let a = candidates.iter().find(|c| c.file_id == "a").unwrap();
        let b = candidates.iter().find(|c| c.file_id == "b").unwrap();
        assert!(a.temporal_score > b.temporal_score);
        assert!(a.combined_score > b.combined_score);
    }

    #[test]
    fn test_tie_break_by_mean_similarity() {
        let mut candidates = vec![
            AggregatedCandidate {
                file_id: "low".into(),
                combined_score: 0.5,
                mean_similarity: 0.6,
                rank_1_count: 0,
                rank_5_count: 0,
                match_count: 1,
                temporal_score: 0.0,
                confidence: 0.0,
                quality_score: 0.0,
                rank: 0,
            },
            AggregatedCandidate {
                file_id: "high".into(),
                combined_score: 0.5,
                mean_similarity: 0.9,
                rank_1_count: 0,
                rank_5_count: 0,
                match_count: 1,
                temporal_score: 0.0,
                confidence: 0.0,
                quality_score: 0.0,
                rank: 0,
            },
        ];
        sort_by_score(&mut candidates);
        assert_eq!(candidates[0].file_id, "high");
    }

    #[test]
    fn test_monotonicity_in_similarity() {
        let base: Vec<SegmentQueryResult> = (0..6)
            .map(|i| result(i, vec![hit(1, "a", i, 0.7), hit(2, "b", i, 0.6)]))
            .collect();
        let raised: Vec<SegmentQueryResult> = (0..6)
            .map(|i| result(i, vec![hit(1, "a", i, 0.9), hit(2, "b", i, 0.6)]))
            .collect();

        let aggregator = Aggregator::new(&config());
        let before = aggregator.aggregate(&base, 1);
        let after = aggregator.aggregate(&raised, 1);

        let score = |cands: &[AggregatedCandidate]| {
            cands.iter().find(|c| c.file_id == "a").unwrap().combined_score
        };
        let rank = |cands: &[AggregatedCandidate]| {
            cands.iter().find(|c| c.file_id == "a").unwrap().rank
        };
        assert!(score(&after) >= score(&before));
        assert!(rank(&after) <= rank(&before));
    }

    #[test]
    fn test_min_confidence_never_drops_last_candidate() {
        let config = QueryConfig {
            min_confidence: Some(1.0), // impossible bar
            ..QueryConfig::default()
        };
        let candidates = Aggregator::new(&config).aggregate(&clean_results(), 1);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rank, 1);
    }

    #[test]
    fn test_fusion_ratio_keeps_floor() {
        // 20 segments, ratio 0.1 would keep 2, floor forces 5
        let results: Vec<SegmentQueryResult> = (0..20)
            .map(|i| result(i, vec![hit(1, "a", i, 0.5 + (i as f32) * 0.02)]))
            .collect();
        let config = QueryConfig {
            top_k_fusion_ratio: 0.1,
            use_adaptive_threshold: false,
            ..QueryConfig::default()
        };
        let candidates = Aggregator::new(&config).aggregate(&results, 1);
        assert_eq!(candidates[0].match_count, 5);
    }

    #[test]
    fn test_temporal_disabled() {
        let config = QueryConfig {
            use_temporal_consistency: false,
            ..QueryConfig::default()
        };
        let candidates = Aggregator::new(&config).aggregate(&clean_results(), 1);
        assert_eq!(candidates[0].temporal_score, 0.0);
        assert_eq!(candidates[0].file_id, "a");
    }
}
