//! Parallel per-segment ANN querying
//!
//! One independent index query per segment, fanned out over a bounded
//! rayon pool inside `spawn_blocking` so the async runtime never stalls on
//! CPU work. A single segment skips the pool entirely. Worker failures
//! fill their slot with an empty result instead of failing the query, and
//! the output always preserves original segment order, which the temporal
//! consistency signal depends on.

use crate::config::EarlyStopConfig;
use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::models::{file_id_from_segment_key, Segment, SegmentQueryResult};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool ceiling regardless of machine size
const MAX_WORKERS: usize = 8;

/// Early-termination verdict after the first scale
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopDecision {
    /// Candidate that triggered the short-circuit
    pub file_id: String,
    pub rank1_ratio: f32,
    pub max_similarity: f32,
    pub mean_similarity: f32,
    /// Which rule fired
    pub rule: &'static str,
}

/// Bounded-parallelism query executor
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    hard_cap: usize,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self {
            hard_cap: num_cpus::get().max(1),
        }
    }
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the machine-level worker cap
    pub fn with_hard_cap(mut self, hard_cap: usize) -> Self {
        self.hard_cap = hard_cap.max(1);
        self
    }

    fn worker_count(&self, segment_count: usize) -> usize {
        MAX_WORKERS.min(segment_count).min(self.hard_cap).max(1)
    }

    /// Query the index once per segment
    ///
    /// `segments` pairs each segment with its embedded vector; `None`
    /// vectors (failed embeddings) yield empty slots directly. Results come
    /// back in input order.
    pub async fn execute(
        &self,
        index: Arc<RwLock<VectorIndex>>,
        mut segments: Vec<(Segment, Option<Vec<f32>>)>,
        topk: usize,
    ) -> Result<Vec<SegmentQueryResult>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        // Single segment: no pool overhead
        if segments.len() == 1 {
            let (meta, vector) = segments.remove(0);
            return Ok(vec![query_slot(&index, &meta, vector.as_deref(), topk, 0)]);
        }

        let workers = self.worker_count(segments.len());
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_for_task = failed.clone();
        let total = segments.len();

        tracing::debug!(segments = total, workers, topk, "Dispatching segment queries");

        let results = tokio::task::spawn_blocking(move || {
            let run = |segments: Vec<(Segment, Option<Vec<f32>>)>| {
                segments
                    .into_par_iter()
                    .enumerate()
                    .map(|(i, (meta, vector))| {
                        let slot = query_slot(&index, &meta, vector.as_deref(), topk, i);
                        if slot.hits.is_empty() {
                            failed_for_task.fetch_add(1, Ordering::Relaxed);
                        }
                        slot
                    })
                    .collect::<Vec<SegmentQueryResult>>()
            };

            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| run(segments)),
                Err(e) => {
                    tracing::warn!(error = %e, "Worker pool unavailable, querying sequentially");
                    run(segments)
                }
            }
        })
        .await
        .map_err(|e| EngineError::IndexQuery(format!("query task failed: {}", e)))?;

        tracing::debug!(
            segments = total,
            empty_slots = failed.load(Ordering::Relaxed),
            "Segment queries complete"
        );

        Ok(results)
    }

    /// Check whether first-scale evidence already settles the verdict
    ///
    /// Three rules, any of which short-circuits:
    /// 1. rank-1 ratio ≥ threshold AND max similarity ≥ confidence floor
    /// 2. max similarity alone above its threshold
    /// 3. mean similarity ≥ threshold AND rank-1 ratio ≥ its companion
    ///
    /// Ratios are taken over all dispatched segments, so failed workers
    /// weaken the evidence rather than hiding it. Returns `None` when
    /// disabled or no rule fires.
    pub fn check_early_termination(
        results: &[SegmentQueryResult],
        config: &EarlyStopConfig,
    ) -> Option<EarlyStopDecision> {
        if !config.enabled || results.is_empty() {
            return None;
        }

        let total = results.len() as f32;

        #[derive(Default)]
        struct Tally {
            rank1: usize,
            max_sim: f32,
            sim_sum: f32,
            sim_count: usize,
        }

        let mut tallies: HashMap<&str, Tally> = HashMap::new();
        for result in results {
            let mut best_per_candidate: HashMap<&str, f32> = HashMap::new();
            for hit in &result.hits {
                let Some(file_id) = file_id_from_segment_key(&hit.segment_key) else {
                    continue;
                };
                let best = best_per_candidate.entry(file_id).or_insert(f32::MIN);
                if hit.similarity > *best {
                    *best = hit.similarity;
                }
                if hit.rank == 1 {
                    tallies.entry(file_id).or_default().rank1 += 1;
                }
            }
            for (file_id, sim) in best_per_candidate {
                let tally = tallies.entry(file_id).or_default();
                tally.max_sim = tally.max_sim.max(sim);
                tally.sim_sum += sim;
                tally.sim_count += 1;
            }
        }

        for (file_id, tally) in &tallies {
            let rank1_ratio = tally.rank1 as f32 / total;
            let mean_similarity = if tally.sim_count > 0 {
                tally.sim_sum / tally.sim_count as f32
            } else {
                0.0
            };

            let rule = if rank1_ratio >= config.rank1_ratio
                && tally.max_sim >= config.confidence_floor
            {
                Some("rank1_ratio+confidence_floor")
            } else if tally.max_sim > config.max_similarity {
                Some("max_similarity")
            } else if mean_similarity >= config.mean_similarity
                && rank1_ratio >= config.mean_rank1_ratio
            {
                Some("mean_similarity+rank1_ratio")
            } else {
                None
            };

            if let Some(rule) = rule {
                tracing::debug!(
                    file_id = %file_id,
                    rank1_ratio,
                    max_similarity = tally.max_sim,
                    rule,
                    "Early termination triggered"
                );
                return Some(EarlyStopDecision {
                    file_id: file_id.to_string(),
                    rank1_ratio,
                    max_similarity: tally.max_sim,
                    mean_similarity,
                    rule,
                });
            }
        }

        None
    }
}

/// Query one segment's slot; failures become empty slots
fn query_slot(
    index: &RwLock<VectorIndex>,
    meta: &Segment,
    vector: Option<&[f32]>,
    topk: usize,
    segment_index: usize,
) -> SegmentQueryResult {
    let Some(vector) = vector else {
        return SegmentQueryResult::empty(
            meta.segment_id.clone(),
            segment_index,
            meta.scale_length,
            meta.scale_weight,
        );
    };

    match index.read().query(vector, topk) {
        Ok(hits) => SegmentQueryResult {
            segment_id: meta.segment_id.clone(),
            segment_index,
            scale_length: meta.scale_length,
            scale_weight: meta.scale_weight,
            hits,
        },
        Err(e) => {
            tracing::warn!(
                segment_id = %meta.segment_id,
                error = %e,
                "Segment query failed, filling empty slot"
            );
            SegmentQueryResult::empty(
                meta.segment_id.clone(),
                segment_index,
                meta.scale_length,
                meta.scale_weight,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, IndexKind};
    use crate::models::{segment_key, SegmentHit};

    fn axis_vector(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn test_index(dim: usize, n: usize) -> Arc<RwLock<VectorIndex>> {
        let vectors: Vec<Vec<f32>> = (0..n).map(|i| axis_vector(dim, i % dim)).collect();
        let keys: Vec<String> = (0..n).map(|i| segment_key("lib", i)).collect();
        Arc::new(RwLock::new(
            VectorIndex::build(&vectors, &keys, &IndexConfig::new(dim, IndexKind::Flat)).unwrap(),
        ))
    }

    fn segment(i: usize) -> Segment {
        Segment {
            segment_id: segment_key("query", i),
            file_id: "query".to_string(),
            start_time: i as f32 * 5.0,
            end_time: (i + 1) as f32 * 5.0,
            scale_length: 5.0,
            scale_weight: 1.0,
            sample_rate: 16000,
        }
    }

    fn result_with_top(
        index: usize,
        file_id: &str,
        similarity: f32,
    ) -> SegmentQueryResult {
        SegmentQueryResult {
            segment_id: segment_key("q", index),
            segment_index: index,
            scale_length: 5.0,
            scale_weight: 1.0,
            hits: vec![SegmentHit {
                rank: 1,
                segment_key: segment_key(file_id, index),
                raw_score: similarity,
                similarity,
            }],
        }
    }

    #[tokio::test]
    async fn test_results_preserve_order() {
        let dim = 8;
        let index = test_index(dim, 8);
        let executor = QueryExecutor::new();

        let segments: Vec<(Segment, Option<Vec<f32>>)> = (0..6)
            .map(|i| (segment(i), Some(axis_vector(dim, i % dim))))
            .collect();

        let results = executor.execute(index, segments, 3).await.unwrap();
        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.segment_index, i);
            assert_eq!(result.segment_id, segment_key("query", i));
            assert!(!result.hits.is_empty());
        }
    }

    #[tokio::test]
    async fn test_failed_embeddings_fill_empty_slots() {
        let dim = 4;
        let index = test_index(dim, 4);
        let executor = QueryExecutor::new();

        let segments: Vec<(Segment, Option<Vec<f32>>)> = (0..6)
            .map(|i| {
                let vector = if i < 2 { Some(axis_vector(dim, i)) } else { None };
                (segment(i), vector)
            })
            .collect();

        let results = executor.execute(index, segments, 3).await.unwrap();
        assert_eq!(results.len(), 6);
        assert!(!results[0].hits.is_empty());
        assert!(!results[1].hits.is_empty());
        for result in &results[2..] {
            assert!(result.hits.is_empty());
        }
    }

    #[tokio::test]
    async fn test_single_segment_inline() {
        let dim = 4;
        let index = test_index(dim, 4);
        let executor = QueryExecutor::new();

        let segments = vec![(segment(0), Some(axis_vector(dim, 0)))];
        let results = executor.execute(index, segments, 2).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].hits.len(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_isolated_per_slot() {
        let dim = 4;
        let index = test_index(dim, 4);
        let executor = QueryExecutor::new();

        let segments = vec![
            (segment(0), Some(axis_vector(dim, 0))),
            (segment(1), Some(vec![1.0, 0.0])), // wrong dimension
        ];
        let results = executor.execute(index, segments, 2).await.unwrap();
        assert!(!results[0].hits.is_empty());
        assert!(results[1].hits.is_empty());
    }

    #[test]
    fn test_worker_count_bounds() {
        let executor = QueryExecutor::new().with_hard_cap(4);
        assert_eq!(executor.worker_count(1), 1);
        assert_eq!(executor.worker_count(3), 3);
        assert_eq!(executor.worker_count(100), 4);

        let wide = QueryExecutor::new().with_hard_cap(64);
        assert_eq!(wide.worker_count(100), MAX_WORKERS);
    }

    #[test]
    fn test_early_stop_rank1_rule() {
        let results: Vec<SegmentQueryResult> =
            (0..10).map(|i| result_with_top(i, "hit", 0.93)).collect();
        let decision =
            QueryExecutor::check_early_termination(&results, &EarlyStopConfig::default()).unwrap();
        assert_eq!(decision.file_id, "hit");
        assert_eq!(decision.rule, "rank1_ratio+confidence_floor");
    }

    #[test]
    fn test_early_stop_max_similarity_rule() {
        // Only 1 of 10 segments matched, but with near-perfect similarity
        let mut results: Vec<SegmentQueryResult> = (0..9)
            .map(|i| SegmentQueryResult::empty(segment_key("q", i), i, 5.0, 1.0))
            .collect();
        results.push(result_with_top(9, "hit", 0.97));

        let decision =
            QueryExecutor::check_early_termination(&results, &EarlyStopConfig::default()).unwrap();
        assert_eq!(decision.rule, "max_similarity");
    }

    #[test]
    fn test_early_stop_disabled() {
        let results: Vec<SegmentQueryResult> =
            (0..10).map(|i| result_with_top(i, "hit", 0.99)).collect();
        let config = EarlyStopConfig {
            enabled: false,
            ..EarlyStopConfig::default()
        };
        assert!(QueryExecutor::check_early_termination(&results, &config).is_none());
    }

    #[test]
    fn test_early_stop_weak_evidence_no_fire() {
        let results: Vec<SegmentQueryResult> =
            (0..10).map(|i| result_with_top(i, "hit", 0.6)).collect();
        assert!(
            QueryExecutor::check_early_termination(&results, &EarlyStopConfig::default()).is_none()
        );
    }

    #[test]
    fn test_early_stop_failed_workers_weaken_ratio() {
        // 2 of 6 segments rank-1 at 0.93: ratio 0.33 is below the bar and
        // max similarity stays under the standalone threshold
        let mut results: Vec<SegmentQueryResult> = (0..4)
            .map(|i| SegmentQueryResult::empty(segment_key("q", i), i, 5.0, 1.0))
            .collect();
        results.push(result_with_top(4, "hit", 0.93));
        results.push(result_with_top(5, "hit", 0.93));

        assert!(
            QueryExecutor::check_early_termination(&results, &EarlyStopConfig::default()).is_none()
        );
    }
}
