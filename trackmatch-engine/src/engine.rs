//! Engine facade
//!
//! Owns the injected collaborators (index handle, embedding provider,
//! optional cache) and runs the full identification flow for one query:
//! segment → embed (through the cache) → parallel ANN queries → evidence
//! fusion → policy-driven scale control → ranked verdict.
//!
//! Constructed explicitly and shared by reference; there is no hidden
//! process-wide engine.

use crate::cache::EmbeddingCache;
use crate::config::{ModelConfig, QueryConfig};
use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::models::{
    QueryMetadata, QueryRequest, QueryResponse, Segment, SegmentQueryResult, Severity,
};
use crate::services::aggregator::Aggregator;
use crate::services::embedder::EmbeddingProvider;
use crate::services::query_executor::QueryExecutor;
use crate::services::search_policy::{estimate_recall_at_5, SearchPolicy};
use crate::services::segmenter::Segmenter;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Retrieval-and-fusion engine
pub struct MatchEngine {
    index: Arc<RwLock<VectorIndex>>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<EmbeddingCache>>,
    model: ModelConfig,
    config: QueryConfig,
    policy: SearchPolicy,
    executor: QueryExecutor,
}

impl MatchEngine {
    /// Create an engine around an existing index and embedding provider
    ///
    /// Fails fast on malformed configuration or a dimension disagreement
    /// between model, provider and index.
    pub fn new(
        index: Arc<RwLock<VectorIndex>>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: ModelConfig,
    ) -> Result<Self> {
        model.validate()?;
        if embedder.dimension() != model.embedding_dim {
            return Err(EngineError::Configuration(format!(
                "provider emits {}-dim vectors but model config declares {}",
                embedder.dimension(),
                model.embedding_dim
            )));
        }
        {
            let index = index.read();
            if index.metadata().dimension != model.embedding_dim {
                return Err(EngineError::Configuration(format!(
                    "index dimension {} does not match model dimension {}",
                    index.metadata().dimension,
                    model.embedding_dim
                )));
            }
        }

        Ok(Self {
            index,
            embedder,
            cache: None,
            model,
            config: QueryConfig::default(),
            policy: SearchPolicy::default(),
            executor: QueryExecutor::new(),
        })
    }

    /// Attach an embedding cache
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the default query configuration
    pub fn with_query_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default search policy
    pub fn with_search_policy(mut self, policy: SearchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the default executor (worker caps)
    pub fn with_executor(mut self, executor: QueryExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Shared index handle (for updates through the updater)
    pub fn index(&self) -> Arc<RwLock<VectorIndex>> {
        self.index.clone()
    }

    /// Identify the source track of a query clip
    ///
    /// Per-segment failures degrade the evidence, never the call; fatal
    /// errors are limited to configuration problems detected before any
    /// work starts. A query with zero embedded segments returns an empty
    /// candidate list flagged `no_evidence`.
    pub async fn identify(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let query_id = Uuid::new_v4();

        let config = match &request.config_override {
            Some(config) => config.clone(),
            None => self.config.clone(),
        };
        config.validate()?;

        // Depth: a declared transform hint consults the policy table,
        // otherwise the configured top-K stands
        let topk = match request.transform_hint {
            Some(hint) => self.policy.search_depth(Some(hint)),
            None => config.topk,
        };
        let severity = request
            .transform_hint
            .map(|h| h.severity)
            .unwrap_or(Severity::default());

        tracing::info!(
            query_id = %query_id,
            file_id = %request.file_id,
            topk,
            hint = ?request.transform_hint,
            "Identifying query clip"
        );

        let mut all_results: Vec<SegmentQueryResult> = Vec::new();
        let mut scales_used: Vec<f32> = Vec::new();
        let mut segments_total = 0usize;
        let mut early_terminated = false;

        let scale_count = config.multi_scale_lengths.len();
        for (scale_idx, (&length, &weight)) in config
            .multi_scale_lengths
            .iter()
            .zip(config.multi_scale_weights.iter())
            .enumerate()
        {
            let slots = self
                .embed_scale(&request, length, weight, &config)
                .await?;
            if slots.is_empty() {
                tracing::debug!(scale = length, "Clip shorter than scale, skipping");
                continue;
            }
            segments_total += slots.len();

            let scale_results = self
                .executor
                .execute(self.index.clone(), slots, topk)
                .await?;
            scales_used.push(length);
            let first_scale = scales_used.len() == 1;
            all_results.extend(scale_results);

            if !first_scale || scale_idx + 1 >= scale_count {
                continue;
            }

            // After the first productive scale: stop early on decisive
            // evidence, or consult the policy about further scales
            if let Some(decision) =
                QueryExecutor::check_early_termination(&all_results, &config.early_stop)
            {
                tracing::info!(
                    query_id = %query_id,
                    file_id = %decision.file_id,
                    rule = decision.rule,
                    "Early termination after first scale"
                );
                early_terminated = true;
                break;
            }

            let activate = match &request.expected_id {
                // Evaluation mode: recall-driven decision
                Some(expected) => {
                    let recall = estimate_recall_at_5(&all_results, expected);
                    self.policy.should_activate_multi_scale(severity, recall)
                }
                // Production mode: fixed table
                None => self.policy.multi_scale_default(request.transform_hint),
            };
            if !activate {
                tracing::debug!(query_id = %query_id, "Single scale sufficient, skipping rest");
                break;
            }
        }

        let segments_matched = all_results.iter().filter(|r| !r.hits.is_empty()).count();
        let no_evidence = segments_matched == 0;

        let top_candidates = if no_evidence {
            tracing::warn!(
                query_id = %query_id,
                segments_total,
                "No segment produced evidence, returning empty verdict"
            );
            Vec::new()
        } else {
            Aggregator::new(&config).aggregate(&all_results, scales_used.len().max(1))
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            query_id = %query_id,
            candidates = top_candidates.len(),
            segments_matched,
            segments_total,
            latency_ms,
            "Query complete"
        );

        Ok(QueryResponse {
            top_candidates,
            segment_results: all_results,
            latency_ms,
            metadata: QueryMetadata {
                query_id,
                scales_used,
                topk,
                segments_total,
                segments_matched,
                early_terminated,
                no_evidence,
            },
        })
    }

    /// Segment and embed the clip at one scale, preserving failed slots
    ///
    /// Cache hits return only successfully embedded segments (that is what
    /// was stored); fresh embeddings keep `None` slots so the executor can
    /// report them as empty results in order.
    async fn embed_scale(
        &self,
        request: &QueryRequest,
        length: f32,
        weight: f32,
        config: &QueryConfig,
    ) -> Result<Vec<(Segment, Option<Vec<f32>>)>> {
        let scale_model = self.model.with_segment_length(length);

        if let (Some(cache), Some(path)) = (&self.cache, request.file_path.as_deref()) {
            if let Some((vectors, segments)) = cache.get(&request.file_id, path, &scale_model) {
                return Ok(segments
                    .into_iter()
                    .zip(vectors.into_iter().map(Some))
                    .collect());
            }
        }

        let windows = Segmenter::new(length)
            .with_overlap_ratio(config.overlap_ratio)
            .with_scale_weight(weight)
            .segment(&request.audio.samples, request.audio.sample_rate, &request.file_id)?;
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let embedder = self.embedder.clone();
        let samples = Arc::new(request.audio.samples.clone());
        let sample_rate = request.audio.sample_rate;
        let ranges: Vec<(usize, usize)> = windows
            .iter()
            .map(|w| (w.start_sample, w.end_sample))
            .collect();

        let embedded: Vec<Option<Vec<f32>>> = tokio::task::spawn_blocking(move || {
            let batch: Vec<(&[f32], u32)> = ranges
                .iter()
                .map(|&(start, end)| (&samples[start..end], sample_rate))
                .collect();
            embedder.embed_batch(&batch)
        })
        .await
        .map_err(|e| EngineError::Embedding(format!("embedding task failed: {}", e)))?;

        // Cache only what embedded successfully
        if let (Some(cache), Some(path)) = (&self.cache, request.file_path.as_deref()) {
            let mut vectors = Vec::new();
            let mut segments = Vec::new();
            for (window, vector) in windows.iter().zip(embedded.iter()) {
                if let Some(vector) = vector {
                    vectors.push(vector.clone());
                    segments.push(window.meta.clone());
                }
            }
            if !vectors.is_empty() {
                cache.set(&request.file_id, path, &scale_model, &vectors, &segments);
            }
        }

        Ok(windows
            .into_iter()
            .map(|w| w.meta)
            .zip(embedded)
            .collect())
    }
}
