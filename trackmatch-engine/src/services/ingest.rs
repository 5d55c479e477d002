//! File ingestion pipeline
//!
//! Segments, embeds and caches whole files, producing the vector/key
//! bundles the index build and incremental update paths consume. Multiple
//! files are processed concurrently with bounded width; a file that fails
//! never aborts the batch.

use crate::cache::EmbeddingCache;
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::models::{validate_file_id, AudioBuffer, Segment};
use crate::services::embedder::EmbeddingProvider;
use crate::services::segmenter::Segmenter;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default concurrent file width
const DEFAULT_CONCURRENCY: usize = 4;

/// Embedded representation of one file, ready for indexing
#[derive(Debug, Clone)]
pub struct FileEmbeddings {
    pub file_id: String,
    /// Segment keys, same order as `vectors`
    pub keys: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
    pub segments: Vec<Segment>,
}

/// One file queued for ingestion
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub file_id: String,
    pub audio: AudioBuffer,
    /// On-disk path; enables the content-addressed cache
    pub file_path: Option<PathBuf>,
}

/// Segment → embed → cache pipeline
pub struct Ingestor {
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<EmbeddingCache>>,
    model: ModelConfig,
    concurrency: usize,
}

impl Ingestor {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, model: ModelConfig) -> Self {
        Self {
            embedder,
            cache: None,
            model,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Attach an embedding cache
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Concurrent file width for batch ingestion
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Segment and embed one file, consulting the cache when possible
    ///
    /// Per-segment embedding failures are skipped; a file where every
    /// segment fails is an `Embedding` error.
    pub async fn embed_file(
        &self,
        file_id: &str,
        audio: &AudioBuffer,
        file_path: Option<&Path>,
    ) -> Result<FileEmbeddings> {
        validate_file_id(file_id)?;
        self.model.validate()?;

        // Cache read path: distinct keys per (content, model) pair
        if let (Some(cache), Some(path)) = (&self.cache, file_path) {
            if let Some((vectors, segments)) = cache.get(file_id, path, &self.model) {
                let keys = segments.iter().map(|s| s.segment_id.clone()).collect();
                return Ok(FileEmbeddings {
                    file_id: file_id.to_string(),
                    keys,
                    vectors,
                    segments,
                });
            }
        }

        let windows = Segmenter::new(self.model.segment_length).segment(
            &audio.samples,
            audio.sample_rate,
            file_id,
        )?;
        if windows.is_empty() {
            return Err(EngineError::Embedding(format!(
                "\"{}\" is shorter than one segment",
                file_id
            )));
        }

        // Embedding inference is CPU/hardware-bound; keep it off the
        // async runtime
        let embedder = self.embedder.clone();
        let samples = Arc::new(audio.samples.clone());
        let sample_rate = audio.sample_rate;
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

        let mut vectors = Vec::new();
        let mut segments = Vec::new();
        let mut keys = Vec::new();
        for (window, vector) in windows.into_iter().zip(embedded) {
            match vector {
                Some(vector) => {
                    keys.push(window.meta.segment_id.clone());
                    segments.push(window.meta);
                    vectors.push(vector);
                }
                None => {
                    tracing::warn!(
                        segment_id = %window.meta.segment_id,
                        "Embedding failed for segment, skipping"
                    );
                }
            }
        }

        if vectors.is_empty() {
            return Err(EngineError::Embedding(format!(
                "no segment of \"{}\" embedded successfully",
                file_id
            )));
        }

        // Cache write path: failures are logged inside and never surface
        if let (Some(cache), Some(path)) = (&self.cache, file_path) {
            cache.set(file_id, path, &self.model, &vectors, &segments);
        }

        tracing::debug!(
            file_id,
            segments = vectors.len(),
            "Embedded file"
        );

        Ok(FileEmbeddings {
            file_id: file_id.to_string(),
            keys,
            vectors,
            segments,
        })
    }

    /// Ingest a batch of files concurrently
    ///
    /// Failed files are logged and dropped from the output; the batch
    /// itself never fails.
    pub async fn embed_files(&self, items: Vec<IngestItem>) -> Vec<FileEmbeddings> {
        let total = items.len();
        let results: Vec<Option<FileEmbeddings>> = stream::iter(items)
            .map(|item| async move {
                match self
                    .embed_file(&item.file_id, &item.audio, item.file_path.as_deref())
                    .await
                {
                    Ok(embeddings) => Some(embeddings),
                    Err(e) => {
                        tracing::warn!(
                            file_id = %item.file_id,
                            error = %e,
                            "File ingestion failed, skipping"
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let embedded: Vec<FileEmbeddings> = results.into_iter().flatten().collect();
        tracing::info!(
            total,
            embedded = embedded.len(),
            failed = total - embedded.len(),
            "Batch ingestion complete"
        );
        embedded
    }
}
