//! Embedding cache behavior through the engine facade

mod helpers;

use helpers::{noise_audio, test_model, HashProjectionEmbedder, DIM};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use trackmatch_engine::cache::EmbeddingCache;
use trackmatch_engine::config::{IndexConfig, IndexKind, QueryConfig};
use trackmatch_engine::index::VectorIndex;
use trackmatch_engine::models::QueryRequest;
use trackmatch_engine::services::{IngestItem, Ingestor};
use trackmatch_engine::MatchEngine;

async fn build_index(tracks: usize) -> Arc<RwLock<VectorIndex>> {
    let ingestor = Ingestor::new(Arc::new(HashProjectionEmbedder::new()), test_model());
    let items: Vec<IngestItem> = (0..tracks)
        .map(|i| IngestItem {
            file_id: format!("track-{}", i),
            audio: noise_audio(i as u64 + 1, 30),
            file_path: None,
        })
        .collect();
    let files = ingestor.embed_files(items).await;

    let mut vectors = Vec::new();
    let mut keys = Vec::new();
    for file in &files {
        vectors.extend(file.vectors.iter().cloned());
        keys.extend(file.keys.iter().cloned());
    }
    Arc::new(RwLock::new(
        VectorIndex::build(&vectors, &keys, &IndexConfig::new(DIM, IndexKind::Flat)).unwrap(),
    ))
}

fn single_scale_config() -> QueryConfig {
    QueryConfig {
        multi_scale_lengths: vec![5.0],
        multi_scale_weights: vec![1.0],
        overlap_ratio: 0.0,
        ..QueryConfig::default()
    }
}

/// Stand-in for the on-disk audio container the cache hashes
fn write_clip_file(dir: &std::path::Path, name: &str, seed: u64) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("clip-content-{}", seed)).unwrap();
    path
}

#[tokio::test]
async fn test_second_query_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(EmbeddingCache::open(dir.path().join("cache")).unwrap());
    let clip_path = write_clip_file(dir.path(), "clip.wav", 2);

    let index = build_index(3).await;
    let engine = MatchEngine::new(
        index,
        Arc::new(HashProjectionEmbedder::new()),
        test_model(),
    )
    .unwrap()
    .with_cache(cache.clone())
    .with_query_config(single_scale_config());

    let request = || {
        QueryRequest::new("query-clip", noise_audio(2, 30))
            .with_file_path(clip_path.clone())
    };

    let first = engine.identify(request()).await.unwrap();
    assert_eq!(cache.stats().insertions(), 1);
    assert_eq!(cache.stats().hits(), 0);

    let second = engine.identify(request()).await.unwrap();
    assert_eq!(cache.stats().hits(), 1);

    // Cached evidence must reproduce the fresh verdict
    assert_eq!(
        first.best().unwrap().file_id,
        second.best().unwrap().file_id
    );
    assert_eq!(first.top_candidates, second.top_candidates);
}

#[tokio::test]
async fn test_each_scale_caches_under_its_own_identity() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(EmbeddingCache::open(dir.path().join("cache")).unwrap());
    let clip_path = write_clip_file(dir.path(), "clip.wav", 1);

    let index = build_index(2).await;
    let mut config = QueryConfig {
        multi_scale_lengths: vec![5.0, 3.0],
        multi_scale_weights: vec![1.0, 0.6],
        overlap_ratio: 0.0,
        ..QueryConfig::default()
    };
    config.early_stop.enabled = false;

    let engine = MatchEngine::new(
        index,
        Arc::new(HashProjectionEmbedder::new()),
        test_model(),
    )
    .unwrap()
    .with_cache(cache.clone())
    .with_query_config(config);

    let response = engine
        .identify(
            QueryRequest::new("query-clip", noise_audio(1, 30)).with_file_path(clip_path.clone()),
        )
        .await
        .unwrap();

    // Both scales ran and cached independently
    assert_eq!(response.metadata.scales_used.len(), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_cache_survives_vanished_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache_root = dir.path().join("cache");
    let cache = Arc::new(EmbeddingCache::open(&cache_root).unwrap());
    let clip_path = write_clip_file(dir.path(), "clip.wav", 2);

    let index = build_index(3).await;
    let engine = MatchEngine::new(
        index,
        Arc::new(HashProjectionEmbedder::new()),
        test_model(),
    )
    .unwrap()
    .with_cache(cache.clone())
    .with_query_config(single_scale_config());

    let request = || {
        QueryRequest::new("query-clip", noise_audio(2, 30))
            .with_file_path(clip_path.clone())
    };

    engine.identify(request()).await.unwrap();
    assert_eq!(cache.len(), 1);

    // Entry directories vanish behind the manifest's back
    for entry in std::fs::read_dir(&cache_root).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_dir() {
            std::fs::remove_dir_all(entry.path()).unwrap();
        }
    }

    // Self-heals: re-embeds, re-caches, same verdict
    let response = engine.identify(request()).await.unwrap();
    assert_eq!(response.best().unwrap().file_id, "track-1");
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().insertions(), 2);
}
