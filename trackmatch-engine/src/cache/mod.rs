//! Content-addressed embedding cache
//!
//! Maps (file content hash, model configuration hash) to the ordered list
//! of segment vectors plus segment metadata, stored on disk as one vector
//! file per segment under a per-key subdirectory:
//!
//! ```text
//! <root>/manifest.json
//! <root>/<key>/seg_0000.vec
//! <root>/<key>/seg_0001.vec
//! <root>/<key>/segments.json
//! ```
//!
//! `get` self-heals: a key whose directory is missing or holds zero vector
//! files is a miss, and its stale manifest record is dropped. `set` never
//! mutates an entry in place; it replaces the whole key directory. Cache
//! write failures are logged and swallowed; a cache problem must never
//! abort the calling query.
//!
//! Concurrency: distinct keys never contend; `get`/`set` on the same key
//! are serialized through a striped lock so the manifest is never torn by
//! two writers racing on one entry.

mod manifest;

pub use manifest::{Manifest, ManifestRecord};

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::models::Segment;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use trackmatch_common::hash::{sha256_bytes, sha256_file};

const MANIFEST_FILE: &str = "manifest.json";
const SEGMENTS_FILE: &str = "segments.json";
const VECTOR_EXT: &str = "vec";
const LOCK_STRIPES: usize = 16;

/// Cache hit/miss statistics, atomically maintained
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn insertions(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    /// Hit ratio in [0, 1]; 0.0 before any lookup
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// On-disk embedding cache handle
///
/// Owned by the caller and shared explicitly (`Arc`); there is no hidden
/// process-wide instance.
pub struct EmbeddingCache {
    root: PathBuf,
    manifest: Mutex<Manifest>,
    key_locks: Vec<Mutex<()>>,
    stats: CacheStats,
}

impl EmbeddingCache {
    /// Open (or create) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::CacheIo(format!("create cache root failed: {}", e)))?;

        let manifest = Manifest::load(&root.join(MANIFEST_FILE));
        tracing::debug!(
            root = %root.display(),
            entries = manifest.entries.len(),
            "Opened embedding cache"
        );

        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
            key_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            stats: CacheStats::default(),
        })
    }

    /// Number of manifest entries
    pub fn len(&self) -> usize {
        self.manifest.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Compute the cache key for a file + model configuration pair
    ///
    /// First 12 hex chars of the file hash, first 8 of the model-config
    /// hash, then the file id (sanitized for the filesystem).
    pub fn cache_key(file_hash: &str, model_hash: &str, file_id: &str) -> String {
        let file_part = &file_hash[..file_hash.len().min(12)];
        let model_part = &model_hash[..model_hash.len().min(8)];
        format!(
            "{}_{}_{}",
            file_part,
            model_part,
            sanitize_component(file_id)
        )
    }

    /// Look up cached vectors + segment metadata for a file under a model
    /// configuration
    ///
    /// Misses (including self-healed stale entries and unreadable files)
    /// return `None`; the caller re-embeds and calls [`set`](Self::set).
    pub fn get(
        &self,
        file_id: &str,
        file_path: &Path,
        model: &ModelConfig,
    ) -> Option<(Vec<Vec<f32>>, Vec<Segment>)> {
        let file_hash = match sha256_file(file_path) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(
                    file_id = %file_id,
                    path = %file_path.display(),
                    error = %e,
                    "Cache lookup could not hash file, treating as miss"
                );
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let key = Self::cache_key(&file_hash, &model.config_hash(), file_id);
        let _guard = self.stripe(&key).lock();

        let entry_dir = self.root.join(&key);
        let vector_files = list_vector_files(&entry_dir);

        if vector_files.is_empty() {
            // Missing or empty directory: drop any stale manifest record
            let mut manifest = self.manifest.lock();
            if manifest.entries.remove(&key).is_some() {
                tracing::debug!(key = %key, "Dropped stale cache manifest record");
                if let Err(e) = manifest.save(&self.root.join(MANIFEST_FILE)) {
                    tracing::warn!(key = %key, error = %e, "Manifest rewrite failed");
                }
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.read_entry(&entry_dir, &vector_files) {
            Ok((vectors, segments)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key = %key,
                    segments = vectors.len(),
                    "Embedding cache hit"
                );
                Some((vectors, segments))
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Cache entry unreadable, treating as miss"
                );
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store vectors + segment metadata for a file under a model
    /// configuration
    ///
    /// Replaces any existing entry for the same key. I/O failures are
    /// logged and swallowed.
    pub fn set(
        &self,
        file_id: &str,
        file_path: &Path,
        model: &ModelConfig,
        vectors: &[Vec<f32>],
        segments: &[Segment],
    ) {
        if let Err(e) = self.try_set(file_id, file_path, model, vectors, segments) {
            tracing::warn!(
                file_id = %file_id,
                error = %e,
                "Cache write failed, continuing without cache"
            );
        }
    }

    fn try_set(
        &self,
        file_id: &str,
        file_path: &Path,
        model: &ModelConfig,
        vectors: &[Vec<f32>],
        segments: &[Segment],
    ) -> Result<()> {
        let file_hash = sha256_file(file_path)
            .map_err(|e| EngineError::CacheIo(format!("hash for cache set failed: {}", e)))?;
        let model_hash = model.config_hash();
        let key = Self::cache_key(&file_hash, &model_hash, file_id);

        let _guard = self.stripe(&key).lock();

        let entry_dir = self.root.join(&key);
        // Replace, never mutate in place
        if entry_dir.exists() {
            std::fs::remove_dir_all(&entry_dir)
                .map_err(|e| EngineError::CacheIo(format!("entry replace failed: {}", e)))?;
        }
        std::fs::create_dir_all(&entry_dir)
            .map_err(|e| EngineError::CacheIo(format!("entry dir create failed: {}", e)))?;

        for (idx, vector) in vectors.iter().enumerate() {
            let path = entry_dir.join(format!("seg_{:04}.{}", idx, VECTOR_EXT));
            let bytes = bincode::serialize(vector)?;
            std::fs::write(&path, bytes)
                .map_err(|e| EngineError::CacheIo(format!("vector write failed: {}", e)))?;
        }

        let sidecar = serde_json::to_string(segments)?;
        std::fs::write(entry_dir.join(SEGMENTS_FILE), sidecar)
            .map_err(|e| EngineError::CacheIo(format!("sidecar write failed: {}", e)))?;

        let mut manifest = self.manifest.lock();
        manifest.entries.insert(
            key.clone(),
            ManifestRecord {
                file_id: file_id.to_string(),
                file_path: file_path.display().to_string(),
                file_hash,
                model_hash,
                num_segments: vectors.len(),
                embedding_dim: vectors.first().map(|v| v.len()).unwrap_or(0),
                cached_at: chrono::Utc::now(),
            },
        );
        manifest.save(&self.root.join(MANIFEST_FILE))?;
        drop(manifest);

        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, segments = vectors.len(), "Cached embeddings");
        Ok(())
    }

    /// Delete all cache entries and reset the manifest
    pub fn clear(&self) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let keys: Vec<String> = manifest.entries.keys().cloned().collect();
        for key in &keys {
            let dir = self.root.join(key);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| EngineError::CacheIo(format!("clear failed for {}: {}", key, e)))?;
            }
        }
        manifest.entries.clear();
        manifest.save(&self.root.join(MANIFEST_FILE))?;
        tracing::info!(removed = keys.len(), "Embedding cache cleared");
        Ok(())
    }

    fn read_entry(
        &self,
        entry_dir: &Path,
        vector_files: &[PathBuf],
    ) -> Result<(Vec<Vec<f32>>, Vec<Segment>)> {
        let mut vectors = Vec::with_capacity(vector_files.len());
        for path in vector_files {
            let bytes = std::fs::read(path)
                .map_err(|e| EngineError::CacheIo(format!("vector read failed: {}", e)))?;
            let vector: Vec<f32> = bincode::deserialize(&bytes)?;
            vectors.push(vector);
        }

        let sidecar = std::fs::read_to_string(entry_dir.join(SEGMENTS_FILE))
            .map_err(|e| EngineError::CacheIo(format!("sidecar read failed: {}", e)))?;
        let segments: Vec<Segment> = serde_json::from_str(&sidecar)?;

        if segments.len() != vectors.len() {
            return Err(EngineError::CacheIo(format!(
                "entry has {} vectors but {} segment records",
                vectors.len(),
                segments.len()
            )));
        }

        Ok((vectors, segments))
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.key_locks[(hasher.finish() as usize) % LOCK_STRIPES]
    }
}

/// Vector files of an entry directory, sorted by segment index
fn list_vector_files(entry_dir: &Path) -> Vec<PathBuf> {
    if !entry_dir.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(entry_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some(VECTOR_EXT))
        .collect();
    files.sort();
    files
}

/// Replace characters that are unsafe in directory names
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
