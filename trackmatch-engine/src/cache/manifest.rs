//! Durable cache manifest
//!
//! JSON map `cache_key -> record`. The manifest is rewritten in full on
//! every mutation.
//!
//! TODO: replace the whole-file rewrite with write-to-temp + atomic rename
//! so a crash mid-save cannot leave a torn manifest.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One cached file+model pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub file_id: String,
    pub file_path: String,
    pub file_hash: String,
    pub model_hash: String,
    pub num_segments: usize,
    pub embedding_dim: usize,
    pub cached_at: DateTime<Utc>,
}

/// In-memory view of the manifest file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestRecord>,
}

impl Manifest {
    /// Load a manifest, returning an empty one when the file is missing
    ///
    /// A corrupt manifest is treated as empty; entry directories on disk
    /// self-heal records back in on the next `set`.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Corrupt cache manifest, starting empty"
                    );
                    Manifest::default()
                }
            },
            Err(_) => Manifest::default(),
        }
    }

    /// Rewrite the manifest file in full
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| EngineError::CacheIo(format!("manifest write failed: {}", e)))
    }
}
