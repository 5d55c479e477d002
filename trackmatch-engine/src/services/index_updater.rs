//! Incremental index updates
//!
//! Merges newly embedded files into an existing index without a rebuild.
//! Files whose id already prefixes an indexed segment key are skipped, so
//! replaying an ingestion batch is a no-op. The index is exclusively
//! locked for the whole merge; queries wait rather than observe a
//! half-extended key list.

use crate::error::Result;
use crate::index::VectorIndex;
use crate::services::ingest::FileEmbeddings;
use parking_lot::RwLock;

/// Outcome of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added_files: usize,
    pub skipped_files: usize,
    pub added_vectors: usize,
}

/// Merge embedded files into the index, deduplicating by file id
///
/// Propagates `UnsupportedIncrementalAdd` untouched; the caller must fall
/// back to a full rebuild for index kinds that cannot append.
pub fn merge_into_index(
    index: &RwLock<VectorIndex>,
    files: &[FileEmbeddings],
) -> Result<MergeReport> {
    let mut index = index.write();
    let mut existing = index.indexed_file_ids();
    let mut report = MergeReport::default();

    for file in files {
        if existing.contains(&file.file_id) {
            tracing::debug!(
                file_id = %file.file_id,
                "File already indexed, skipping incremental add"
            );
            report.skipped_files += 1;
            continue;
        }

        // Vectors and keys extend the index in identical order; the
        // sidecar's key list stays in lock-step with the body
        index.add(&file.vectors, &file.keys)?;
        existing.insert(file.file_id.clone());
        report.added_files += 1;
        report.added_vectors += file.vectors.len();
    }

    tracing::info!(
        added_files = report.added_files,
        skipped_files = report.skipped_files,
        added_vectors = report.added_vectors,
        index_size = index.size(),
        "Incremental index update complete"
    );

    Ok(report)
}
