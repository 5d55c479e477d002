//! Content hashing utilities
//!
//! SHA-256 hashing of file contents (chunked, memory-bounded) and of
//! in-memory byte slices. Hex digests are the canonical form used for
//! cache keys and deduplication.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Calculate SHA-256 hash of a file, reading in 1MB chunks
///
/// Returns the lowercase hex-encoded digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open file for hashing: {}", e),
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024]; // 1MB chunks

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read file for hashing: {}", e),
            ))
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Async wrapper around [`sha256_file`]
///
/// Hashing is CPU-bound, so the work runs on the blocking pool.
pub async fn sha256_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))?
}

/// Calculate SHA-256 hash of a byte slice
///
/// Returns the lowercase hex-encoded digest.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_bytes_known_vector() {
        // SHA-256 of the empty input
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let payload = b"trackmatch hash test payload";

        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(payload).unwrap();
        drop(f);

        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(payload));
    }

    #[test]
    fn test_sha256_file_missing() {
        let result = sha256_file(Path::new("/nonexistent/trackmatch/file.bin"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sha256_file_async_matches_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        std::fs::write(&path, b"async path").unwrap();

        let sync_hash = sha256_file(&path).unwrap();
        let async_hash = sha256_file_async(&path).await.unwrap();
        assert_eq!(sync_hash, async_hash);
    }
}
