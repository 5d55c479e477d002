//! Audio segment metadata and the segment-key contract
//!
//! A segment key addresses one indexed vector and has the form
//! `{file_id}_seg_{0000}`. The prefix before `_seg_` is the only supported
//! way to map a hit back to its source track, so file ids containing the
//! literal `_seg_` are rejected at ingestion time.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Separator between file id and segment index in a segment key
pub const SEGMENT_KEY_SEPARATOR: &str = "_seg_";

/// One fixed window of a decoded audio file
///
/// Immutable once created. Only the vector and this metadata are ever
/// persisted (as the cache sidecar); segments themselves are recomputed
/// deterministically from the audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// `{file_stem}_seg_{0000}`
    pub segment_id: String,
    /// Source file id
    pub file_id: String,
    /// Window start, seconds
    pub start_time: f32,
    /// Window end, seconds
    pub end_time: f32,
    /// Scale this window belongs to, seconds
    pub scale_length: f32,
    /// Evidence weight of this scale
    pub scale_weight: f32,
    /// Sample rate of the source buffer, Hz
    pub sample_rate: u32,
}

impl Segment {
    /// Window duration in seconds
    pub fn duration(&self) -> f32 {
        self.end_time - self.start_time
    }
}

/// Build the segment key for the `index`-th window of `file_id`
pub fn segment_key(file_id: &str, index: usize) -> String {
    format!("{}{}{:04}", file_id, SEGMENT_KEY_SEPARATOR, index)
}

/// Recover the file id from a segment key
///
/// Splits on `_seg_` and takes the prefix. Returns `None` for keys that
/// never contained the separator.
pub fn file_id_from_segment_key(key: &str) -> Option<&str> {
    key.split_once(SEGMENT_KEY_SEPARATOR).map(|(prefix, _)| prefix)
}

/// Reject file ids that would make segment keys ambiguous
pub fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty() {
        return Err(EngineError::Configuration(
            "file_id must be non-empty".to_string(),
        ));
    }
    if file_id.contains(SEGMENT_KEY_SEPARATOR) {
        return Err(EngineError::Configuration(format!(
            "file_id \"{}\" contains the reserved substring \"{}\"",
            file_id, SEGMENT_KEY_SEPARATOR
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_key_zero_padded() {
        assert_eq!(segment_key("track-a", 0), "track-a_seg_0000");
        assert_eq!(segment_key("track-a", 37), "track-a_seg_0037");
        assert_eq!(segment_key("track-a", 1234), "track-a_seg_1234");
    }

    #[test]
    fn test_round_trip() {
        for index in [0usize, 1, 99, 9999] {
            let key = segment_key("some_file.flac", index);
            assert_eq!(file_id_from_segment_key(&key), Some("some_file.flac"));
        }
    }

    #[test]
    fn test_file_id_without_separator() {
        assert_eq!(file_id_from_segment_key("plain-id"), None);
    }

    #[test]
    fn test_validate_rejects_reserved_substring() {
        assert!(validate_file_id("good-id").is_ok());
        assert!(validate_file_id("bad_seg_id").is_err());
        assert!(validate_file_id("").is_err());
    }

    #[test]
    fn test_duration() {
        let seg = Segment {
            segment_id: segment_key("f", 0),
            file_id: "f".to_string(),
            start_time: 2.5,
            end_time: 7.5,
            scale_length: 5.0,
            scale_weight: 1.0,
            sample_rate: 16000,
        };
        assert!((seg.duration() - 5.0).abs() < 1e-6);
    }
}
