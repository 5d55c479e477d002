//! Fixed-window audio segmentation
//!
//! Pure function over a decoded mono buffer: same input, same windows.
//! Window ids are zero-indexed and zero-padded (`{stem}_seg_{0000}`); a
//! trailing partial window shorter than one full segment is dropped, never
//! padded.

use crate::error::{EngineError, Result};
use crate::models::{segment_key, validate_file_id, Segment};

/// One cut window: metadata plus its sample range in the source buffer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub meta: Segment,
    pub start_sample: usize,
    pub end_sample: usize,
}

/// Deterministic fixed-window segmenter
///
/// Hop resolution: an explicit hop wins; otherwise
/// `hop = segment_samples * (1 - overlap_ratio)` when an overlap ratio is
/// set, else `hop = segment_samples` (no overlap).
#[derive(Debug, Clone)]
pub struct Segmenter {
    segment_length: f32,
    overlap_ratio: Option<f32>,
    hop_seconds: Option<f32>,
    scale_weight: f32,
}

impl Segmenter {
    /// Create a segmenter for windows of `segment_length` seconds
    pub fn new(segment_length: f32) -> Self {
        Self {
            segment_length,
            overlap_ratio: None,
            hop_seconds: None,
            scale_weight: 1.0,
        }
    }

    /// Overlap adjacent windows by this fraction of a window
    pub fn with_overlap_ratio(mut self, overlap_ratio: f32) -> Self {
        self.overlap_ratio = Some(overlap_ratio);
        self
    }

    /// Explicit hop between window starts, in seconds
    pub fn with_hop_seconds(mut self, hop_seconds: f32) -> Self {
        self.hop_seconds = Some(hop_seconds);
        self
    }

    /// Evidence weight stamped on every produced segment
    pub fn with_scale_weight(mut self, scale_weight: f32) -> Self {
        self.scale_weight = scale_weight;
        self
    }

    /// Cut `samples` into fixed windows
    ///
    /// Returns an empty list when the buffer is shorter than one window.
    pub fn segment(
        &self,
        samples: &[f32],
        sample_rate: u32,
        file_stem: &str,
    ) -> Result<Vec<AudioSegment>> {
        validate_file_id(file_stem)?;

        if sample_rate == 0 {
            return Err(EngineError::Configuration(
                "sample_rate must be non-zero".to_string(),
            ));
        }
        if !self.segment_length.is_finite() || self.segment_length <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "segment length must be positive, got {}",
                self.segment_length
            )));
        }
        if let Some(ratio) = self.overlap_ratio {
            if !(0.0..1.0).contains(&ratio) {
                return Err(EngineError::Configuration(format!(
                    "overlap_ratio must be in [0, 1), got {}",
                    ratio
                )));
            }
        }

        let segment_samples = (self.segment_length * sample_rate as f32).round() as usize;
        if segment_samples == 0 {
            return Err(EngineError::Configuration(
                "segment length rounds to zero samples".to_string(),
            ));
        }

        let hop_samples = match (self.hop_seconds, self.overlap_ratio) {
            (Some(hop), _) => (hop * sample_rate as f32).round() as usize,
            (None, Some(ratio)) => (segment_samples as f32 * (1.0 - ratio)).round() as usize,
            (None, None) => segment_samples,
        }
        .max(1);

        let mut segments = Vec::new();
        let mut start = 0usize;
        let mut index = 0usize;

        // Trailing partial windows are dropped
        while start + segment_samples <= samples.len() {
            let end = start + segment_samples;
            segments.push(AudioSegment {
                meta: Segment {
                    segment_id: segment_key(file_stem, index),
                    file_id: file_stem.to_string(),
                    start_time: start as f32 / sample_rate as f32,
                    end_time: end as f32 / sample_rate as f32,
                    scale_length: self.segment_length,
                    scale_weight: self.scale_weight,
                    sample_rate,
                },
                start_sample: start,
                end_sample: end,
            });
            index += 1;
            start += hop_samples;
        }

        tracing::debug!(
            file_stem,
            segment_length = self.segment_length,
            hop_samples,
            windows = segments.len(),
            "Segmented audio buffer"
        );

        Ok(segments)
    }
}
