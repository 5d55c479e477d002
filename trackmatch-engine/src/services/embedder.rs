//! Embedding provider seam
//!
//! The embedding model is an external collaborator: a black-box function
//! from a decoded audio window to a fixed-length vector. The engine only
//! depends on this trait and tolerates per-item failure; it must behave the
//! same whether a provider embeds sequentially or in batches.

/// Injected embedding inference
///
/// Implementations must be safe to call from multiple worker threads.
/// A `None` result means inference failed for that window; the caller skips
/// the window and continues.
pub trait EmbeddingProvider: Send + Sync {
    /// Output vector dimension
    fn dimension(&self) -> usize;

    /// Embed one audio window
    fn embed(&self, samples: &[f32], sample_rate: u32) -> Option<Vec<f32>>;

    /// Embed a batch of windows
    ///
    /// The default implementation embeds sequentially; batch-capable
    /// providers override this. The output length must equal the input
    /// length, with `None` in failed slots.
    fn embed_batch(&self, windows: &[(&[f32], u32)]) -> Vec<Option<Vec<f32>>> {
        windows
            .iter()
            .map(|(samples, sample_rate)| self.embed(samples, *sample_rate))
            .collect()
    }
}
