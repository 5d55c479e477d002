//! Shared test helpers: deterministic audio and embedding generation
//!
//! The embedder maps each audio window to a pseudo-random unit vector
//! derived from the window's content, so identical windows embed
//! identically and distinct windows are near-orthogonal, exactly the
//! contrast the retrieval pipeline needs for end-to-end assertions
//! without a real model.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use trackmatch_engine::config::ModelConfig;
use trackmatch_engine::models::AudioBuffer;
use trackmatch_engine::services::EmbeddingProvider;

/// Test sample rate; low to keep buffers small
pub const SR: u32 = 100;
/// Test embedding dimension
pub const DIM: usize = 16;

/// Initialize test logging once; honors `RUST_LOG`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic noise buffer; distinct seeds give distinct content
pub fn noise_audio(seed: u64, seconds: usize) -> AudioBuffer {
    let samples: Vec<f32> = (0..seconds * SR as usize)
        .map(|i| {
            let bits = splitmix64(seed.wrapping_mul(0x1000_0001).wrapping_add(i as u64));
            ((bits >> 40) as f32 / (1u64 << 24) as f32) - 0.5
        })
        .collect();
    AudioBuffer::new(samples, SR)
}

/// Model configuration matching the test embedder
pub fn test_model() -> ModelConfig {
    ModelConfig {
        embedding_dim: DIM,
        segment_length: 5.0,
        sample_rate: SR,
        model_type: "hash-projection-test".to_string(),
    }
}

/// Content-hashing embedder: one unit vector per distinct window
pub struct HashProjectionEmbedder {
    dim: usize,
}

impl HashProjectionEmbedder {
    pub fn new() -> Self {
        Self { dim: DIM }
    }
}

impl EmbeddingProvider for HashProjectionEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, samples: &[f32], _sample_rate: u32) -> Option<Vec<f32>> {
        if samples.is_empty() {
            return None;
        }
        // Content hash over quantized samples
        let mut h = 0xcbf2_9ce4_8422_2325u64;
        for &s in samples {
            let q = (s * 10_000.0).round() as i64 as u64;
            h = h.wrapping_mul(0x0100_0000_01b3).wrapping_add(q);
        }
        // Project the hash to a pseudo-random direction
        let mut v: Vec<f32> = (0..self.dim)
            .map(|d| {
                let bits = splitmix64(h ^ (d as u64).wrapping_mul(0x9E37_79B9));
                ((bits >> 40) as f32 / (1u64 << 24) as f32) - 0.5
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return None;
        }
        for x in v.iter_mut() {
            *x /= norm;
        }
        Some(v)
    }
}

/// Wrapper that fails a fixed set of embed calls (by call order)
pub struct FlakyEmbedder {
    inner: HashProjectionEmbedder,
    fail_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn failing_calls(fail_calls: Vec<usize>) -> Self {
        Self {
            inner: HashProjectionEmbedder::new(),
            fail_calls,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingProvider for FlakyEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, samples: &[f32], sample_rate: u32) -> Option<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.contains(&call) {
            return None;
        }
        self.inner.embed(samples, sample_rate)
    }
}
