//! Inverted-file ANN backend (IVF)
//!
//! k-means-trained coarse quantizer over the build set; queries probe the
//! `nprobe` nearest lists and scan them exactly. The quantizer must be
//! trained before anything can be appended: `add` against an untrained
//! structure is a structural failure the caller resolves by rebuilding.

use crate::config::MetricType;
use crate::error::{EngineError, Result};
use crate::index::flat::metric_distance;
use crate::utils::vector::normalize;
use serde::{Deserialize, Serialize};

/// IVF backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    nlist: usize,
    nprobe: usize,
    /// Trained centroids, flattened; empty until trained
    centroids: Vec<f32>,
    /// Vector ids per centroid
    lists: Vec<Vec<u32>>,
    /// All vectors, flattened, in insertion order
    vectors: Vec<f32>,
    trained: bool,
}

impl IvfIndex {
    pub fn new(dimension: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dimension,
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            centroids: Vec::new(),
            lists: Vec::new(),
            vectors: Vec::new(),
            trained: false,
        }
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.vectors.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    #[inline]
    fn vector_at(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    fn centroid_at(&self, idx: usize) -> &[f32] {
        &self.centroids[idx * self.dimension..(idx + 1) * self.dimension]
    }

    fn centroid_count(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.centroids.len() / self.dimension
    }

    /// Train the quantizer on the build set and ingest it
    ///
    /// With fewer vectors than `nlist` the effective list count shrinks to
    /// the vector count. An empty build set leaves the structure untrained.
    pub fn train_and_build(
        &mut self,
        vectors: &[Vec<f32>],
        metric: MetricType,
        iterations: usize,
    ) {
        let n = vectors.len();
        if n == 0 {
            return;
        }

        let k = self.nlist.min(n);

        // Deterministic spread initialization: every (n/k)-th vector
        let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * n / k].clone()).collect();
        let mut assignments = vec![0usize; n];

        for _ in 0..iterations.max(1) {
            // Assign
            for (i, v) in vectors.iter().enumerate() {
                assignments[i] = nearest_centroid(&centroids, v, metric);
            }

            // Recompute means
            let mut sums = vec![vec![0.0f32; self.dimension]; k];
            let mut counts = vec![0usize; k];
            for (i, v) in vectors.iter().enumerate() {
                let c = assignments[i];
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += x;
                }
            }
            for c in 0..k {
                if counts[c] == 0 {
                    continue; // empty cluster keeps its previous centroid
                }
                for s in sums[c].iter_mut() {
                    *s /= counts[c] as f32;
                }
                if metric.requires_normalization() && !normalize(&mut sums[c]) {
                    continue; // degenerate mean, keep previous centroid
                }
                centroids[c] = std::mem::take(&mut sums[c]);
            }
        }

        // Final assignment into inverted lists
        self.centroids = centroids.concat();
        self.lists = vec![Vec::new(); k];
        self.vectors.clear();
        for (i, v) in vectors.iter().enumerate() {
            let c = nearest_centroid_flat(&self.centroids, self.dimension, v, metric);
            self.lists[c].push(i as u32);
            self.vectors.extend_from_slice(v);
        }
        self.trained = true;

        tracing::debug!(
            vectors = n,
            lists = k,
            "Trained IVF quantizer"
        );
    }

    /// Append one vector to its nearest list
    pub fn add(&mut self, vector: &[f32], metric: MetricType) -> Result<()> {
        if !self.trained {
            return Err(EngineError::UnsupportedIncrementalAdd(
                "IVF quantizer is not trained; rebuild the index".to_string(),
            ));
        }
        let id = self.len() as u32;
        let c = nearest_centroid_flat(&self.centroids, self.dimension, vector, metric);
        self.lists[c].push(id);
        self.vectors.extend_from_slice(vector);
        Ok(())
    }

    /// Probe the `nprobe` nearest lists and scan them exactly
    ///
    /// Returns `(internal_id, distance)` pairs, ascending distance.
    pub fn search(&self, query: &[f32], k: usize, metric: MetricType) -> Vec<(u32, f32)> {
        if !self.trained || self.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut centroid_scores: Vec<(usize, f32)> = (0..self.centroid_count())
            .map(|c| (c, metric_distance(metric, query, self.centroid_at(c))))
            .collect();
        centroid_scores.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut scored: Vec<(u32, f32)> = Vec::new();
        for &(c, _) in centroid_scores.iter().take(self.nprobe) {
            for &id in &self.lists[c] {
                scored.push((id, metric_distance(metric, query, self.vector_at(id))));
            }
        }
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        scored
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32], metric: MetricType) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = metric_distance(metric, v, centroid);
        if d < best_dist {
            best = c;
            best_dist = d;
        }
    }
    best
}

fn nearest_centroid_flat(centroids: &[f32], dimension: usize, v: &[f32], metric: MetricType) -> usize {
    let k = centroids.len() / dimension;
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for c in 0..k {
        let centroid = &centroids[c * dimension..(c + 1) * dimension];
        let d = metric_distance(metric, v, centroid);
        if d < best_dist {
            best = c;
            best_dist = d;
        }
    }
    best
}
