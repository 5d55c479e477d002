//! Graph-based ANN backend (HNSW)
//!
//! Single authoritative graph used for both insertion and search. Level
//! sampling is deterministic in the insertion id, so rebuilding from the
//! same vector sequence reproduces the same graph.
//!
//! Search quality is governed by the beam width `ef`; callers must raise it
//! to at least the requested top-K before every query or recall collapses
//! for deep searches.

use crate::config::MetricType;
use crate::index::flat::metric_distance;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};

/// Hard cap on graph height
const MAX_LAYER_LIMIT: usize = 16;

#[inline]
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic level sampling: `floor(-ln(U) * mL)` with `mL = 1/ln(M)`
fn sampled_level(origin_id: usize, m: usize) -> usize {
    let m = m.max(2) as f64;
    let ml = 1.0 / m.ln();
    let seed = splitmix64(origin_id as u64 ^ 0xA5A5_A5A5_A5A5_A5A5);
    let mut u = ((seed >> 11) as f64) * (1.0 / ((1u64 << 53) as f64));
    if u <= 0.0 {
        u = f64::MIN_POSITIVE;
    } else if u >= 1.0 {
        u = 1.0 - f64::EPSILON;
    }
    ((-u.ln() * ml).floor() as usize).min(MAX_LAYER_LIMIT)
}

/// Min-heap entry: closest candidate pops first
#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    id: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the smallest distance
        other.dist.total_cmp(&self.dist)
    }
}

/// Max-heap entry: farthest result pops first
#[derive(PartialEq)]
struct Farthest {
    dist: f32,
    id: u32,
}

impl Eq for Farthest {}

impl PartialOrd for Farthest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Farthest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.total_cmp(&other.dist)
    }
}

/// HNSW graph backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    dimension: usize,
    m: usize,
    ef_construction: usize,
    vectors: Vec<f32>,
    /// `layers[layer][node]` adjacency; nodes absent from a layer keep an
    /// empty list so every layer stays indexed by node id
    layers: Vec<Vec<Vec<u32>>>,
    entry_point: u32,
    max_layer: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, m: usize, ef_construction: usize) -> Self {
        Self {
            dimension,
            m: m.max(2),
            ef_construction: ef_construction.max(16),
            vectors: Vec::new(),
            layers: vec![Vec::new()],
            entry_point: 0,
            max_layer: 0,
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

    #[inline]
    fn vector_at(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    fn distance_to(&self, query: &[f32], id: u32, metric: MetricType) -> f32 {
        metric_distance(metric, query, self.vector_at(id))
    }

    /// Insert one vector; the caller guarantees dimension and normalization
    pub fn insert(&mut self, vector: &[f32], metric: MetricType) {
        debug_assert_eq!(vector.len(), self.dimension);

        let id = self.len() as u32;
        self.vectors.extend_from_slice(vector);

        // A slot for the new node in every existing layer
        for layer in &mut self.layers {
            layer.push(Vec::new());
        }

        if id == 0 {
            self.entry_point = 0;
            self.max_layer = 0;
            return;
        }

        let level = sampled_level(id as usize, self.m);
        let node_count = (id + 1) as usize;
        while self.layers.len() <= level {
            self.layers.push(vec![Vec::new(); node_count]);
        }

        let mut cur = self.entry_point;
        let mut cur_dist = self.distance_to(vector, cur, metric);

        // Greedy descent through layers above the node's level
        let top = self.max_layer;
        for layer in ((level + 1)..=top).rev() {
            let (next, next_dist) = self.greedy_descent(vector, cur, cur_dist, layer, metric);
            cur = next;
            cur_dist = next_dist;
        }

        // Connect at each layer the node participates in
        for layer in (0..=level.min(top)).rev() {
            let candidates =
                self.search_layer(vector, cur, cur_dist, self.ef_construction, layer, metric);
            let m_max = if layer == 0 { self.m * 2 } else { self.m };

            let selected: Vec<u32> = candidates.iter().take(self.m).map(|&(nbr, _)| nbr).collect();
            for &nbr in &selected {
                self.layers[layer][id as usize].push(nbr);
                self.layers[layer][nbr as usize].push(id);
                if self.layers[layer][nbr as usize].len() > m_max {
                    self.prune_neighbors(layer, nbr, m_max, metric);
                }
            }

            if let Some(&(best, best_dist)) = candidates.first() {
                cur = best;
                cur_dist = best_dist;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = id;
        }
    }

    /// Beam search for the `k` nearest nodes
    ///
    /// Returns `(internal_id, distance)` pairs, ascending distance. `ef` is
    /// clamped up to `k` internally.
    pub fn search(&self, query: &[f32], k: usize, ef: usize, metric: MetricType) -> Vec<(u32, f32)> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }

        let ef = ef.max(k).min(self.len().max(1));
        let mut cur = self.entry_point;
        let mut cur_dist = self.distance_to(query, cur, metric);

        for layer in (1..=self.max_layer).rev() {
            let (next, next_dist) = self.greedy_descent(query, cur, cur_dist, layer, metric);
            cur = next;
            cur_dist = next_dist;
        }

        let mut results = self.search_layer(query, cur, cur_dist, ef, 0, metric);
        results.truncate(k);
        results
    }

    fn greedy_descent(
        &self,
        query: &[f32],
        mut cur: u32,
        mut cur_dist: f32,
        layer: usize,
        metric: MetricType,
    ) -> (u32, f32) {
        loop {
            let mut improved = false;
            for &nbr in &self.layers[layer][cur as usize] {
                let d = self.distance_to(query, nbr, metric);
                if d < cur_dist {
                    cur = nbr;
                    cur_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return (cur, cur_dist);
            }
        }
    }

    /// Bounded beam search within one layer (SEARCH-LAYER subroutine)
    fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        entry_dist: f32,
        ef: usize,
        layer: usize,
        metric: MetricType,
    ) -> Vec<(u32, f32)> {
        let ef = ef.max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut results: BinaryHeap<Farthest> = BinaryHeap::new();

        visited.insert(entry);
        candidates.push(Candidate {
            dist: entry_dist,
            id: entry,
        });
        results.push(Farthest {
            dist: entry_dist,
            id: entry,
        });

        while let Some(candidate) = candidates.pop() {
            if results.len() >= ef {
                let worst = results.peek().map(|r| r.dist).unwrap_or(f32::MAX);
                if candidate.dist > worst {
                    break;
                }
            }

            for &nbr in &self.layers[layer][candidate.id as usize] {
                if !visited.insert(nbr) {
                    continue;
                }
                let d = self.distance_to(query, nbr, metric);
                let admit = results.len() < ef
                    || results.peek().map(|r| d < r.dist).unwrap_or(true);
                if admit {
                    candidates.push(Candidate { dist: d, id: nbr });
                    results.push(Farthest { dist: d, id: nbr });
                    if results.len() > ef {
                        let _ = results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|r| (r.id, r.dist)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Keep only the closest `max_neighbors` links of a node at one layer
    fn prune_neighbors(&mut self, layer: usize, node: u32, max_neighbors: usize, metric: MetricType) {
        let current = std::mem::take(&mut self.layers[layer][node as usize]);
        let mut scored: Vec<(u32, f32)> = current
            .into_iter()
            .filter(|&nbr| nbr != node)
            .map(|nbr| {
                let d = metric_distance(metric, self.vector_at(node), self.vector_at(nbr));
                (nbr, d)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(max_neighbors);
        self.layers[layer][node as usize] = scored.into_iter().map(|(nbr, _)| nbr).collect();
    }
}
