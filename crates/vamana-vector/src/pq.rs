//! Per-subspace product-quantization codebooks, trained by mini-batch SGD
//! k-means, plus the query-time lookup-table machinery that turns a byte
//! code row into an approximate distance.
//!
//! Every dimension belongs to exactly one of `Q` codebooks; each codebook
//! holds `K` centroids of width `D/Q`. Training runs independently per
//! subspace, so [`PqCodebooks::train`] fans the `Q` mini-batch k-means runs
//! out across a `rayon` thread pool rather than training them one at a time.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use vamana_core::{PqParams, Result, VamanaError};

use crate::distance::{distance_x4, l2, Metric};

/// Maximum mini-batch k-means iterations before giving up on convergence.
const MAX_ITERATIONS: usize = 1000;
/// Stop early once the fraction of vectors that changed cluster assignment
/// in one iteration falls to or below this threshold.
const CONVERGENCE_THRESHOLD: f64 = 0.001;

/// Trained codebook set: `Q` independent tables of `K` centroids each.
#[derive(Debug, Clone)]
pub struct PqCodebooks {
    params: PqParams,
    /// Flattened `[subspace][centroid][dim]`, row-major.
    centroids: Vec<f32>,
}

impl PqCodebooks {
    /// Train codebooks over `vectors`, one independent mini-batch k-means
    /// run per subspace. `seed` makes training reproducible.
    pub fn train(params: PqParams, vectors: &[Vec<f32>], seed: u64) -> Result<Self> {
        if vectors.is_empty() {
            return Err(VamanaError::Config(
                "cannot train PQ codebooks on an empty vector set".into(),
            ));
        }
        for v in vectors {
            if v.len() != params.dimension {
                return Err(VamanaError::Config(format!(
                    "vector dimension {} does not match configured dimension {}",
                    v.len(),
                    params.dimension
                )));
            }
        }

        let sub_dim = params.subspace_dim();
        let mut centroids = vec![0.0f32; params.num_subspaces * params.num_centroids * sub_dim];

        // Each subspace's k-means run only touches its own slice of
        // `vectors`' columns and its own RNG stream, so the `Q` independent
        // trainings fan out across a rayon thread pool with no shared
        // mutable state to coordinate.
        let learned_per_subspace: Vec<Vec<f32>> = (0..params.num_subspaces)
            .into_par_iter()
            .map(|q| {
                let offset = q * sub_dim;
                let subspace_vectors: Vec<&[f32]> = vectors
                    .iter()
                    .map(|v| &v[offset..offset + sub_dim])
                    .collect();
                let sub_seed = seed.wrapping_add(q as u64).wrapping_mul(0x9E3779B97F4A7C15);
                let mut sub_rng = StdRng::seed_from_u64(sub_seed);
                train_subspace(
                    &subspace_vectors,
                    params.num_centroids,
                    params.batch_size,
                    &mut sub_rng,
                )
            })
            .collect();

        for (q, learned) in learned_per_subspace.into_iter().enumerate() {
            let dst = &mut centroids
                [q * params.num_centroids * sub_dim..(q + 1) * params.num_centroids * sub_dim];
            dst.copy_from_slice(&learned);
        }

        Ok(PqCodebooks { params, centroids })
    }

    /// The parameters this codebook set was trained with.
    pub fn params(&self) -> &PqParams {
        &self.params
    }

    /// Flattened `[subspace][centroid][dim]` centroid storage, for writing
    /// to the on-disk sidecar.
    pub fn centroids_raw(&self) -> &[f32] {
        &self.centroids
    }

    /// Reconstruct a codebook set from previously trained centroids (e.g.
    /// read back from an on-disk sidecar). `centroids` must have length
    /// `num_subspaces * num_centroids * subspace_dim`.
    pub fn from_raw(params: PqParams, centroids: Vec<f32>) -> Result<Self> {
        let expected = params.num_subspaces * params.num_centroids * params.subspace_dim();
        if centroids.len() != expected {
            return Err(VamanaError::Corruption(format!(
                "PQ centroid sidecar has {} floats, expected {expected}",
                centroids.len()
            )));
        }
        Ok(PqCodebooks { params, centroids })
    }

    fn centroid(&self, subspace: usize, k: usize) -> &[f32] {
        let sub_dim = self.params.subspace_dim();
        let base = (subspace * self.params.num_centroids + k) * sub_dim;
        &self.centroids[base..base + sub_dim]
    }

    /// Encode `v` into one byte per subspace: the index of the nearest
    /// centroid in each subspace's codebook.
    pub fn encode(&self, v: &[f32]) -> Vec<u8> {
        let sub_dim = self.params.subspace_dim();
        let mut code = vec![0u8; self.params.num_subspaces];
        for q in 0..self.params.num_subspaces {
            let sub = &v[q * sub_dim..(q + 1) * sub_dim];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for k in 0..self.params.num_centroids {
                let d = l2(sub, self.centroid(q, k));
                if d < best_dist {
                    best_dist = d;
                    best = k;
                }
            }
            code[q] = best as u8;
        }
        code
    }

    /// Encode every vector in `vectors` into one contiguous `N × Q` byte
    /// array.
    pub fn encode_all(&self, vectors: &[Vec<f32>]) -> Vec<u8> {
        let mut out = Vec::with_capacity(vectors.len() * self.params.num_subspaces);
        for v in vectors {
            out.extend(self.encode(v));
        }
        out
    }

    /// Reconstruct an approximate vector from a code row by concatenating
    /// each subspace's chosen centroid. The inverse of [`Self::encode`], up
    /// to quantization error.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let sub_dim = self.params.subspace_dim();
        let mut out = vec![0.0f32; self.params.dimension];
        for (q, &c) in code.iter().enumerate() {
            out[q * sub_dim..(q + 1) * sub_dim].copy_from_slice(self.centroid(q, c as usize));
        }
        out
    }

    /// Build a query-time distance lookup table: for every subspace, the
    /// distance from the query's sub-vector to each of that subspace's
    /// centroids.
    pub fn build_lookup_table(&self, query: &[f32]) -> LookupTable {
        let sub_dim = self.params.subspace_dim();
        let mut table = vec![0.0f32; self.params.num_subspaces * self.params.num_centroids];
        for q in 0..self.params.num_subspaces {
            let sub = &query[q * sub_dim..(q + 1) * sub_dim];
            for k in 0..self.params.num_centroids {
                table[q * self.params.num_centroids + k] = l2(sub, self.centroid(q, k));
            }
        }
        LookupTable {
            num_subspaces: self.params.num_subspaces,
            num_centroids: self.params.num_centroids,
            table,
        }
    }
}

/// A query-specific precomputed distance table (`Q × K` floats).
#[derive(Debug, Clone)]
pub struct LookupTable {
    num_subspaces: usize,
    num_centroids: usize,
    table: Vec<f32>,
}

impl LookupTable {
    /// Approximate distance for a single PQ code row: `Σ_q table[q][code[q]]`.
    pub fn distance(&self, code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.num_subspaces);
        let mut sum = 0.0f32;
        for (q, &c) in code.iter().enumerate() {
            sum += self.table[q * self.num_centroids + c as usize];
        }
        sum
    }

    /// Approximate distance for four code rows at once, amortizing the
    /// table indexing across the quartet.
    pub fn distance_x4(&self, codes: [&[u8]; 4]) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        for (o, code) in out.iter_mut().zip(codes.iter()) {
            *o = self.distance(code);
        }
        out
    }
}

/// Select `k` centroid seeds from `samples` per the initialization rule:
/// use every vector when `n <= k`, shuffled sampling when `n < 4k`,
/// rejection sampling of distinct indices otherwise.
fn init_centroids(samples: &[&[f32]], k: usize, dim: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = samples.len();
    let mut centroids = vec![0.0f32; k * dim];

    if n <= k {
        for c in 0..k {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(samples[c % n]);
        }
    } else if n < 4 * k {
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(rng);
        for (c, &idx) in indices.iter().take(k).enumerate() {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(samples[idx]);
        }
    } else {
        let mut chosen = HashSet::with_capacity(k);
        while chosen.len() < k {
            let idx = rng.gen_range(0..n);
            chosen.insert(idx);
        }
        for (c, idx) in chosen.into_iter().enumerate() {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(samples[idx]);
        }
    }

    centroids
}

/// Train one subspace's `K`-centroid codebook by mini-batch SGD k-means.
///
/// Each cluster's learning rate is `1 / count(c)`, so early assignments
/// move a centroid a lot and later ones refine it. Convergence is judged
/// by the fraction of the *entire* dataset (not just the batch) whose
/// nearest-centroid assignment changed since the previous iteration.
pub fn train_subspace(samples: &[&[f32]], k: usize, batch_size: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = samples.len();
    let dim = samples[0].len();
    let mut centroids = init_centroids(samples, k, dim, rng);
    let mut counts = vec![0u64; k];

    let effective_batch = if batch_size % 4 == 0 && batch_size > 0 {
        batch_size
    } else {
        16
    };

    let mut assignments = assign_all(samples, &centroids, dim);

    for _ in 0..MAX_ITERATIONS {
        for _ in 0..effective_batch {
            let i = rng.gen_range(0..n);
            let sample = samples[i];
            let c = nearest_centroid(sample, &centroids, k, dim);
            counts[c] += 1;
            let lr = 1.0 / counts[c] as f32;
            let centroid = &mut centroids[c * dim..(c + 1) * dim];
            for d in 0..dim {
                centroid[d] += lr * (sample[d] - centroid[d]);
            }
        }

        let new_assignments = assign_all(samples, &centroids, dim);
        let changed = new_assignments
            .iter()
            .zip(assignments.iter())
            .filter(|(a, b)| a != b)
            .count();
        assignments = new_assignments;

        if (changed as f64) / (n as f64) <= CONVERGENCE_THRESHOLD {
            break;
        }
    }

    centroids
}

fn nearest_centroid(sample: &[f32], centroids: &[f32], k: usize, dim: usize) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for c in 0..k {
        let d = l2(sample, &centroids[c * dim..(c + 1) * dim]);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

fn assign_all(samples: &[&[f32]], centroids: &[f32], dim: usize) -> Vec<usize> {
    let k = centroids.len() / dim;
    samples
        .chunks(4)
        .flat_map(|chunk| {
            if chunk.len() == 4 {
                assign_quartet(chunk, centroids, k, dim)
            } else {
                chunk
                    .iter()
                    .map(|s| nearest_centroid(s, centroids, k, dim))
                    .collect::<Vec<_>>()
            }
        })
        .collect()
}

fn assign_quartet(chunk: &[&[f32]], centroids: &[f32], k: usize, dim: usize) -> Vec<usize> {
    let mut best = [0usize; 4];
    let mut best_dist = [f32::INFINITY; 4];
    for c in 0..k {
        let centroid = &centroids[c * dim..(c + 1) * dim];
        let dists = distance_x4(
            Metric::L2,
            centroid,
            [chunk[0], chunk[1], chunk[2], chunk[3]],
        );
        for i in 0..4 {
            if dists[i] < best_dist[i] {
                best_dist[i] = dists[i];
                best[i] = c;
            }
        }
    }
    best.to_vec()
}
