//! Mutable in-memory build graph: random-edge seeding, medoid selection,
//! and `RobustPrune`, all guarded by a per-vertex seqlock rather than a
//! heavyweight mutex.
//!
//! Each vertex's edge list is protected by an atomic 64-bit version: even
//! means quiescent, odd means exclusively held. [`MemoryGraph::acquire_vertex`]
//! hands back a [`VertexGuard`] that releases the lock (bumping the version
//! to the next even number) on drop. Readers that don't need exclusive
//! access — [`MemoryGraph::fetch_neighbours`] — retry until they observe
//! the same even version before and after copying the edge list, so they
//! never block a writer and are never blocked by one.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use vamana_core::{GraphParams, Result, VamanaError, VectorReader};
use vamana_vector::{distance_x4, Metric};

use crate::queue::BoundedQueue;

/// Mutable adjacency graph built once, then frozen and flushed to disk.
pub struct MemoryGraph {
    params: GraphParams,
    metric: Metric,
    n: usize,
    vectors: Vec<f32>,
    edges: Vec<UnsafeCell<Vec<u32>>>,
    versions: Vec<AtomicU64>,
}

// SAFETY: every mutable access to `edges[i]` happens either through a
// `VertexGuard` (exclusive, serialized by the seqlock CAS) or through
// `fetch_neighbours`'s version-checked read. No two `VertexGuard`s for the
// same vertex can be live simultaneously, and a reader that observes an
// odd version retries rather than dereferencing.
unsafe impl Sync for MemoryGraph {}

impl MemoryGraph {
    /// Copy every vector out of `reader` into a flat in-memory segment and
    /// allocate empty per-vertex edge lists.
    pub fn new(params: GraphParams, metric: Metric, reader: &dyn VectorReader) -> Result<Self> {
        if reader.dimensions() != params.dimension {
            return Err(VamanaError::Config(format!(
                "vector reader dimension {} does not match graph dimension {}",
                reader.dimensions(),
                params.dimension
            )));
        }
        let n = reader.size();
        let mut vectors = Vec::with_capacity(n * params.dimension);
        for i in 0..n {
            vectors.extend_from_slice(reader.read(i));
        }
        let edges = (0..n).map(|_| UnsafeCell::new(Vec::new())).collect();
        let versions = (0..n).map(|_| AtomicU64::new(0)).collect();

        Ok(MemoryGraph {
            params,
            metric,
            n,
            vectors,
            edges,
            versions,
        })
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Configured maximum out-degree (`M`).
    pub fn max_degree(&self) -> usize {
        self.params.max_degree
    }

    /// Vector dimensionality (`D`).
    pub fn dimension(&self) -> usize {
        self.params.dimension
    }

    /// Borrow vertex `i`'s vector payload.
    pub fn vector_at(&self, i: usize) -> &[f32] {
        self.vector(i)
    }

    fn vector(&self, i: usize) -> &[f32] {
        let d = self.params.dimension;
        &self.vectors[i * d..(i + 1) * d]
    }

    fn distance(&self, a: usize, b: usize) -> f32 {
        self.metric.distance(self.vector(a), self.vector(b))
    }

    fn distance_to_vec(&self, a: usize, v: &[f32]) -> f32 {
        self.metric.distance(self.vector(a), v)
    }

    /// Acquire the exclusive edge-mutation lock for vertex `i`.
    ///
    /// # Errors
    /// Returns [`VamanaError::InvariantViolation`] if the lock is already
    /// held — acquiring a held vertex lock is a caller bug, never a
    /// condition to retry.
    pub fn acquire_vertex(&self, i: usize) -> Result<VertexGuard<'_>> {
        let version = self.versions[i].load(Ordering::Acquire);
        if version % 2 == 1 {
            return Err(VamanaError::InvariantViolation(format!(
                "vertex {i} edge lock already held"
            )));
        }
        self.versions[i]
            .compare_exchange(version, version + 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                VamanaError::InvariantViolation(format!(
                    "vertex {i} edge lock acquisition raced with another acquire"
                ))
            })?;
        Ok(VertexGuard {
            graph: self,
            vertex: i,
            version,
            released: false,
        })
    }

    /// Lock-free read of vertex `i`'s current neighbor list.
    pub fn fetch_neighbours(&self, i: usize) -> Vec<u32> {
        loop {
            let v1 = self.versions[i].load(Ordering::Acquire);
            if v1 % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let data = unsafe { (*self.edges[i].get()).clone() };
            std::sync::atomic::fence(Ordering::Acquire);
            let v2 = self.versions[i].load(Ordering::Acquire);
            if v1 == v2 {
                return data;
            }
        }
    }

    /// Lock-free read of vertex `i`'s current out-degree.
    pub fn neighbours_size(&self, i: usize) -> usize {
        loop {
            let v1 = self.versions[i].load(Ordering::Acquire);
            if v1 % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let len = unsafe { (*self.edges[i].get()).len() };
            std::sync::atomic::fence(Ordering::Acquire);
            let v2 = self.versions[i].load(Ordering::Acquire);
            if v1 == v2 {
                return len;
            }
        }
    }

    /// The dataset's medoid: the vertex nearest to the component-wise mean
    /// of every vector. Returns `0` when `n == 1`.
    pub fn medoid(&self) -> usize {
        if self.n <= 1 {
            return 0;
        }
        let d = self.params.dimension;
        let mut mean = vec![0.0f32; d];
        for i in 0..self.n {
            let v = self.vector(i);
            for (m, x) in mean.iter_mut().zip(v.iter()) {
                *m += x;
            }
        }
        for m in mean.iter_mut() {
            *m /= self.n as f32;
        }

        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for i in 0..self.n {
            let d = self.distance_to_vec(i, &mean);
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    /// Seed every vertex with `min(N-1, M)` distinct, non-self neighbors
    /// chosen from a shuffled permutation.
    pub fn generate_random_edges(&self, seed: u64) -> Result<()> {
        if self.n <= 1 {
            return Ok(());
        }
        let count = self.params.max_degree.min(self.n - 1);
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..self.n {
            let mut pool: Vec<u32> = (0..self.n as u32).filter(|&x| x as usize != i).collect();
            pool.shuffle(&mut rng);
            pool.truncate(count);
            let mut guard = self.acquire_vertex(i)?;
            guard.set_neighbours(&pool);
        }
        Ok(())
    }

    /// Best-first search from `start` toward `target`'s vector, expanding
    /// at most `search_list_size` candidates. Returns every vertex visited
    /// along with its precise distance to `target`, for use as
    /// [`MemoryGraph::robust_prune`]'s candidate set.
    pub fn greedy_search_prune(&self, start: usize, target: usize) -> HashMap<u32, f32> {
        let target_vec = self.vector(target);
        let mut frontier = BoundedQueue::new(self.params.search_list_size);
        let mut visited = HashMap::new();
        let mut in_queue: std::collections::HashSet<u32> = std::collections::HashSet::new();

        frontier.add(start as u32, self.distance_to_vec(start, target_vec), false);
        in_queue.insert(start as u32);

        loop {
            let pos = frontier.next_not_checked_vertex_index();
            if pos < 0 {
                break;
            }
            let pos = pos as usize;
            let v = frontier.vertex_index(pos);
            let dist = frontier.vertex_distance(pos);
            visited.insert(v, dist);

            for n in self.fetch_neighbours(v as usize) {
                if n as usize == target || in_queue.contains(&n) {
                    continue;
                }
                in_queue.insert(n);
                let d = self.distance_to_vec(n as usize, target_vec);
                frontier.add(n, d, false);
            }
        }

        visited
    }

    /// Select at most `max_degree` edges for `v` out of `candidates`
    /// (vertex -> distance, or `None` if unknown and still needing
    /// materialization), per the RobustPrune relaxation sweep. The
    /// returned list is reversed (nearest last) to match what the on-disk
    /// search expects, and is written to `v`'s edge list before returning.
    pub fn robust_prune(
        &self,
        v: usize,
        mut candidates: HashMap<u32, Option<f32>>,
    ) -> Result<Vec<u32>> {
        for n in self.fetch_neighbours(v) {
            candidates.entry(n).or_insert(None);
        }
        candidates.remove(&(v as u32));

        let unresolved: Vec<u32> = candidates
            .iter()
            .filter(|(_, d)| d.is_none())
            .map(|(&k, _)| k)
            .collect();
        for chunk in unresolved.chunks(4) {
            if chunk.len() == 4 {
                let dists = distance_x4(
                    self.metric,
                    self.vector(v),
                    [
                        self.vector(chunk[0] as usize),
                        self.vector(chunk[1] as usize),
                        self.vector(chunk[2] as usize),
                        self.vector(chunk[3] as usize),
                    ],
                );
                for (id, d) in chunk.iter().zip(dists.iter()) {
                    candidates.insert(*id, Some(*d));
                }
            } else {
                for &id in chunk {
                    let d = self.distance(v, id as usize);
                    candidates.insert(id, Some(d));
                }
            }
        }

        let mut sorted: Vec<(u32, f32)> = candidates
            .into_iter()
            .map(|(id, d)| (id, d.expect("all candidate distances materialized above")))
            .collect();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let alpha = self.params.alpha;
        let mut multiplier = 1.0f32;
        let mut neighbors: Vec<(u32, f32)> = loop {
            let mut working = sorted.clone();
            let mut current = Vec::new();
            while current.len() < self.params.max_degree && !working.is_empty() {
                let p_star = working.remove(0);
                working.retain(|&(c, d_v_c)| {
                    let d_pstar_c = self.distance(p_star.0 as usize, c as usize);
                    multiplier * d_pstar_c > d_v_c
                });
                current.push(p_star);
            }

            if current.len() >= self.params.max_degree || multiplier >= alpha {
                break current;
            }
            multiplier = (multiplier * 1.2).min(alpha);
        };

        neighbors.reverse();
        let final_ids: Vec<u32> = neighbors.iter().map(|(id, _)| *id).collect();
        let mut guard = self.acquire_vertex(v)?;
        guard.set_neighbours(&final_ids);
        Ok(final_ids)
    }
}

/// RAII handle for a vertex's exclusive edge-mutation lock, returned by
/// [`MemoryGraph::acquire_vertex`]. Releases the lock (advancing the
/// version to the next even number) on drop.
pub struct VertexGuard<'a> {
    graph: &'a MemoryGraph,
    vertex: usize,
    version: u64,
    released: bool,
}

impl<'a> VertexGuard<'a> {
    /// Replace the vertex's entire neighbor list.
    pub fn set_neighbours(&mut self, neighbours: &[u32]) {
        unsafe {
            *self.graph.edges[self.vertex].get() = neighbours.to_vec();
        }
    }

    /// Append one neighbor to the vertex's edge list.
    pub fn append_neighbour(&mut self, n: u32) {
        unsafe {
            (*self.graph.edges[self.vertex].get()).push(n);
        }
    }

    /// Current neighbor list, readable without a version retry since this
    /// guard already holds exclusive access.
    pub fn neighbours(&self) -> &[u32] {
        unsafe { &*self.graph.edges[self.vertex].get() }
    }
}

impl Drop for VertexGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let expected = self.version + 1;
        let result = self.graph.versions[self.vertex].compare_exchange(
            expected,
            expected + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if result.is_err() {
            tracing::error!(vertex = self.vertex, "vertex lock released without a matching acquire");
        }
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVectors {
        dim: usize,
        data: Vec<Vec<f32>>,
        ids: Vec<Vec<u8>>,
    }

    impl FixedVectors {
        fn new(dim: usize, data: Vec<Vec<f32>>) -> Self {
            let ids = (0..data.len()).map(|i| i.to_le_bytes().to_vec()).collect();
            FixedVectors { dim, data, ids }
        }
    }

    impl VectorReader for FixedVectors {
        fn size(&self) -> usize {
            self.data.len()
        }
        fn dimensions(&self) -> usize {
            self.dim
        }
        fn read(&self, i: usize) -> &[f32] {
            &self.data[i]
        }
        fn id(&self, i: usize) -> &[u8] {
            &self.ids[i]
        }
    }

    fn small_graph() -> MemoryGraph {
        let data = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![10.0, 10.0],
            vec![11.0, 10.0],
        ];
        let reader = FixedVectors::new(2, data);
        let params = GraphParams::new(2, 2, 4, 1.2).unwrap();
        MemoryGraph::new(params, Metric::L2, &reader).unwrap()
    }

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let g = small_graph();
        {
            let mut guard = g.acquire_vertex(0).unwrap();
            guard.set_neighbours(&[1, 2]);
        }
        assert!(g.acquire_vertex(0).is_ok());
    }

    #[test]
    fn double_acquire_is_invariant_violation() {
        let g = small_graph();
        let _guard = g.acquire_vertex(0).unwrap();
        assert!(g.acquire_vertex(0).is_err());
    }

    #[test]
    fn fetch_neighbours_sees_committed_write() {
        let g = small_graph();
        {
            let mut guard = g.acquire_vertex(1).unwrap();
            guard.set_neighbours(&[0, 2]);
        }
        assert_eq!(g.fetch_neighbours(1), vec![0, 2]);
        assert_eq!(g.neighbours_size(1), 2);
    }

    #[test]
    fn medoid_of_single_vertex_is_zero() {
        let reader = FixedVectors::new(2, vec![vec![5.0, 5.0]]);
        let params = GraphParams::new(2, 1, 4, 1.2).unwrap();
        let g = MemoryGraph::new(params, Metric::L2, &reader).unwrap();
        assert_eq!(g.medoid(), 0);
    }

    #[test]
    fn medoid_prefers_central_cluster_member() {
        let g = small_graph();
        let m = g.medoid();
        // vertices 0,1,2 cluster near the origin; 3,4 are a distant pair.
        assert!(m <= 2);
    }

    #[test]
    fn generate_random_edges_gives_every_vertex_bounded_distinct_neighbours() {
        let g = small_graph();
        g.generate_random_edges(7).unwrap();
        for i in 0..g.len() {
            let neighbours = g.fetch_neighbours(i);
            assert!(neighbours.len() <= 2);
            assert!(!neighbours.contains(&(i as u32)));
            let unique: std::collections::HashSet<_> = neighbours.iter().collect();
            assert_eq!(unique.len(), neighbours.len());
        }
    }

    #[test]
    fn robust_prune_respects_max_degree_and_has_no_self_loop() {
        let g = small_graph();
        g.generate_random_edges(1).unwrap();
        let candidates: HashMap<u32, Option<f32>> =
            [(1u32, None), (2, None), (3, None), (4, None)].into_iter().collect();
        let result = g.robust_prune(0, candidates).unwrap();
        assert!(result.len() <= 2);
        assert!(!result.contains(&0));
    }

    #[test]
    fn greedy_search_prune_finds_target_cluster_neighbors() {
        let g = small_graph();
        g.generate_random_edges(3).unwrap();
        let visited = g.greedy_search_prune(0, 1);
        assert!(!visited.is_empty());
    }
}
