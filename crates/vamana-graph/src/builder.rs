//! Parallel graph construction: one worker per core, vertices sharded by
//! `id mod W`, cross-shard neighbor proposals delivered through per-worker
//! inbox queues.
//!
//! Each worker owns every vertex whose id is congruent to its index modulo
//! the worker count, and the only channel of mutation between workers is a
//! `(owner, proposed_neighbor)` message: worker `w` never touches vertex
//! `u`'s edge list directly unless `u mod W == w`. This keeps
//! [`crate::memory::MemoryGraph::acquire_vertex`] contention-free across
//! workers by construction, not by locking discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::sync::ShardedLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use vamana_core::{ProgressTracker, Result};

use crate::memory::MemoryGraph;

/// A proposal that `new_neighbor` be considered as an edge for `owner`.
#[derive(Debug, Clone, Copy)]
struct NeighborPair {
    owner: u32,
    new_neighbor: u32,
}

struct Shared {
    done_count: AtomicUsize,
    pending_sends: AtomicUsize,
    worker_count: usize,
}

/// Run the parallel pruning pipeline over `graph`, assuming random edges
/// have already been seeded (see [`MemoryGraph::generate_random_edges`]).
///
/// `worker_count == 0` means "one worker per host core" ([`num_cpus::get`]);
/// pass an explicit nonzero count to override it, e.g. for tests that want
/// deterministic low-concurrency runs.
pub fn build_parallel(
    graph: &MemoryGraph,
    medoid: usize,
    worker_count: usize,
    seed: u64,
    progress: &ShardedLock<Box<dyn ProgressTracker + Send>>,
) -> Result<()> {
    let n = graph.len();
    if n == 0 {
        return Ok(());
    }
    let requested = if worker_count == 0 { num_cpus::get() } else { worker_count };
    let w = requested.max(1).min(n.max(1));

    let mut senders = Vec::with_capacity(w);
    let mut receivers = Vec::with_capacity(w);
    for _ in 0..w {
        let (tx, rx) = crossbeam_channel_unbounded();
        senders.push(tx);
        receivers.push(rx);
    }

    let shared = Arc::new(Shared {
        done_count: AtomicUsize::new(0),
        pending_sends: AtomicUsize::new(0),
        worker_count: w,
    });

    progress
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .push_phase("graph_build");

    std::thread::scope(|scope| {
        for worker_id in 0..w {
            let senders = senders.clone();
            let rx = receivers[worker_id].clone();
            let shared = Arc::clone(&shared);
            let mut shard: Vec<usize> = (0..n).filter(|v| v % w == worker_id).collect();
            let mut rng = StdRng::seed_from_u64(seed ^ (worker_id as u64));
            shard.shuffle(&mut rng);

            scope.spawn(move || -> Result<()> {
                run_worker(graph, medoid, worker_id, w, shard, &senders, &rx, &shared)
            });
        }
    });

    progress
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .pull_phase();

    Ok(())
}

fn run_worker(
    graph: &MemoryGraph,
    medoid: usize,
    _worker_id: usize,
    w: usize,
    mut shard: Vec<usize>,
    senders: &[Sender],
    rx: &Receiver,
    shared: &Shared,
) -> Result<()> {
    loop {
        let mut drained_any = false;
        while let Ok(pair) = rx.try_recv() {
            drained_any = true;
            shared.pending_sends.fetch_sub(1, Ordering::AcqRel);
            process_neighbor_pair(graph, pair)?;
        }

        if let Some(v) = shard.pop() {
            process_owned_vertex(graph, medoid, v, w, senders, shared)?;
            continue;
        }

        if drained_any {
            continue;
        }

        shared.done_count.fetch_add(1, Ordering::AcqRel);
        loop {
            if let Ok(pair) = rx.try_recv() {
                shared.done_count.fetch_sub(1, Ordering::AcqRel);
                shared.pending_sends.fetch_sub(1, Ordering::AcqRel);
                process_neighbor_pair(graph, pair)?;
                break;
            }
            if shared.done_count.load(Ordering::Acquire) == shared.worker_count
                && shared.pending_sends.load(Ordering::Acquire) == 0
            {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }
}

fn process_owned_vertex(
    graph: &MemoryGraph,
    medoid: usize,
    v: usize,
    w: usize,
    senders: &[Sender],
    shared: &Shared,
) -> Result<()> {
    let visited = graph.greedy_search_prune(medoid, v);
    let candidates: HashMap<u32, Option<f32>> =
        visited.into_iter().map(|(id, d)| (id, Some(d))).collect();
    let neighbors = graph.robust_prune(v, candidates)?;

    for n in neighbors {
        let owner = n as usize % w;
        shared.pending_sends.fetch_add(1, Ordering::AcqRel);
        senders[owner]
            .send(NeighborPair {
                owner: n,
                new_neighbor: v as u32,
            })
            .expect("worker channel should outlive all senders within build_parallel's scope");
    }
    Ok(())
}

fn process_neighbor_pair(graph: &MemoryGraph, pair: NeighborPair) -> Result<()> {
    let u = pair.owner as usize;
    let v = pair.new_neighbor;
    let current = graph.fetch_neighbours(u);

    if !current.contains(&v) && current.len() < graph.max_degree() {
        let mut guard = graph.acquire_vertex(u)?;
        guard.append_neighbour(v);
        return Ok(());
    }
    if current.contains(&v) {
        return Ok(());
    }

    let candidates: HashMap<u32, Option<f32>> = [(v, None)].into_iter().collect();
    graph.robust_prune(u, candidates)?;
    Ok(())
}

type Sender = crossbeam_channel::Sender<NeighborPair>;
type Receiver = crossbeam_channel::Receiver<NeighborPair>;

fn crossbeam_channel_unbounded() -> (Sender, Receiver) {
    crossbeam_channel::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vamana_core::{GraphParams, NullProgress, VectorReader};
    use vamana_vector::Metric;

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

    fn ring_of(n: usize, dim: usize) -> FixedVectors {
        let data = (0..n)
            .map(|i| {
                let angle = (i as f32) * std::f32::consts::TAU / (n as f32);
                let mut v = vec![0.0; dim];
                v[0] = angle.cos() * 10.0;
                v[1] = angle.sin() * 10.0;
                v
            })
            .collect();
        FixedVectors::new(dim, data)
    }

    #[test]
    fn build_parallel_gives_every_vertex_bounded_degree() {
        let reader = ring_of(40, 4);
        let params = GraphParams::new(4, 6, 16, 1.2).unwrap();
        let graph = MemoryGraph::new(params, Metric::L2, &reader).unwrap();
        graph.generate_random_edges(11).unwrap();
        let medoid = graph.medoid();

        let tracker: Box<dyn ProgressTracker + Send> = Box::new(NullProgress);
        let progress = ShardedLock::new(tracker);
        build_parallel(&graph, medoid, 4, 5, &progress).unwrap();

        for i in 0..graph.len() {
            let neighbours = graph.fetch_neighbours(i);
            assert!(neighbours.len() <= 6);
            assert!(!neighbours.contains(&(i as u32)));
        }
    }

    #[test]
    fn build_parallel_is_connected_from_medoid() {
        let reader = ring_of(30, 4);
        let params = GraphParams::new(4, 8, 16, 1.2).unwrap();
        let graph = MemoryGraph::new(params, Metric::L2, &reader).unwrap();
        graph.generate_random_edges(3).unwrap();
        let medoid = graph.medoid();

        let tracker: Box<dyn ProgressTracker + Send> = Box::new(NullProgress);
        let progress = ShardedLock::new(tracker);
        build_parallel(&graph, medoid, 3, 9, &progress).unwrap();

        let mut seen = vec![false; graph.len()];
        let mut stack = vec![medoid];
        seen[medoid] = true;
        while let Some(v) = stack.pop() {
            for n in graph.fetch_neighbours(v) {
                if !seen[n as usize] {
                    seen[n as usize] = true;
                    stack.push(n as usize);
                }
            }
        }
        assert!(seen.iter().all(|&s| s), "graph must be reachable from the medoid");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]
        #[test]
        fn build_parallel_never_exceeds_max_degree_or_self_loops(
            n in 4usize..40,
            max_degree in 2usize..8,
            workers in 1usize..5,
            seed in any::<u64>(),
        ) {
            let reader = ring_of(n, 4);
            let params = GraphParams::new(4, max_degree, 12, 1.2).unwrap();
            let graph = MemoryGraph::new(params, Metric::L2, &reader).unwrap();
            graph.generate_random_edges(seed).unwrap();
            let medoid = graph.medoid();

            let tracker: Box<dyn ProgressTracker + Send> = Box::new(NullProgress);
            let progress = ShardedLock::new(tracker);
            build_parallel(&graph, medoid, workers, seed, &progress).unwrap();

            for i in 0..graph.len() {
                let neighbours = graph.fetch_neighbours(i);
                prop_assert!(neighbours.len() <= max_degree);
                prop_assert!(!neighbours.contains(&(i as u32)));
            }
        }
    }
}
