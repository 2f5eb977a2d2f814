//! # Vamana
//!
//! A disk-resident approximate-nearest-neighbor index (DiskANN/Vamana graph
//! with product-quantization distance acceleration) and a snapshot-isolated
//! MVCC operation log, sharing one workspace because both feed the same
//! storage substrate in the database this crate's lineage is drawn from.
//!
//! Two independent surfaces:
//!
//! - [`VamanaIndex`]: build a graph once over a [`VectorReader`], freeze it
//!   to disk, then serve `search` queries. No online updates after build —
//!   see `vamana-graph` for the lower-level builder/reader pieces this
//!   wraps.
//! - [`MvccStore`] (re-exported from `vamana-mvcc`): `put`/`remove`/`read`/`commit`
//!   against a versioned operation log, independent of the vector index.
//!
//! Internal crates (`vamana-core`, `vamana-vector`, `vamana-graph`,
//! `vamana-mvcc`) are implementation detail; this crate is the stable
//! surface that re-exports them as the only public API.

#![warn(missing_docs)]

use std::path::Path;

pub use vamana_core::{
    Fallback, GraphParams, NoFallback, NullProgress, PqParams, ProgressTracker, Result,
    VamanaError, VectorReader,
};
pub use vamana_graph::OnDiskGraph;
pub use vamana_mvcc::{GarbageCollector, GcState, Key, MvccStore, Transaction, TxKind};
pub use vamana_vector::{Metric, PqCodebooks};

/// Build-then-freeze parameters bundling the graph and PQ configuration a
/// [`VamanaIndex::build`] call needs.
#[derive(Debug, Clone, Copy)]
pub struct BuildParams {
    /// Graph construction parameters (`D`, `M`, `L`, `α`).
    pub graph: GraphParams,
    /// PQ codebook parameters (`D`, `Q`, `K`, batch size).
    pub pq: PqParams,
    /// Distance metric for both graph construction and query search.
    pub metric: Metric,
    /// Worker count for the parallel pruning pipeline (see `vamana-graph::build_parallel`).
    /// `0` means one worker per host core.
    pub workers: usize,
    /// RNG seed for random-edge seeding, worker shuffling, and PQ training —
    /// fixing it makes a build reproducible.
    pub seed: u64,
}

/// A frozen, disk-resident Vamana index: build once from a [`VectorReader`],
/// then serve `search` queries against the page-packed on-disk layout.
///
/// Follows a build → freeze → query lifecycle: the in-memory graph, PQ
/// training, and parallel pruning only run inside [`VamanaIndex::build`];
/// [`VamanaIndex::open`] and [`VamanaIndex::search`] never touch them again.
pub struct VamanaIndex {
    graph: OnDiskGraph,
    search_list_size: usize,
}

impl VamanaIndex {
    /// Train PQ codebooks, seed random edges, run the parallel RobustPrune
    /// pipeline, and write the frozen index to `path`. The returned
    /// [`VamanaIndex`] wraps the just-written file opened read-only, so a
    /// caller that only wants to build (not immediately query) can simply
    /// drop the result and [`VamanaIndex::open`] the path later.
    ///
    /// # Errors
    /// Propagates [`VamanaError::Config`] from parameter validation,
    /// [`VamanaError::InvariantViolation`] from a vertex-lock programming
    /// error surfaced during pruning, or [`VamanaError::Io`] from writing
    /// the index file.
    pub fn build(
        reader: &dyn VectorReader,
        params: BuildParams,
        path: &Path,
        progress: &mut dyn ProgressTracker,
    ) -> Result<Self> {
        progress.push_phase("vamana_build");

        let graph = vamana_graph::MemoryGraph::new(params.graph, params.metric, reader)?;
        graph.generate_random_edges(params.seed)?;
        let medoid = graph.medoid();

        let tracker: Box<dyn ProgressTracker + Send> = Box::new(NullProgress);
        let scoped = crossbeam_utils::sync::ShardedLock::new(tracker);
        vamana_graph::build_parallel(&graph, medoid, params.workers, params.seed, &scoped)?;

        let vectors: Vec<Vec<f32>> = (0..reader.size()).map(|i| reader.read(i).to_vec()).collect();
        let codebooks = PqCodebooks::train(params.pq, &vectors, params.seed)?;
        let pq_codes = codebooks.encode_all(&vectors);
        let external_ids: Vec<Vec<u8>> = (0..reader.size()).map(|i| reader.id(i).to_vec()).collect();

        vamana_graph::write_index(
            path,
            &graph,
            &codebooks,
            &pq_codes,
            &external_ids,
            medoid,
            params.metric,
        )?;

        progress.pull_phase();

        Ok(VamanaIndex {
            graph: OnDiskGraph::open(path)?,
            search_list_size: params.graph.search_list_size,
        })
    }

    /// Open a previously built index file read-only.
    ///
    /// # Errors
    /// Returns [`VamanaError::Corruption`] if the file's header or sidecar
    /// doesn't match the expected page layout, or [`VamanaError::Io`] if it
    /// can't be memory-mapped.
    pub fn open(path: &Path, search_list_size: usize) -> Result<Self> {
        Ok(VamanaIndex {
            graph: OnDiskGraph::open(path)?,
            search_list_size,
        })
    }

    /// Number of vectors in the index.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the index has no vectors.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Approximate `k` nearest neighbors of `query`, returned as
    /// `(external_id, distance)` pairs nearest-first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Vec<u8>, f32)> {
        self.graph
            .greedy_search(query, k, self.search_list_size)
            .into_iter()
            .map(|(v, d)| (self.graph.external_id(v as usize).to_vec(), d))
            .collect()
    }
}
