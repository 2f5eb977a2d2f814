//! Construction-time parameters for the graph, PQ codebooks, and their
//! cross-checked invariants.
//!
//! Validation happens once, at construction, the way `VectorConfig::new`
//! and `Limits` validate eagerly rather than failing deep inside a hot path.

use crate::error::{Result, VamanaError};

/// Graph-build parameters (Vamana/DiskANN).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphParams {
    /// Vector dimensionality `D`.
    pub dimension: usize,
    /// Maximum out-degree per vertex `M`.
    pub max_degree: usize,
    /// Beam width used during greedy search / RobustPrune candidate
    /// collection `L`.
    pub search_list_size: usize,
    /// Pruning relaxation factor `α` (typically in `[1.0, 1.5]`).
    pub alpha: f32,
}

impl GraphParams {
    /// Validate and construct.
    ///
    /// # Errors
    /// Returns [`VamanaError::Config`] if `dimension`, `max_degree`, or
    /// `search_list_size` is zero, or if `alpha < 1.0`.
    pub fn new(dimension: usize, max_degree: usize, search_list_size: usize, alpha: f32) -> Result<Self> {
        if dimension == 0 {
            return Err(VamanaError::Config("dimension must be > 0".into()));
        }
        if max_degree == 0 {
            return Err(VamanaError::Config("max_degree must be > 0".into()));
        }
        if search_list_size == 0 {
            return Err(VamanaError::Config("search_list_size must be > 0".into()));
        }
        if !(alpha >= 1.0) {
            return Err(VamanaError::Config(format!(
                "alpha must be >= 1.0, got {alpha}"
            )));
        }
        Ok(GraphParams {
            dimension,
            max_degree,
            search_list_size,
            alpha,
        })
    }
}

/// Product-quantization codebook parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PqParams {
    /// Vector dimensionality `D`. Must be evenly divisible by `num_subspaces`.
    pub dimension: usize,
    /// Number of independent subspace codebooks `Q`.
    pub num_subspaces: usize,
    /// Centroids per subspace codebook `K` (fixed at 256 per the one-byte
    /// code-per-subspace layout, but kept explicit for clarity at call
    /// sites and for tests that exercise smaller values).
    pub num_centroids: usize,
    /// Mini-batch k-means batch size. Must be a multiple of 4 to feed the
    /// 4-way batched distance path; non-conforming batches fall back to
    /// scalar distance evaluation.
    pub batch_size: usize,
}

impl PqParams {
    /// Validate and construct.
    ///
    /// # Errors
    /// Returns [`VamanaError::Config`] if `num_subspaces` is zero, if
    /// `dimension` isn't evenly divisible by `num_subspaces` (the
    /// `pqCompression` divisibility invariant), or if `batch_size % 4 != 0`.
    pub fn new(dimension: usize, num_subspaces: usize, num_centroids: usize, batch_size: usize) -> Result<Self> {
        if num_subspaces < 1 {
            return Err(VamanaError::Config(
                "num_subspaces must be >= 1".into(),
            ));
        }
        if dimension % num_subspaces != 0 {
            return Err(VamanaError::Config(format!(
                "dimension {dimension} is not evenly divisible by num_subspaces {num_subspaces} (pqCompression must divide the vector size)"
            )));
        }
        if num_centroids == 0 || num_centroids > 256 {
            return Err(VamanaError::Config(format!(
                "num_centroids must be in 1..=256, got {num_centroids}"
            )));
        }
        if batch_size % 4 != 0 {
            return Err(VamanaError::Config(format!(
                "batch_size must be a multiple of 4, got {batch_size}"
            )));
        }
        Ok(PqParams {
            dimension,
            num_subspaces,
            num_centroids,
            batch_size,
        })
    }

    /// Width of a single subspace (`D / Q`).
    pub fn subspace_dim(&self) -> usize {
        self.dimension / self.num_subspaces
    }
}
