//! Shared types for the Vamana/DiskANN index and the MVCC operation log.
//!
//! This crate defines:
//! - [`error::VamanaError`]: the error type hierarchy
//! - [`params::GraphParams`] / [`params::PqParams`]: validated construction
//!   parameters
//! - [`external`]: collaborator traits (vector source, progress tracker,
//!   MVCC fallback store) that the rest of the workspace treats as external

#![warn(missing_docs)]

pub mod error;
pub mod external;
pub mod params;

pub use error::{Result, VamanaError};
pub use external::{Fallback, NoFallback, NullProgress, ProgressTracker, VectorReader};
pub use params::{GraphParams, PqParams};
