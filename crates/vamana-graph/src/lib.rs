//! The Vamana/DiskANN graph: build-time structures and the frozen,
//! disk-resident reader.
//!
//! [`queue`] is the bounded frontier shared by both the in-memory build
//! search ([`memory`]) and the on-disk query search ([`disk`]).
//! [`builder`] drives [`memory::MemoryGraph`] through the parallel pruning
//! pipeline; its output is serialized once by [`disk::write_index`] and
//! served read-only afterward by [`disk::OnDiskGraph`].

#![warn(missing_docs)]

pub mod builder;
pub mod disk;
pub mod memory;
pub mod queue;

pub use builder::build_parallel;
pub use disk::{write_index, OnDiskGraph};
pub use memory::{MemoryGraph, VertexGuard};
pub use queue::{fixup_index, BoundedQueue};
