//! Page layouts stored on durable pages.
//!
//! Every layout is a thin view over a [`DurablePage`]: reads go straight to
//! the buffer, and mutations through a [`PageMut`] append the page operation
//! that can redo or undo them.

/// Slotted B-tree bucket.
pub mod bucket;

/// Cluster state counters.
pub mod cluster_state;

/// Hash-table directory nodes.
pub mod directory;

pub(crate) mod durable;

pub use bucket::{Bucket, BucketEntry, BucketKind};
pub use cluster_state::ClusterState;
pub use directory::DirectoryPage;
pub use durable::{DurablePage, PageMut, PageRef};
