//! Page layer of a record-oriented storage engine.
//!
//! Pages live in buffers owned by a [`BufferPool`](primitives::pool::BufferPool)
//! and are pinned through [`CacheEntry`](primitives::cache::CacheEntry)
//! values. Page layouts such as the slotted B-tree [`Bucket`](storage::Bucket)
//! are views over a pinned page; every mutation appends a
//! [`PageOperation`](wal::PageOperation) that can redo or undo it
//! byte-for-byte, and those records can be framed into log segments and
//! replayed.

#![warn(missing_docs)]

pub mod options;
pub mod primitives;
pub mod storage;
pub mod types;
pub mod wal;

pub use options::CellarOptions;
pub use primitives::cache::{CacheEntry, CachePointer, PageCache, PageSource};
pub use primitives::pool::{BufferPool, Intention, PoolStats};
pub use storage::{Bucket, BucketEntry, BucketKind, DurablePage, PageMut, PageRef};
pub use types::{CellarError, FileId, OperationUnitId, PageIndex, RecordId, Result};
pub use wal::{OperationKind, PageOperation, PageOperationBody};
