//! Low-level primitives the page layer is built on.
//!
//! Byte codecs, the buffer pool that owns page memory, and the cache entries
//! that pin pool buffers to `(file, page)` addresses.

/// Little-endian field access and bounds-checked stream cursors.
pub mod bytes;

/// Pinned pages and the pin table used by log replay.
pub mod cache;

/// Page buffer pool.
pub mod pool;
