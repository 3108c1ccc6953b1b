#![forbid(unsafe_code)]
//! Identifiers, the crate error type, and shared page geometry.

use std::fmt;

/// Checksum helpers used by log segments.
pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Identifier of a data file managed by the pager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct FileId(pub u64);

/// Index of a page within its file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageIndex(pub u64);

/// Caller-assigned identifier grouping page operations into one logical unit.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct OperationUnitId(pub u64);

/// Identifier of a stored record: `(cluster id, cluster position)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId {
    /// Cluster the record lives in.
    pub cluster_id: i16,
    /// Position of the record inside its cluster.
    pub cluster_position: i64,
}

impl RecordId {
    /// Encoded size of a record id (`cluster_id:i16` + `cluster_position:i64`).
    pub const SIZE: usize = 10;

    /// Creates a record id.
    pub const fn new(cluster_id: i16, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

/// Errors surfaced by the storage layer.
///
/// Capacity failures are reported as `false` by the page mutators and misuse
/// of a page (wrong bucket mode, offsets outside the page) panics; only
/// conditions caused by stored bytes or configuration end up here.
#[derive(thiserror::Error, Debug)]
pub enum CellarError {
    /// Underlying I/O failure while reading or writing a log segment.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes do not describe a valid page or record.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the layer cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A page operation stream ended before the declared payload.
    #[error("truncated stream: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        /// Bytes required by the decoder.
        needed: usize,
        /// Offset at which decoding was attempted.
        offset: usize,
        /// Bytes actually present from `offset`.
        available: usize,
    },
    /// Log replay met an operation tag this build does not know.
    #[error("unknown page operation kind {0}")]
    UnknownOperation(u8),
    /// A record was applied to a cache entry holding a different page.
    #[error("page operation for {record_file}:{record_page} applied to {entry_file}:{entry_page}")]
    PageMismatch {
        /// File id stored in the record.
        record_file: FileId,
        /// Page index stored in the record.
        record_page: PageIndex,
        /// File id of the cache entry.
        entry_file: FileId,
        /// Page index of the cache entry.
        entry_page: PageIndex,
    },
    /// Replaying a record failed; carries the record's envelope.
    #[error("replay of page {file_id}:{page_index} (unit {unit}) failed: {source}")]
    Replay {
        /// File id of the failing record.
        file_id: FileId,
        /// Page index of the failing record.
        page_index: PageIndex,
        /// Operation unit of the failing record.
        unit: OperationUnitId,
        /// Underlying failure.
        #[source]
        source: Box<CellarError>,
    },
    /// Configuration could not be parsed or failed validation.
    #[error("config: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CellarError>;

pub mod page {
    //! Page geometry shared by every page layout.

    /// Default page size (64 KiB).
    pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;
    /// Smallest page size accepted by the buffer pool.
    pub const MIN_PAGE_SIZE: usize = 512;
    /// Largest page size; offsets are stored as signed 32-bit integers.
    pub const MAX_PAGE_SIZE: usize = i32::MAX as usize;

    /// Reserved base header length; page-specific layouts start here.
    pub const PAGE_HDR_LEN: usize = 28;

    pub mod header {
        //! Byte offsets of the base header fields.
        use core::ops::Range;

        /// Page magic.
        pub const MAGIC: Range<usize> = 0..8;
        /// Page checksum.
        pub const CRC32: Range<usize> = 8..12;
        /// Log segment of the last change.
        pub const WAL_SEGMENT: Range<usize> = 12..20;
        /// Log position of the last change.
        pub const WAL_POSITION: Range<usize> = 20..28;
    }

    /// Offset of the first byte available to page layouts.
    pub const NEXT_FREE_POSITION: usize = header::WAL_POSITION.end;
}
