//! Page operation records and their log plumbing.

/// Byte-range deltas between page images.
pub mod delta;

/// Page operation records.
pub mod po;

/// Redo and undo drivers.
pub mod replay;

/// Framed log segments.
pub mod segment;

pub use delta::{DeltaSpan, PageDelta};
pub use po::{OperationKind, PageOperation, PageOperationBody};
pub use replay::{redo_all, rollback_unit, undo_all, ReplayStats};
pub use segment::{LogSegmentReader, LogSegmentWriter};
