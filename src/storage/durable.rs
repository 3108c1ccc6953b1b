//! Typed field access over a page buffer.
//!
//! Every page layout (bucket, cluster state, directory) is a view over one
//! of the types here. Reads go through [`DurablePage`], which is implemented
//! for live pages and for plain byte slices (snapshots, test images). Writes
//! go through [`PageMut`], which also owns the hook that appends page
//! operations to the cache entry the page belongs to.

use std::ops::Range;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::primitives::bytes::le;
use crate::types::{FileId, OperationUnitId, PageIndex};
use crate::wal::delta::{PageDelta, PageSnapshot};
use crate::wal::po::{PageOperation, PageOperationBody};

/// Read access to a fixed-size page image.
///
/// Offsets are absolute (the base header occupies the first
/// [`NEXT_FREE_POSITION`](crate::types::page::NEXT_FREE_POSITION) bytes).
/// Reading outside the page panics.
pub trait DurablePage {
    /// The whole page image.
    fn data(&self) -> &[u8];

    /// Page size in bytes.
    fn page_size(&self) -> usize {
        self.data().len()
    }

    /// Reads one byte.
    fn get_u8(&self, offset: usize) -> u8 {
        le::get_u8(self.data(), offset)
    }

    /// Reads an `i16`.
    fn get_i16(&self, offset: usize) -> i16 {
        le::get_i16(self.data(), offset)
    }

    /// Reads an `i32`.
    fn get_i32(&self, offset: usize) -> i32 {
        le::get_i32(self.data(), offset)
    }

    /// Reads an `i64`.
    fn get_i64(&self, offset: usize) -> i64 {
        le::get_i64(self.data(), offset)
    }

    /// Borrows `len` bytes at `offset`.
    fn get_binary(&self, offset: usize, len: usize) -> &[u8] {
        le::get_bytes(self.data(), offset, len)
    }
}

impl DurablePage for &[u8] {
    fn data(&self) -> &[u8] {
        self
    }
}

/// Shared view of a pinned page.
pub struct PageRef<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl<'a> PageRef<'a> {
    pub(crate) fn new(guard: RwLockReadGuard<'a, Box<[u8]>>) -> Self {
        Self { guard }
    }
}

impl DurablePage for PageRef<'_> {
    fn data(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive view of a pinned page that records page operations.
pub struct PageMut<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
    ops: &'a mut Vec<PageOperation>,
    file_id: FileId,
    page_index: PageIndex,
    unit: OperationUnitId,
    merge_gap: usize,
}

impl<'a> PageMut<'a> {
    pub(crate) fn new(
        guard: RwLockWriteGuard<'a, Box<[u8]>>,
        ops: &'a mut Vec<PageOperation>,
        file_id: FileId,
        page_index: PageIndex,
        unit: OperationUnitId,
        merge_gap: usize,
    ) -> Self {
        Self {
            guard,
            ops,
            file_id,
            page_index,
            unit,
            merge_gap,
        }
    }

    /// File of the underlying cache entry.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Page index of the underlying cache entry.
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    /// Writes one byte.
    pub fn set_u8(&mut self, offset: usize, v: u8) {
        le::put_u8(&mut self.guard, offset, v);
    }

    /// Writes an `i16`.
    pub fn set_i16(&mut self, offset: usize, v: i16) {
        le::put_i16(&mut self.guard, offset, v);
    }

    /// Writes an `i32`.
    pub fn set_i32(&mut self, offset: usize, v: i32) {
        le::put_i32(&mut self.guard, offset, v);
    }

    /// Writes an `i64`.
    pub fn set_i64(&mut self, offset: usize, v: i64) {
        le::put_i64(&mut self.guard, offset, v);
    }

    /// Copies `bytes` to `offset`.
    pub fn set_binary(&mut self, offset: usize, bytes: &[u8]) {
        le::put_bytes(&mut self.guard, offset, bytes);
    }

    /// Moves `len` bytes from `from` to `to`; the ranges may overlap.
    pub fn move_data(&mut self, from: usize, to: usize, len: usize) {
        let size = self.guard.len();
        assert!(
            from.checked_add(len).is_some_and(|end| end <= size)
                && to.checked_add(len).is_some_and(|end| end <= size),
            "move_data {from}->{to} ({len} bytes) outside page of {size} bytes"
        );
        self.guard.copy_within(from..from + len, to);
    }

    /// Captures `windows` ahead of a structural mutation.
    pub(crate) fn snapshot(&self, windows: &[Range<usize>]) -> PageSnapshot {
        PageSnapshot::capture(&self.guard, windows)
    }

    /// Changed spans since `snapshot` was captured.
    pub(crate) fn delta(&self, snapshot: &PageSnapshot) -> PageDelta {
        snapshot.diff(&self.guard, self.merge_gap)
    }

    /// Appends a record for the mutation just applied, stamped with this
    /// page's envelope.
    pub(crate) fn log(&mut self, body: PageOperationBody) {
        self.ops.push(PageOperation::with_envelope(
            self.file_id,
            self.page_index,
            self.unit,
            body,
        ));
    }
}

impl DurablePage for PageMut<'_> {
    fn data(&self) -> &[u8] {
        &self.guard
    }
}
