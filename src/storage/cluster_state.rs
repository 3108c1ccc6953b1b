//! Cluster state page: record counters and the free-space list heads.
//!
//! ```text
//! 28  i32      records size
//! 32  i32      size
//! 36  i32[16]  free list page per bucket of free space
//! ```

use crate::storage::durable::{DurablePage, PageMut};
use crate::types::page::NEXT_FREE_POSITION;
use crate::wal::po::PageOperationBody;

/// Records size field.
pub const RECORDS_SIZE_OFFSET: usize = NEXT_FREE_POSITION;
/// Size field.
pub const SIZE_OFFSET: usize = RECORDS_SIZE_OFFSET + 4;
/// First free-list slot.
pub const FREE_LIST_OFFSET: usize = SIZE_OFFSET + 4;
/// Number of free-list slots.
pub const FREE_LIST_LEN: usize = 16;

/// Offset of free-list slot `index`, if it exists.
pub fn free_list_offset(index: usize) -> Option<usize> {
    (index < FREE_LIST_LEN).then(|| FREE_LIST_OFFSET + index * 4)
}

fn checked_free_list_offset(index: usize) -> usize {
    free_list_offset(index)
        .unwrap_or_else(|| panic!("free list index {index} out of range 0..{FREE_LIST_LEN}"))
}

/// View of a page as a cluster state page.
pub struct ClusterState<P> {
    page: P,
}

impl<P: DurablePage> ClusterState<P> {
    /// Wraps a page.
    pub fn new(page: P) -> Self {
        Self { page }
    }

    /// Number of records in the cluster.
    pub fn size(&self) -> i32 {
        self.page.get_i32(SIZE_OFFSET)
    }

    /// Total bytes of stored records.
    pub fn records_size(&self) -> i32 {
        self.page.get_i32(RECORDS_SIZE_OFFSET)
    }

    /// Head of free list `index`.
    pub fn free_list_page(&self, index: usize) -> i32 {
        self.page.get_i32(checked_free_list_offset(index))
    }
}

impl ClusterState<PageMut<'_>> {
    /// Sets the record count.
    pub fn set_size(&mut self, size: i32) {
        let old_size = self.page.get_i32(SIZE_OFFSET);
        self.page.set_i32(SIZE_OFFSET, size);
        self.page.log(PageOperationBody::ClusterStateSetSize {
            old_size,
            new_size: size,
        });
    }

    /// Sets the stored bytes counter.
    pub fn set_records_size(&mut self, records_size: i32) {
        let old = self.page.get_i32(RECORDS_SIZE_OFFSET);
        self.page.set_i32(RECORDS_SIZE_OFFSET, records_size);
        self.page.log(PageOperationBody::ClusterStateSetRecordsSize {
            old,
            new: records_size,
        });
    }

    /// Sets the head of free list `index`.
    pub fn set_free_list_page(&mut self, index: usize, page: i32) {
        let offset = checked_free_list_offset(index);
        let old = self.page.get_i32(offset);
        self.page.set_i32(offset, page);
        self.page.log(PageOperationBody::ClusterStateSetFreeListPage {
            index: index as u32,
            old,
            new: page,
        });
    }
}
