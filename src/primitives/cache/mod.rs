#![forbid(unsafe_code)]
//! Pinned pages and their pending page-operation logs.
//!
//! A [`CacheEntry`] couples one pool buffer with the identity of the page it
//! holds and the ordered list of [`PageOperation`]s recorded since the list
//! was last cleared. [`PageCache`] is a minimal pin table used by tests and
//! by log replay.

use std::sync::Arc;

use parking_lot::RwLockWriteGuard;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::options::CellarOptions;
use crate::primitives::pool::{BufferPool, Intention, Pointer};
use crate::storage::durable::{PageMut, PageRef};
use crate::types::{CellarError, FileId, OperationUnitId, PageIndex, Result};
use crate::wal::delta::DEFAULT_DELTA_MERGE_GAP;
use crate::wal::po::PageOperation;

/// Pool buffer that goes back to its pool when dropped.
pub struct CachePointer {
    pointer: Option<Pointer>,
    pool: Arc<BufferPool>,
}

impl CachePointer {
    /// Wraps a pointer previously acquired from `pool`.
    pub fn new(pointer: Pointer, pool: Arc<BufferPool>) -> Self {
        Self {
            pointer: Some(pointer),
            pool,
        }
    }

    /// Acquires a buffer from `pool` and wraps it.
    pub fn acquire(pool: &Arc<BufferPool>, clear: bool, intention: Intention) -> Self {
        Self::new(pool.acquire_direct(clear, intention), Arc::clone(pool))
    }

    /// The wrapped pool pointer.
    pub fn pointer(&self) -> &Pointer {
        match &self.pointer {
            Some(pointer) => pointer,
            None => unreachable!("cache pointer used after release"),
        }
    }

    /// Pool that owns the buffer.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Drop for CachePointer {
    fn drop(&mut self) {
        if let Some(pointer) = self.pointer.take() {
            self.pool.release(pointer);
        }
    }
}

impl std::fmt::Debug for CachePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePointer")
            .field("pointer", &self.pointer)
            .finish()
    }
}

/// One pinned page plus its pending page operations.
#[derive(Debug)]
pub struct CacheEntry {
    file_id: FileId,
    page_index: PageIndex,
    pointer: CachePointer,
    is_new: bool,
    unit: OperationUnitId,
    merge_gap: usize,
    operations: Vec<PageOperation>,
}

impl CacheEntry {
    /// Pins `pointer` as page `page_index` of `file_id`.
    pub fn new(
        file_id: FileId,
        page_index: PageIndex,
        pointer: CachePointer,
        is_new: bool,
    ) -> Self {
        Self {
            file_id,
            page_index,
            pointer,
            is_new,
            unit: OperationUnitId::default(),
            merge_gap: DEFAULT_DELTA_MERGE_GAP,
            operations: Vec::new(),
        }
    }

    /// Overrides how many unchanged bytes a delta span may absorb.
    pub fn with_merge_gap(mut self, merge_gap: usize) -> Self {
        self.merge_gap = merge_gap;
        self
    }

    /// File this page belongs to.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Index of this page in its file.
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    /// Whether the page was created rather than loaded.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.pointer.pool().page_size()
    }

    /// Operation unit stamped on records appended from now on.
    pub fn operation_unit(&self) -> OperationUnitId {
        self.unit
    }

    /// Sets the operation unit for subsequent mutations.
    pub fn set_operation_unit(&mut self, unit: OperationUnitId) {
        self.unit = unit;
    }

    /// Shared view of the page.
    pub fn page(&self) -> PageRef<'_> {
        PageRef::new(self.pointer.pointer().read())
    }

    /// Exclusive, logging view of the page.
    pub fn page_mut(&mut self) -> PageMut<'_> {
        PageMut::new(
            self.pointer.pointer().write(),
            &mut self.operations,
            self.file_id,
            self.page_index,
            self.unit,
            self.merge_gap,
        )
    }

    /// Independent copy of the current page bytes.
    pub fn buffer_duplicate(&self) -> Box<[u8]> {
        self.pointer.pointer().read().clone()
    }

    /// Overwrites the page with `image` without recording an operation.
    pub fn copy_from(&mut self, image: &[u8]) -> Result<()> {
        let mut buf = self.pointer.pointer().write();
        if buf.len() != image.len() {
            return Err(CellarError::Invalid("page image size differs from page size"));
        }
        buf.copy_from_slice(image);
        Ok(())
    }

    /// Records appended since the last clear, in mutation order.
    pub fn page_operations(&self) -> &[PageOperation] {
        &self.operations
    }

    /// Drops all pending records.
    pub fn clear_page_operations(&mut self) {
        self.operations.clear();
    }

    /// Moves all pending records out, leaving the list empty.
    pub fn take_page_operations(&mut self) -> Vec<PageOperation> {
        std::mem::take(&mut self.operations)
    }

    /// Raw page access for replay; bypasses operation logging.
    pub(crate) fn raw_page_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.pointer.pointer().write()
    }
}

/// Supplies cache entries to log replay.
pub trait PageSource {
    /// Returns the pinned entry for a page, loading it if needed.
    fn entry_mut(&mut self, file_id: FileId, page_index: PageIndex) -> Result<&mut CacheEntry>;
}

/// In-memory pin table keyed by `(file, page)`.
pub struct PageCache {
    pool: Arc<BufferPool>,
    merge_gap: usize,
    entries: FxHashMap<(FileId, PageIndex), CacheEntry>,
}

impl PageCache {
    /// Creates an empty cache over `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            merge_gap: DEFAULT_DELTA_MERGE_GAP,
            entries: FxHashMap::default(),
        }
    }

    /// Creates a cache and its pool from options.
    pub fn with_options(options: &CellarOptions) -> Result<Self> {
        let pool = Arc::new(BufferPool::with_options(options)?);
        let mut cache = Self::new(pool);
        cache.merge_gap = options.delta_merge_gap;
        Ok(cache)
    }

    /// Pool backing the cache.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of pinned pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pins a page, creating a zeroed one on first access.
    pub fn load(&mut self, file_id: FileId, page_index: PageIndex) -> &mut CacheEntry {
        let pool = &self.pool;
        let merge_gap = self.merge_gap;
        self.entries.entry((file_id, page_index)).or_insert_with(|| {
            debug!(file = %file_id, page = %page_index, "cache.new_page");
            let ptr = CachePointer::acquire(pool, true, Intention::AddNewPage);
            CacheEntry::new(file_id, page_index, ptr, true).with_merge_gap(merge_gap)
        })
    }

    /// Pins a page with the given contents, replacing any pinned copy.
    pub fn install(
        &mut self,
        file_id: FileId,
        page_index: PageIndex,
        image: &[u8],
    ) -> Result<&mut CacheEntry> {
        if image.len() != self.pool.page_size() {
            return Err(CellarError::Invalid("page image size differs from page size"));
        }
        let ptr = CachePointer::acquire(&self.pool, false, Intention::LoadPage);
        let mut entry =
            CacheEntry::new(file_id, page_index, ptr, false).with_merge_gap(self.merge_gap);
        entry.copy_from(image)?;
        trace!(file = %file_id, page = %page_index, "cache.install");
        if let Some(old) = self.entries.insert((file_id, page_index), entry) {
            if !old.page_operations().is_empty() {
                warn!(
                    file = %file_id,
                    page = %page_index,
                    pending = old.page_operations().len(),
                    "cache.install dropped pending operations"
                );
            }
        }
        match self.entries.get_mut(&(file_id, page_index)) {
            Some(entry) => Ok(entry),
            None => unreachable!("entry inserted above"),
        }
    }

    /// Pinned entry, if any.
    pub fn get(&self, file_id: FileId, page_index: PageIndex) -> Option<&CacheEntry> {
        self.entries.get(&(file_id, page_index))
    }

    /// Pinned entry for mutation, if any.
    pub fn get_mut(&mut self, file_id: FileId, page_index: PageIndex) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&(file_id, page_index))
    }

    /// Unpins a page, releasing its buffer and returning its pending records.
    pub fn unpin(&mut self, file_id: FileId, page_index: PageIndex) -> Vec<PageOperation> {
        match self.entries.remove(&(file_id, page_index)) {
            Some(mut entry) => {
                trace!(file = %file_id, page = %page_index, "cache.unpin");
                entry.take_page_operations()
            }
            None => Vec::new(),
        }
    }
}

impl PageSource for PageCache {
    fn entry_mut(&mut self, file_id: FileId, page_index: PageIndex) -> Result<&mut CacheEntry> {
        Ok(self.load(file_id, page_index))
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("pool", &self.pool)
            .field("pinned", &self.entries.len())
            .finish()
    }
}
