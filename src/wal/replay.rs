//! Drives redo and undo of page operation sequences against pinned pages.

use tracing::{debug, trace};

use crate::primitives::cache::PageSource;
use crate::types::{CellarError, OperationUnitId, Result};
use crate::wal::po::PageOperation;

/// Counters reported by a replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied to a page.
    pub applied: usize,
    /// Records passed over because they belong to another unit.
    pub skipped: usize,
}

fn wrap(op: &PageOperation, err: CellarError) -> CellarError {
    CellarError::Replay {
        file_id: op.file_id(),
        page_index: op.page_index(),
        unit: op.operation_unit_id(),
        source: Box::new(err),
    }
}

fn redo_one<S: PageSource + ?Sized>(op: &PageOperation, pages: &mut S) -> Result<()> {
    let entry = pages
        .entry_mut(op.file_id(), op.page_index())
        .map_err(|e| wrap(op, e))?;
    op.redo(entry).map_err(|e| wrap(op, e))?;
    trace!(
        file = %op.file_id(),
        page = %op.page_index(),
        kind = ?op.kind(),
        "replay.redo"
    );
    Ok(())
}

fn undo_one<S: PageSource + ?Sized>(op: &PageOperation, pages: &mut S) -> Result<()> {
    let entry = pages
        .entry_mut(op.file_id(), op.page_index())
        .map_err(|e| wrap(op, e))?;
    op.undo(entry).map_err(|e| wrap(op, e))?;
    trace!(
        file = %op.file_id(),
        page = %op.page_index(),
        kind = ?op.kind(),
        "replay.undo"
    );
    Ok(())
}

/// Re-applies `records` in log order.
pub fn redo_all<S: PageSource + ?Sized>(
    records: &[PageOperation],
    pages: &mut S,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for op in records {
        redo_one(op, pages)?;
        stats.applied += 1;
    }
    debug!(applied = stats.applied, "replay.redo_all");
    Ok(stats)
}

/// Reverts `records` newest first.
pub fn undo_all<S: PageSource + ?Sized>(
    records: &[PageOperation],
    pages: &mut S,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for op in records.iter().rev() {
        undo_one(op, pages)?;
        stats.applied += 1;
    }
    debug!(applied = stats.applied, "replay.undo_all");
    Ok(stats)
}

/// Reverts the records of one operation unit, newest first.
pub fn rollback_unit<S: PageSource + ?Sized>(
    records: &[PageOperation],
    unit: OperationUnitId,
    pages: &mut S,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for op in records.iter().rev() {
        if op.operation_unit_id() != unit {
            stats.skipped += 1;
            continue;
        }
        undo_one(op, pages)?;
        stats.applied += 1;
    }
    debug!(
        unit = %unit,
        applied = stats.applied,
        skipped = stats.skipped,
        "replay.rollback_unit"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::cache::PageCache;
    use crate::primitives::pool::BufferPool;
    use crate::storage::bucket::{Bucket, BucketKind};
    use crate::storage::cluster_state::ClusterState;
    use crate::types::{FileId, PageIndex, RecordId};
    use std::sync::Arc;

    fn cache() -> PageCache {
        PageCache::new(Arc::new(BufferPool::new(1024)))
    }

    #[test]
    fn redo_rebuilds_pages_from_zero() {
        let mut live = cache();
        {
            let entry = live.load(FileId(1), PageIndex(0));
            let mut bucket = Bucket::new(entry.page_mut());
            bucket.init(BucketKind::Leaf);
            assert!(bucket.add_leaf_entry(0, b"bb", RecordId::new(1, 2)));
            assert!(bucket.add_leaf_entry(0, b"aa", RecordId::new(1, 1)));
        }
        ClusterState::new(live.load(FileId(1), PageIndex(1)).page_mut()).set_size(5);

        let mut records = live.unpin(FileId(1), PageIndex(0));
        records.extend(live.unpin(FileId(1), PageIndex(1)));

        let mut replayed = cache();
        let stats = redo_all(&records, &mut replayed).unwrap();
        assert_eq!(stats.applied, records.len());

        let entry = replayed.get(FileId(1), PageIndex(0)).unwrap();
        let bucket = Bucket::new(entry.page());
        assert_eq!(bucket.size(), 2);
        assert_eq!(bucket.key(0), b"aa");
        assert_eq!(bucket.value(1), RecordId::new(1, 2));
        drop(bucket);
        let state = replayed.get(FileId(1), PageIndex(1)).unwrap();
        assert_eq!(ClusterState::new(state.page()).size(), 5);
    }

    #[test]
    fn rollback_only_touches_its_unit() {
        let mut pages = cache();
        let before = pages.load(FileId(2), PageIndex(3)).buffer_duplicate();

        let entry = pages.load(FileId(2), PageIndex(3));
        entry.set_operation_unit(OperationUnitId(1));
        ClusterState::new(entry.page_mut()).set_size(10);
        entry.set_operation_unit(OperationUnitId(2));
        ClusterState::new(entry.page_mut()).set_records_size(99);
        entry.set_operation_unit(OperationUnitId(1));
        ClusterState::new(entry.page_mut()).set_size(20);
        let records = entry.page_operations().to_vec();

        let stats = rollback_unit(&records, OperationUnitId(1), &mut pages).unwrap();
        assert_eq!(stats, ReplayStats { applied: 2, skipped: 1 });
        {
            let entry = pages.get(FileId(2), PageIndex(3)).unwrap();
            let state = ClusterState::new(entry.page());
            assert_eq!(state.size(), 0);
            assert_eq!(state.records_size(), 99);
        }

        rollback_unit(&records, OperationUnitId(2), &mut pages).unwrap();
        let after = pages.get(FileId(2), PageIndex(3)).unwrap().buffer_duplicate();
        assert_eq!(after, before);
    }

    struct Refusing;

    impl PageSource for Refusing {
        fn entry_mut(
            &mut self,
            _file_id: FileId,
            _page_index: PageIndex,
        ) -> Result<&mut crate::primitives::cache::CacheEntry> {
            Err(CellarError::Invalid("page unavailable"))
        }
    }

    #[test]
    fn failures_carry_the_record_envelope() {
        let op = PageOperation::with_envelope(
            FileId(4),
            PageIndex(5),
            OperationUnitId(6),
            crate::wal::po::PageOperationBody::ClusterStateSetSize {
                old_size: 0,
                new_size: 1,
            },
        );
        let err = undo_all(std::slice::from_ref(&op), &mut Refusing).unwrap_err();
        match err {
            CellarError::Replay {
                file_id,
                page_index,
                unit,
                source,
            } => {
                assert_eq!(file_id, FileId(4));
                assert_eq!(page_index, PageIndex(5));
                assert_eq!(unit, OperationUnitId(6));
                assert!(matches!(*source, CellarError::Invalid(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
