#![allow(missing_docs)]

use std::fs;
use std::sync::{Arc, Once};

use cellar::types::{CellarError, Result};
use cellar::wal::segment::SEGMENT_HEADER_LEN;
use cellar::wal::{redo_all, rollback_unit, LogSegmentReader, LogSegmentWriter, ReplayStats};
use cellar::{
    Bucket, BucketKind, CellarOptions, FileId, OperationUnitId, PageCache, PageIndex, RecordId,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cellar::wal=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

const FILE: FileId = FileId(5);

/// Fills pages 0..pages with leaf buckets, one operation unit per page.
fn build_history(cache: &mut PageCache, pages: u64) -> LogSegmentWriter {
    let mut writer = LogSegmentWriter::new();
    for page in 0..pages {
        let entry = cache.load(FILE, PageIndex(page));
        entry.set_operation_unit(OperationUnitId(page + 1));
        {
            let mut bucket = Bucket::new(entry.page_mut());
            bucket.init(BucketKind::Leaf);
            for i in 0..20u8 {
                let key = [b'p', page as u8, i];
                let value = RecordId::new(page as i16, i64::from(i));
                assert!(bucket.add_leaf_entry(i as usize, &key, value));
            }
            bucket.remove_leaf_entry(3, 3);
            bucket.set_right_sibling(Some(PageIndex(page + 1)));
        }
        writer.drain_entry(entry);
    }
    writer
}

#[test]
fn segment_file_replays_onto_empty_pages() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("segment-0001.log");
    let options = CellarOptions::with_page_size(4096);

    let mut live = PageCache::with_options(&options)?;
    let writer = build_history(&mut live, 3);
    assert_eq!(writer.record_count(), 3 * 23);
    let mut file = fs::File::create(&path)?;
    writer.write_to(&mut file)?;
    drop(file);

    let bytes = fs::read(&path)?;
    let records = LogSegmentReader::with_options(&bytes, &options)?.read_all()?;
    assert_eq!(records.len(), 3 * 23);

    let mut recovered = PageCache::new(Arc::clone(live.pool()));
    let stats = redo_all(&records, &mut recovered)?;
    assert_eq!(stats.applied, records.len());
    assert_eq!(recovered.len(), 3);

    for page in 0..3 {
        let expected = live
            .get(FILE, PageIndex(page))
            .map(|e| e.buffer_duplicate());
        let actual = recovered
            .get(FILE, PageIndex(page))
            .map(|e| e.buffer_duplicate());
        assert!(expected.is_some());
        assert_eq!(actual, expected, "page {page} differs after redo");
    }
    Ok(())
}

#[test]
fn torn_segment_recovers_the_intact_prefix() -> Result<()> {
    init_tracing();
    let options = CellarOptions::with_page_size(4096);
    let mut live = PageCache::with_options(&options)?;
    let bytes = build_history(&mut live, 2).finish();
    let torn = &bytes[..bytes.len() - 3];

    let mut prefix = Vec::new();
    let mut tail_error = None;
    for item in LogSegmentReader::new(torn)? {
        match item {
            Ok(op) => prefix.push(op),
            Err(err) => tail_error = Some(err),
        }
    }
    assert_eq!(prefix.len(), 2 * 23 - 1);
    assert!(matches!(tail_error, Some(CellarError::Truncated { .. })));

    let mut recovered = PageCache::new(Arc::clone(live.pool()));
    redo_all(&prefix, &mut recovered)?;
    let first = recovered.get(FILE, PageIndex(0)).map(|e| e.buffer_duplicate());
    let expected = live.get(FILE, PageIndex(0)).map(|e| e.buffer_duplicate());
    assert_eq!(first, expected);

    let entry = recovered
        .get(FILE, PageIndex(1))
        .ok_or(CellarError::Invalid("page 1 missing"))?;
    assert_eq!(Bucket::new(entry.page()).right_sibling(), None);
    Ok(())
}

#[test]
fn rollback_reverts_one_unit_across_the_segment() -> Result<()> {
    init_tracing();
    let options = CellarOptions::with_page_size(4096);
    let mut live = PageCache::with_options(&options)?;
    let bytes = build_history(&mut live, 3).finish();
    let records = LogSegmentReader::new(&bytes)?.read_all()?;

    let stats = rollback_unit(&records, OperationUnitId(2), &mut live)?;
    assert_eq!(
        stats,
        ReplayStats {
            applied: 23,
            skipped: 46
        }
    );

    let reverted = live
        .get(FILE, PageIndex(1))
        .ok_or(CellarError::Invalid("page 1 missing"))?;
    assert!(reverted.buffer_duplicate().iter().all(|&b| b == 0));
    for page in [0, 2] {
        let entry = live
            .get(FILE, PageIndex(page))
            .ok_or(CellarError::Invalid("page missing"))?;
        let bucket = Bucket::new(entry.page());
        assert_eq!(bucket.size(), 19);
        assert_eq!(bucket.right_sibling(), Some(PageIndex(page + 1)));
    }
    Ok(())
}

#[test]
fn corrupt_frame_stops_the_reader() -> Result<()> {
    let mut live = PageCache::with_options(&CellarOptions::with_page_size(4096))?;
    let mut bytes = build_history(&mut live, 1).finish().to_vec();
    bytes[SEGMENT_HEADER_LEN + 9] ^= 0x40;

    let results: Vec<_> = LogSegmentReader::new(&bytes)?.collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(CellarError::Corruption(_))));
    Ok(())
}
