#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use cellar::storage::bucket::leaf_entry_size;
use cellar::storage::{ClusterState, DirectoryPage};
use cellar::types::{CellarError, Result};
use cellar::wal::{redo_all, undo_all};
use cellar::{
    Bucket, BucketEntry, BucketKind, CellarOptions, FileId, OperationKind, PageCache, PageIndex,
    RecordId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cellar=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

const FILE: FileId = FileId(1);
const PAGE: PageIndex = PageIndex(9);

fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(1..=12);
    (0..len).map(|_| rng.gen_range(b'a'..=b'h')).collect()
}

#[test]
fn leaf_history_replays_forward_and_backward() -> Result<()> {
    init_tracing();
    let options = CellarOptions::with_page_size(4096);
    let mut cache = PageCache::with_options(&options)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    let mut model: BTreeMap<Vec<u8>, RecordId> = BTreeMap::new();

    let entry = cache.load(FILE, PAGE);
    Bucket::new(entry.page_mut()).init(BucketKind::Leaf);
    entry.clear_page_operations();
    let checkpoint = entry.buffer_duplicate();
    let mut mutations = 0;

    for step in 0..400u32 {
        let value = RecordId::new((step % 5) as i16, i64::from(step));
        let mut bucket = Bucket::new(entry.page_mut());
        if model.is_empty() || rng.gen_bool(0.65) {
            let key = random_key(&mut rng);
            match bucket.find(&key) {
                Ok(index) => {
                    bucket.update_value(index, value, key.len());
                    model.insert(key, value);
                    mutations += 1;
                }
                Err(index) => {
                    if bucket.add_leaf_entry(index, &key, value) {
                        model.insert(key, value);
                        mutations += 1;
                    } else {
                        assert!(bucket.free_space() < leaf_entry_size(key.len()) + 4);
                    }
                }
            }
        } else {
            let index = rng.gen_range(0..bucket.size());
            let key = bucket.key(index).to_vec();
            bucket.remove_leaf_entry(index, key.len());
            model.remove(&key);
            mutations += 1;
        }
        bucket.validate()?;
    }

    {
        let bucket = Bucket::new(entry.page());
        for (item, (key, value)) in bucket.entries().zip(&model) {
            match item {
                BucketEntry::Leaf { key: k, value: v } => {
                    assert_eq!(&k, key);
                    assert_eq!(&v, value);
                }
                other => panic!("unexpected entry {other:?}"),
            }
        }
        assert_eq!(bucket.size(), model.len());
    }

    let records = entry.take_page_operations();
    let final_image = entry.buffer_duplicate();
    assert_eq!(records.len(), mutations);

    let mut replay = PageCache::new(Arc::clone(cache.pool()));
    replay.install(FILE, PAGE, &checkpoint)?;
    let stats = redo_all(&records, &mut replay)?;
    assert_eq!(stats.applied, records.len());
    let replayed = replay.get(FILE, PAGE).map(|e| e.buffer_duplicate());
    assert_eq!(replayed.as_deref(), Some(&final_image[..]));

    undo_all(&records, &mut replay)?;
    let rewound = replay.get(FILE, PAGE).map(|e| e.buffer_duplicate());
    assert_eq!(rewound.as_deref(), Some(&checkpoint[..]));
    Ok(())
}

#[test]
fn internal_split_sequence_replays_across_pages() -> Result<()> {
    init_tracing();
    let mut cache = PageCache::with_options(&CellarOptions::with_page_size(2048))?;
    let left_page = PageIndex(1);
    let right_page = PageIndex(2);
    for page in [left_page, right_page] {
        let entry = cache.load(FILE, page);
        Bucket::new(entry.page_mut()).init(BucketKind::Internal);
        entry.clear_page_operations();
    }
    let left_before = cache.load(FILE, left_page).buffer_duplicate();
    let right_before = cache.load(FILE, right_page).buffer_duplicate();

    let keys: Vec<Vec<u8>> = (0..10u8).map(|i| vec![b'k', b'0' + i, i]).collect();
    let raw_upper: Vec<Vec<u8>> = {
        let entry = cache.load(FILE, left_page);
        let mut bucket = Bucket::new(entry.page_mut());
        for (i, key) in keys.iter().enumerate() {
            let child = i as u32 * 10;
            assert!(bucket.add_non_leaf_entry(i, child, child + 10, key));
        }
        let upper = (5..10).map(|i| bucket.raw_entry(i).to_vec()).collect();
        upper
    };

    {
        let entry = cache.load(FILE, right_page);
        assert!(Bucket::new(entry.page_mut()).add_all(&raw_upper));
    }
    {
        let entry = cache.load(FILE, left_page);
        let mut bucket = Bucket::new(entry.page_mut());
        bucket.shrink(5);
        assert_eq!(bucket.remove_non_leaf_entry_at(2, true), 4);
        assert!(bucket.update_key(0, b"a-much-longer-separator"));
        bucket.set_right_sibling(Some(right_page));
        bucket.validate()?;

        assert_eq!(bucket.right(1), 30);
        assert_eq!(bucket.left(2), 30);
        assert_eq!(bucket.key(0), b"a-much-longer-separator");
    }
    {
        let entry = cache.load(FILE, right_page);
        let bucket = Bucket::new(entry.page());
        assert_eq!(bucket.size(), 5);
        assert_eq!(bucket.key(0), &keys[5][..]);
        assert_eq!(bucket.left(0), 50);
        assert_eq!(bucket.right(4), 100);
    }

    let mut records = cache.unpin(FILE, right_page);
    records.extend(cache.unpin(FILE, left_page));
    let kinds: Vec<OperationKind> = records.iter().map(|op| op.kind()).collect();
    assert!(kinds.contains(&OperationKind::BucketAddAll));
    assert!(kinds.contains(&OperationKind::BucketShrink));
    assert!(kinds.contains(&OperationKind::BucketRemoveNonLeafEntry));
    assert!(kinds.contains(&OperationKind::BucketUpdateKey));

    let mut replay = PageCache::new(Arc::clone(cache.pool()));
    replay.install(FILE, left_page, &left_before)?;
    replay.install(FILE, right_page, &right_before)?;
    redo_all(&records, &mut replay)?;
    {
        let entry = replay.get(FILE, right_page).ok_or(CellarError::Invalid("missing"))?;
        let bucket = Bucket::new(entry.page());
        assert_eq!(bucket.size(), 5);
        assert_eq!(bucket.right(4), 100);
    }
    {
        let entry = replay.get(FILE, left_page).ok_or(CellarError::Invalid("missing"))?;
        let bucket = Bucket::new(entry.page());
        assert_eq!(bucket.size(), 4);
        assert_eq!(bucket.right_sibling(), Some(right_page));
    }

    undo_all(&records, &mut replay)?;
    for (page, image) in [(left_page, &left_before), (right_page, &right_before)] {
        let now = replay.get(FILE, page).map(|e| e.buffer_duplicate());
        assert_eq!(now.as_deref(), Some(&image[..]));
    }
    Ok(())
}

#[test]
fn record_for_another_page_is_rejected() -> Result<()> {
    let mut cache = PageCache::with_options(&CellarOptions::with_page_size(1024))?;
    ClusterState::new(cache.load(FILE, PageIndex(1)).page_mut()).set_size(3);
    let records = cache.unpin(FILE, PageIndex(1));

    let other = cache.load(FILE, PageIndex(2));
    let err = records[0].redo(other).unwrap_err();
    assert!(matches!(
        err,
        CellarError::PageMismatch {
            record_page: PageIndex(1),
            entry_page: PageIndex(2),
            ..
        }
    ));
    assert!(other.buffer_duplicate().iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn directory_and_cluster_pages_share_the_protocol() -> Result<()> {
    let options = CellarOptions::from_toml_str("page_size = 8192\ndelta_merge_gap = 4\n")?;
    let mut cache = PageCache::with_options(&options)?;
    let before = cache.load(FILE, PAGE).buffer_duplicate();
    {
        let entry = cache.load(FILE, PAGE);
        assert_eq!(entry.page_size(), 8192);
        let mut dir = DirectoryPage::new(entry.page_mut());
        dir.set_node_local_depth(2, 7);
        dir.set_pointer(2, 17, 0x0102_0304);
        dir.set_max_right_child_depth(0, 1);
    }
    let records = cache.unpin(FILE, PAGE);
    assert_eq!(records.len(), 3);

    let mut replay = PageCache::new(Arc::clone(cache.pool()));
    replay.install(FILE, PAGE, &before)?;
    redo_all(&records, &mut replay)?;
    {
        let entry = replay.get(FILE, PAGE).ok_or(CellarError::Invalid("missing"))?;
        let dir = DirectoryPage::new(entry.page());
        assert_eq!(dir.node_local_depth(2), 7);
        assert_eq!(dir.pointer(2, 17), 0x0102_0304);
        assert_eq!(dir.max_right_child_depth(0), 1);
    }
    undo_all(&records, &mut replay)?;
    let rewound = replay.get(FILE, PAGE).map(|e| e.buffer_duplicate());
    assert_eq!(rewound.as_deref(), Some(&before[..]));
    Ok(())
}
