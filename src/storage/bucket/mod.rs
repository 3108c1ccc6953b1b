#![forbid(unsafe_code)]

//! Slotted B-tree bucket page.
//!
//! Layout (absolute offsets, little-endian):
//!
//! ```text
//! 28  i32   free pointer (next free-list page while on the free list)
//! 32  i32   size
//! 36  u8    is leaf
//! 37  i64   left sibling  (-1 when absent)
//! 45  i64   right sibling (-1 when absent)
//! 53  i32[] slot offsets, one per entry, in key order
//! ... free space ...
//! [free pointer, page size)  entries
//!    leaf:     [keyLen:i16][key][clusterId:i16][clusterPosition:i64]
//!    internal: [leftChild:i32][rightChild:i32][keyLen:i16][key]
//! ```
//!
//! Every mutator applies its change and appends exactly one page operation
//! to the owning cache entry. Capacity failures return `false` and touch
//! nothing; calling a leaf-only mutator on an internal bucket (or the
//! reverse) panics.

use std::ops::Range;

use smallvec::{smallvec, SmallVec};

use crate::storage::durable::{DurablePage, PageMut};
use crate::types::page::NEXT_FREE_POSITION;
use crate::types::{CellarError, PageIndex, RecordId, Result};
use crate::wal::delta::{PageDelta, PageSnapshot};
use crate::wal::po::{BucketHeaderImage, PageOperationBody};

/// Free pointer field.
pub const FREE_POINTER_OFFSET: usize = NEXT_FREE_POSITION;
/// Free-list link; shares storage with the free pointer.
pub const NEXT_FREE_LIST_PAGE_OFFSET: usize = NEXT_FREE_POSITION;
/// Entry count field.
pub const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
/// Leaf flag field.
pub const IS_LEAF_OFFSET: usize = SIZE_OFFSET + 4;
/// Left sibling field.
pub const LEFT_SIBLING_OFFSET: usize = IS_LEAF_OFFSET + 1;
/// Right sibling field.
pub const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 8;
/// First slot of the position array.
pub const POSITIONS_ARRAY_OFFSET: usize = RIGHT_SIBLING_OFFSET + 8;

/// Width of one slot.
pub const SLOT_LEN: usize = 4;
/// Width of the key length prefix.
pub const KEY_LEN_SIZE: usize = 2;
/// Width of one child pointer in an internal entry.
pub const CHILD_POINTER_LEN: usize = 4;

const NO_SIBLING: i64 = -1;

/// Encoded size of a leaf entry with a key of `key_len` bytes.
pub const fn leaf_entry_size(key_len: usize) -> usize {
    KEY_LEN_SIZE + key_len + RecordId::SIZE
}

/// Encoded size of an internal entry with a key of `key_len` bytes.
pub const fn non_leaf_entry_size(key_len: usize) -> usize {
    2 * CHILD_POINTER_LEN + KEY_LEN_SIZE + key_len
}

const fn slot_offset(index: usize) -> usize {
    POSITIONS_ARRAY_OFFSET + index * SLOT_LEN
}

/// Node kind, fixed at `init`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BucketKind {
    /// Keys map to record ids.
    Leaf,
    /// Keys separate child pages.
    Internal,
}

/// Decoded bucket entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BucketEntry {
    /// Entry of a leaf bucket.
    Leaf {
        /// Key bytes.
        key: Vec<u8>,
        /// Record the key points at.
        value: RecordId,
    },
    /// Entry of an internal bucket.
    Internal {
        /// Child holding keys below `key`.
        left: u32,
        /// Child holding keys at or above `key`.
        right: u32,
        /// Separator key bytes.
        key: Vec<u8>,
    },
}

impl BucketEntry {
    /// Key bytes of either variant.
    pub fn key(&self) -> &[u8] {
        match self {
            BucketEntry::Leaf { key, .. } | BucketEntry::Internal { key, .. } => key,
        }
    }
}

/// View of a page as a B-tree bucket.
///
/// Reads work over any [`DurablePage`]; mutators require a [`PageMut`].
pub struct Bucket<P> {
    page: P,
}

fn decode_sibling(raw: i64) -> Option<PageIndex> {
    u64::try_from(raw).ok().map(PageIndex)
}

fn encode_sibling(sibling: Option<PageIndex>) -> i64 {
    match sibling {
        Some(page) => {
            i64::try_from(page.0).unwrap_or_else(|_| panic!("sibling page {page} exceeds i64"))
        }
        None => NO_SIBLING,
    }
}

fn to_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or_else(|_| panic!("bucket field value {v} exceeds i32"))
}

impl<P: DurablePage> Bucket<P> {
    /// Wraps a page.
    pub fn new(page: P) -> Self {
        Self { page }
    }

    /// Underlying page.
    pub fn page(&self) -> &P {
        &self.page
    }

    /// Unwraps the underlying page.
    pub fn into_page(self) -> P {
        self.page
    }

    fn read_offset(&self, at: usize) -> usize {
        let v = self.page.get_i32(at);
        usize::try_from(v).unwrap_or_else(|_| panic!("negative bucket field {v} at {at}"))
    }

    fn key_len_at(&self, at: usize) -> usize {
        let v = self.page.get_i16(at);
        usize::try_from(v).unwrap_or_else(|_| panic!("negative key length {v} at {at}"))
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.read_offset(SIZE_OFFSET)
    }

    /// True when the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True for leaf buckets.
    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(IS_LEAF_OFFSET) > 0
    }

    /// Leaf or internal.
    pub fn kind(&self) -> BucketKind {
        if self.is_leaf() {
            BucketKind::Leaf
        } else {
            BucketKind::Internal
        }
    }

    /// Offset of the lowest stored entry byte.
    pub fn free_pointer(&self) -> usize {
        self.read_offset(FREE_POINTER_OFFSET)
    }

    /// Bytes available between the slot array and the entries.
    pub fn free_space(&self) -> usize {
        self.free_pointer().saturating_sub(slot_offset(self.size()))
    }

    /// Left neighbour on the same level.
    pub fn left_sibling(&self) -> Option<PageIndex> {
        decode_sibling(self.page.get_i64(LEFT_SIBLING_OFFSET))
    }

    /// Right neighbour on the same level.
    pub fn right_sibling(&self) -> Option<PageIndex> {
        decode_sibling(self.page.get_i64(RIGHT_SIBLING_OFFSET))
    }

    /// Next page on the free list (meaningful only for freed buckets).
    pub fn next_free_list_page(&self) -> i32 {
        self.page.get_i32(NEXT_FREE_LIST_PAGE_OFFSET)
    }

    fn entry_position(&self, index: usize) -> usize {
        let size = self.size();
        assert!(
            index < size,
            "slot {index} out of range for bucket of {size} entries"
        );
        self.read_offset(slot_offset(index))
    }

    fn key_position(&self, index: usize) -> usize {
        let pos = self.entry_position(index);
        if self.is_leaf() {
            pos
        } else {
            pos + 2 * CHILD_POINTER_LEN
        }
    }

    /// Key bytes of slot `index`.
    pub fn key(&self, index: usize) -> &[u8] {
        let at = self.key_position(index);
        let len = self.key_len_at(at);
        self.page.get_binary(at + KEY_LEN_SIZE, len)
    }

    /// Binary search by unsigned lexicographic key order.
    ///
    /// `Ok(slot)` on a hit, `Err(insertion point)` on a miss.
    pub fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.size();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    /// [`find`](Self::find) folded into one integer: the slot on a hit,
    /// `-(insertion point + 1)` on a miss.
    pub fn find_encoded(&self, key: &[u8]) -> i32 {
        match self.find(key) {
            Ok(slot) => to_i32(slot),
            Err(ip) => -to_i32(ip) - 1,
        }
    }

    /// Encoded bytes of slot `index`.
    pub fn raw_entry(&self, index: usize) -> &[u8] {
        let pos = self.entry_position(index);
        let len = if self.is_leaf() {
            leaf_entry_size(self.key_len_at(pos))
        } else {
            non_leaf_entry_size(self.key_len_at(pos + 2 * CHILD_POINTER_LEN))
        };
        self.page.get_binary(pos, len)
    }

    fn value_position(&self, index: usize) -> usize {
        assert!(self.is_leaf(), "values exist on leaf buckets only");
        let pos = self.entry_position(index);
        pos + KEY_LEN_SIZE + self.key_len_at(pos)
    }

    /// Record id stored in leaf slot `index`.
    pub fn value(&self, index: usize) -> RecordId {
        let at = self.value_position(index);
        RecordId::new(self.page.get_i16(at), self.page.get_i64(at + 2))
    }

    /// Encoded record id stored in leaf slot `index`.
    pub fn raw_value(&self, index: usize) -> &[u8] {
        let at = self.value_position(index);
        self.page.get_binary(at, RecordId::SIZE)
    }

    /// Left child of internal slot `index`.
    pub fn left(&self, index: usize) -> u32 {
        assert!(!self.is_leaf(), "child pointers exist on internal buckets only");
        self.page.get_i32(self.entry_position(index)) as u32
    }

    /// Right child of internal slot `index`.
    pub fn right(&self, index: usize) -> u32 {
        assert!(!self.is_leaf(), "child pointers exist on internal buckets only");
        self.page
            .get_i32(self.entry_position(index) + CHILD_POINTER_LEN) as u32
    }

    /// Decodes slot `index`.
    pub fn entry(&self, index: usize) -> BucketEntry {
        if self.is_leaf() {
            BucketEntry::Leaf {
                key: self.key(index).to_vec(),
                value: self.value(index),
            }
        } else {
            BucketEntry::Internal {
                left: self.left(index),
                right: self.right(index),
                key: self.key(index).to_vec(),
            }
        }
    }

    /// Decodes every slot in key order.
    pub fn entries(&self) -> impl Iterator<Item = BucketEntry> + '_ {
        (0..self.size()).map(move |i| self.entry(i))
    }

    /// Checks the slotted-page invariants without panicking.
    ///
    /// Verifies that the slot array stays below the free pointer, that every
    /// entry lies inside `[free pointer, page size)`, and that no two entries
    /// overlap.
    pub fn validate(&self) -> Result<()> {
        let data = self.page.data();
        let page_size = data.len();
        if page_size < POSITIONS_ARRAY_OFFSET {
            return Err(CellarError::Corruption("page shorter than bucket header"));
        }
        let size = usize::try_from(self.page.get_i32(SIZE_OFFSET))
            .map_err(|_| CellarError::Corruption("negative bucket size"))?;
        let fp = usize::try_from(self.page.get_i32(FREE_POINTER_OFFSET))
            .map_err(|_| CellarError::Corruption("negative bucket free pointer"))?;
        let slots_end = size
            .checked_mul(SLOT_LEN)
            .and_then(|n| n.checked_add(POSITIONS_ARRAY_OFFSET))
            .ok_or(CellarError::Corruption("bucket size overflows"))?;
        if slots_end > fp {
            return Err(CellarError::Corruption("slot array overlaps entry area"));
        }
        if fp > page_size {
            return Err(CellarError::Corruption("free pointer beyond page"));
        }
        let key_prefix = if self.is_leaf() {
            0
        } else {
            2 * CHILD_POINTER_LEN
        };
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(size);
        for i in 0..size {
            let pos = usize::try_from(self.page.get_i32(slot_offset(i)))
                .map_err(|_| CellarError::Corruption("negative slot offset"))?;
            if pos < fp || pos + key_prefix + KEY_LEN_SIZE > page_size {
                return Err(CellarError::Corruption("slot points outside entry area"));
            }
            let key_len = usize::try_from(self.page.get_i16(pos + key_prefix))
                .map_err(|_| CellarError::Corruption("negative key length"))?;
            let len = if self.is_leaf() {
                leaf_entry_size(key_len)
            } else {
                non_leaf_entry_size(key_len)
            };
            if pos + len > page_size {
                return Err(CellarError::Corruption("entry extends beyond page"));
            }
            ranges.push(pos..pos + len);
        }
        ranges.sort_unstable_by_key(|r| r.start);
        if ranges.windows(2).any(|w| w[0].end > w[1].start) {
            return Err(CellarError::Corruption("bucket entries overlap"));
        }
        Ok(())
    }
}

impl Bucket<PageMut<'_>> {
    fn page_size_i32(&self) -> i32 {
        to_i32(self.page.page_size())
    }

    /// Resets the header to an empty bucket of `kind`.
    pub fn init(&mut self, kind: BucketKind) {
        let previous = BucketHeaderImage::read_from(self.page.data());
        let is_leaf = kind == BucketKind::Leaf;
        let page_size = self.page_size_i32();
        self.page.set_i32(FREE_POINTER_OFFSET, page_size);
        self.page.set_i32(SIZE_OFFSET, 0);
        self.page.set_u8(IS_LEAF_OFFSET, u8::from(is_leaf));
        self.page.set_i64(LEFT_SIBLING_OFFSET, NO_SIBLING);
        self.page.set_i64(RIGHT_SIBLING_OFFSET, NO_SIBLING);
        self.page.log(PageOperationBody::BucketInit { is_leaf, previous });
    }

    /// Flips leaf/internal. Panics unless the bucket is empty.
    pub fn switch_bucket_type(&mut self) {
        assert!(
            self.is_empty(),
            "bucket type can only change while the bucket is empty"
        );
        let old = self.page.get_u8(IS_LEAF_OFFSET);
        let new = if old > 0 { 0 } else { 1 };
        self.page.set_u8(IS_LEAF_OFFSET, new);
        self.page.log(PageOperationBody::BucketSwitchType { old, new });
    }

    /// Sets the left neighbour.
    pub fn set_left_sibling(&mut self, sibling: Option<PageIndex>) {
        let old = self.page.get_i64(LEFT_SIBLING_OFFSET);
        let new = encode_sibling(sibling);
        self.page.set_i64(LEFT_SIBLING_OFFSET, new);
        self.page.log(PageOperationBody::BucketSetLeftSibling { old, new });
    }

    /// Sets the right neighbour.
    pub fn set_right_sibling(&mut self, sibling: Option<PageIndex>) {
        let old = self.page.get_i64(RIGHT_SIBLING_OFFSET);
        let new = encode_sibling(sibling);
        self.page.set_i64(RIGHT_SIBLING_OFFSET, new);
        self.page.log(PageOperationBody::BucketSetRightSibling { old, new });
    }

    /// Links the bucket into the free list.
    pub fn set_next_free_list_page(&mut self, next: i32) {
        let old = self.page.get_i32(NEXT_FREE_LIST_PAGE_OFFSET);
        self.page.set_i32(NEXT_FREE_LIST_PAGE_OFFSET, next);
        self.page.log(PageOperationBody::BucketSetNextFreeListPage { old, new: next });
    }

    fn append_raw(&mut self, index: usize, raw: &[u8]) {
        let fp = self.free_pointer() - raw.len();
        self.page.set_i32(FREE_POINTER_OFFSET, to_i32(fp));
        self.page.set_i32(slot_offset(index), to_i32(fp));
        self.page.set_binary(fp, raw);
    }

    /// Shifts by `by` every slot (except `skip`) whose entry sits below
    /// `removed_at`.
    fn shift_slots_below(
        &mut self,
        removed_at: usize,
        by: usize,
        count: usize,
        skip: Option<usize>,
    ) {
        for i in 0..count {
            if Some(i) == skip {
                continue;
            }
            let at = slot_offset(i);
            let pos = self.read_offset(at);
            if pos < removed_at {
                self.page.set_i32(at, to_i32(pos + by));
            }
        }
    }

    /// Inserts a slot at `index` pointing to `entry` written at the new free
    /// pointer. For internal entries `patch_next_left` rewrites the left child
    /// of the entry that follows. Returns the snapshot to diff, or `None` if
    /// the entry does not fit.
    fn place_entry(
        &mut self,
        index: usize,
        entry: &[u8],
        patch_next_left: Option<u32>,
    ) -> Option<PageSnapshot> {
        let size = self.size();
        assert!(
            index <= size,
            "insert slot {index} out of range for bucket of {size} entries"
        );
        let fp = self.free_pointer();
        let new_fp = fp
            .checked_sub(entry.len())
            .filter(|&p| p >= slot_offset(size + 1))?;

        let mut windows: SmallVec<[Range<usize>; 3]> =
            smallvec![FREE_POINTER_OFFSET..slot_offset(size + 1), new_fp..fp];
        let next = match patch_next_left {
            Some(right) if index < size => {
                let pos = self.entry_position(index);
                windows.push(pos..pos + CHILD_POINTER_LEN);
                Some((pos, right))
            }
            _ => None,
        };
        let snapshot = self.page.snapshot(&windows);

        if index < size {
            self.page.move_data(
                slot_offset(index),
                slot_offset(index + 1),
                (size - index) * SLOT_LEN,
            );
        }
        self.page.set_i32(FREE_POINTER_OFFSET, to_i32(new_fp));
        self.page.set_i32(slot_offset(index), to_i32(new_fp));
        self.page.set_i32(SIZE_OFFSET, to_i32(size + 1));
        self.page.set_binary(new_fp, entry);
        if let Some((pos, right)) = next {
            self.page.set_i32(pos, right as i32);
        }
        Some(snapshot)
    }

    /// Inserts a leaf entry at slot `index`.
    pub fn add_leaf_entry(&mut self, index: usize, key: &[u8], value: RecordId) -> bool {
        assert!(self.is_leaf(), "add_leaf_entry applies to leaf buckets only");
        let key_len = i16::try_from(key.len())
            .unwrap_or_else(|_| panic!("key of {} bytes exceeds i16 length", key.len()));
        let mut entry = Vec::with_capacity(leaf_entry_size(key.len()));
        entry.extend_from_slice(&key_len.to_le_bytes());
        entry.extend_from_slice(key);
        entry.extend_from_slice(&value.cluster_id.to_le_bytes());
        entry.extend_from_slice(&value.cluster_position.to_le_bytes());
        self.insert_leaf(index, &entry)
    }

    /// Inserts an already encoded leaf entry at slot `index`.
    pub fn add_raw_leaf_entry(&mut self, index: usize, raw: &[u8]) -> bool {
        assert!(self.is_leaf(), "add_raw_leaf_entry applies to leaf buckets only");
        assert!(
            raw.len() >= leaf_entry_size(0),
            "raw leaf entry of {} bytes is too short",
            raw.len()
        );
        let key_len = i16::from_le_bytes([raw[0], raw[1]]);
        assert!(
            usize::try_from(key_len).is_ok_and(|k| leaf_entry_size(k) == raw.len()),
            "raw leaf entry length does not match its key length"
        );
        self.insert_leaf(index, raw)
    }

    fn insert_leaf(&mut self, index: usize, entry: &[u8]) -> bool {
        let Some(snapshot) = self.place_entry(index, entry, None) else {
            return false;
        };
        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketAddLeafEntry {
            index: index as u32,
            entry_size: entry.len() as u32,
            delta,
        });
        true
    }

    /// Removes leaf slot `index` whose key is `key_size` bytes long and
    /// compacts the entry area. Returns the new size.
    pub fn remove_leaf_entry(&mut self, index: usize, key_size: usize) -> usize {
        assert!(self.is_leaf(), "remove_leaf_entry applies to leaf buckets only");
        let size = self.size();
        let entry_pos = self.entry_position(index);
        let entry_size = leaf_entry_size(key_size);
        let fp = self.free_pointer();
        let snapshot = self.page.snapshot(&[
            FREE_POINTER_OFFSET..slot_offset(size),
            fp..entry_pos + entry_size,
        ]);

        if index + 1 < size {
            self.page.move_data(
                slot_offset(index + 1),
                slot_offset(index),
                (size - index - 1) * SLOT_LEN,
            );
        }
        let new_size = size - 1;
        self.page.set_i32(SIZE_OFFSET, to_i32(new_size));
        if new_size > 0 && entry_pos > fp {
            self.page.move_data(fp, fp + entry_size, entry_pos - fp);
        }
        self.page.set_i32(FREE_POINTER_OFFSET, to_i32(fp + entry_size));
        self.shift_slots_below(entry_pos, entry_size, new_size, None);

        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketRemoveLeafEntry {
            index: index as u32,
            key_size: key_size as u32,
            delta,
        });
        new_size
    }

    /// Inserts an internal entry at slot `index`.
    ///
    /// When the entry is not the last one, the following entry's left child
    /// is rewritten to `right` so neighbouring entries keep sharing a child.
    pub fn add_non_leaf_entry(&mut self, index: usize, left: u32, right: u32, key: &[u8]) -> bool {
        assert!(!self.is_leaf(), "add_non_leaf_entry applies to internal buckets only");
        let key_len = i16::try_from(key.len())
            .unwrap_or_else(|_| panic!("key of {} bytes exceeds i16 length", key.len()));
        let mut entry = Vec::with_capacity(non_leaf_entry_size(key.len()));
        entry.extend_from_slice(&(left as i32).to_le_bytes());
        entry.extend_from_slice(&(right as i32).to_le_bytes());
        entry.extend_from_slice(&key_len.to_le_bytes());
        entry.extend_from_slice(key);

        let Some(snapshot) = self.place_entry(index, &entry, Some(right)) else {
            return false;
        };
        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketAddNonLeafEntry {
            index: index as u32,
            left_child: left,
            right_child: right,
            delta,
        });
        true
    }

    /// Removes internal slot `index`, reading its key size from the page.
    pub fn remove_non_leaf_entry_at(
        &mut self,
        index: usize,
        remove_left_child_pointer: bool,
    ) -> usize {
        assert!(!self.is_leaf(), "remove_non_leaf_entry applies to internal buckets only");
        let key_size = self.key_len_at(self.entry_position(index) + 2 * CHILD_POINTER_LEN);
        self.remove_non_leaf_entry(index, key_size, remove_left_child_pointer)
    }

    /// Removes internal slot `index` whose key is `key_size` bytes long.
    ///
    /// The surviving child (`right` when `remove_left_child_pointer`, else
    /// `left`) becomes the right child of the previous entry and the left
    /// child of the next one. Returns the new size.
    pub fn remove_non_leaf_entry(
        &mut self,
        index: usize,
        key_size: usize,
        remove_left_child_pointer: bool,
    ) -> usize {
        assert!(!self.is_leaf(), "remove_non_leaf_entry applies to internal buckets only");
        let size = self.size();
        let entry_pos = self.entry_position(index);
        let entry_size = non_leaf_entry_size(key_size);
        let left = self.page.get_i32(entry_pos);
        let right = self.page.get_i32(entry_pos + CHILD_POINTER_LEN);
        let fp = self.free_pointer();
        let page_size = self.page.page_size();
        let snapshot = self
            .page
            .snapshot(&[FREE_POINTER_OFFSET..slot_offset(size), fp..page_size]);

        if index + 1 < size {
            self.page.move_data(
                slot_offset(index + 1),
                slot_offset(index),
                (size - index - 1) * SLOT_LEN,
            );
        }
        let new_size = size - 1;
        self.page.set_i32(SIZE_OFFSET, to_i32(new_size));
        if new_size > 0 && entry_pos > fp {
            self.page.move_data(fp, fp + entry_size, entry_pos - fp);
            self.shift_slots_below(entry_pos, entry_size, new_size, None);
        }
        self.page.set_i32(FREE_POINTER_OFFSET, to_i32(fp + entry_size));

        if new_size > 0 {
            let child = if remove_left_child_pointer { right } else { left };
            if index > 0 {
                let prev = self.entry_position(index - 1);
                self.page.set_i32(prev + CHILD_POINTER_LEN, child);
            }
            if index < new_size {
                let next = self.entry_position(index);
                self.page.set_i32(next, child);
            }
        }

        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketRemoveNonLeafEntry {
            index: index as u32,
            key_size: key_size as u32,
            remove_left_child_pointer,
            delta,
        });
        new_size
    }

    /// Replaces the key of internal slot `index`, keeping both children.
    ///
    /// Returns `false` without touching the page when a longer key does not
    /// fit.
    pub fn update_key(&mut self, index: usize, key: &[u8]) -> bool {
        assert!(!self.is_leaf(), "update_key applies to internal buckets only");
        let new_len = i16::try_from(key.len())
            .unwrap_or_else(|_| panic!("key of {} bytes exceeds i16 length", key.len()));
        let size = self.size();
        let entry_pos = self.entry_position(index);
        let key_at = entry_pos + 2 * CHILD_POINTER_LEN;
        let old_len = self.key_len_at(key_at);

        if key.len() == old_len {
            let at = key_at + KEY_LEN_SIZE;
            let snapshot = self.page.snapshot(&[at..at + old_len]);
            self.page.set_binary(at, key);
            let delta = self.page.delta(&snapshot);
            self.log_update_key(index, old_len, key.len(), delta);
            return true;
        }

        let fp = self.free_pointer();
        let Some(new_fp) = (fp + old_len)
            .checked_sub(key.len())
            .filter(|&p| p >= slot_offset(size))
        else {
            return false;
        };
        let old_entry_size = non_leaf_entry_size(old_len);
        let left = self.page.get_i32(entry_pos);
        let right = self.page.get_i32(entry_pos + CHILD_POINTER_LEN);
        let snapshot = self.page.snapshot(&[
            FREE_POINTER_OFFSET..slot_offset(size),
            fp.min(new_fp)..entry_pos + old_entry_size,
        ]);

        if entry_pos > fp {
            self.page.move_data(fp, fp + old_entry_size, entry_pos - fp);
            self.shift_slots_below(entry_pos, old_entry_size, size, Some(index));
        }
        self.page.set_i32(FREE_POINTER_OFFSET, to_i32(new_fp));
        self.page.set_i32(slot_offset(index), to_i32(new_fp));
        self.page.set_i32(new_fp, left);
        self.page.set_i32(new_fp + CHILD_POINTER_LEN, right);
        self.page.set_i16(new_fp + 2 * CHILD_POINTER_LEN, new_len);
        self.page
            .set_binary(new_fp + 2 * CHILD_POINTER_LEN + KEY_LEN_SIZE, key);

        let delta = self.page.delta(&snapshot);
        self.log_update_key(index, old_len, key.len(), delta);
        true
    }

    fn log_update_key(
        &mut self,
        index: usize,
        old_key_size: usize,
        new_key_size: usize,
        delta: PageDelta,
    ) {
        self.page.log(PageOperationBody::BucketUpdateKey {
            index: index as u32,
            old_key_size: old_key_size as u32,
            new_key_size: new_key_size as u32,
            delta,
        });
    }

    /// Overwrites the record id of leaf slot `index`.
    pub fn update_value(&mut self, index: usize, value: RecordId, key_size: usize) {
        assert!(self.is_leaf(), "update_value applies to leaf buckets only");
        let at = self.entry_position(index) + KEY_LEN_SIZE + key_size;
        let old = RecordId::new(self.page.get_i16(at), self.page.get_i64(at + 2));
        self.page.set_i16(at, value.cluster_id);
        self.page.set_i64(at + 2, value.cluster_position);
        self.page.log(PageOperationBody::BucketUpdateValue {
            index: index as u32,
            key_size: key_size as u32,
            old,
            new: value,
        });
    }

    /// Appends already encoded entries after the current last slot.
    ///
    /// Entries must be of this bucket's kind and sort after the existing
    /// keys. Returns `false` without touching the page when they do not all
    /// fit.
    pub fn add_all<E: AsRef<[u8]>>(&mut self, raw_entries: &[E]) -> bool {
        let size = self.size();
        let count = raw_entries.len();
        let total: usize = raw_entries.iter().map(|e| e.as_ref().len()).sum();
        let fp = self.free_pointer();
        let Some(new_fp) = fp
            .checked_sub(total)
            .filter(|&p| p >= slot_offset(size + count))
        else {
            return false;
        };
        let snapshot = self.page.snapshot(&[
            FREE_POINTER_OFFSET..slot_offset(size + count),
            new_fp..fp,
        ]);
        for (i, raw) in raw_entries.iter().enumerate() {
            self.append_raw(size + i, raw.as_ref());
        }
        self.page.set_i32(SIZE_OFFSET, to_i32(size + count));

        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketAddAll {
            first_index: size as u32,
            count: count as u32,
            delta,
        });
        true
    }

    /// Keeps the first `new_size` entries, repacking them against the end of
    /// the page.
    pub fn shrink(&mut self, new_size: usize) {
        let size = self.size();
        assert!(
            new_size <= size,
            "cannot shrink a bucket of {size} entries to {new_size}"
        );
        let kept: Vec<Vec<u8>> = (0..new_size).map(|i| self.raw_entry(i).to_vec()).collect();
        let page_size = self.page.page_size();
        let new_fp = page_size - kept.iter().map(Vec::len).sum::<usize>();
        let fp = self.free_pointer();
        let snapshot = self.page.snapshot(&[
            FREE_POINTER_OFFSET..slot_offset(size),
            fp.min(new_fp)..page_size,
        ]);

        let reset = self.page_size_i32();
        self.page.set_i32(FREE_POINTER_OFFSET, reset);
        for (i, raw) in kept.iter().enumerate() {
            self.append_raw(i, raw);
        }
        self.page.set_i32(SIZE_OFFSET, to_i32(new_size));

        let delta = self.page.delta(&snapshot);
        self.page.log(PageOperationBody::BucketShrink {
            old_size: size as u32,
            new_size: new_size as u32,
            delta,
        });
    }
}
