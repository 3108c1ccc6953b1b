//! Page operation records: one redo/undo log entry per page mutation.
//!
//! Stream layout of a record (little-endian):
//!
//! ```text
//! [fileId:8][pageIndex:8][operationUnitId:8][kind-specific payload...]
//! ```
//!
//! The kind tag itself is not part of the record stream; log segments frame
//! it separately so that `from_stream` receives it out of band.

use core::convert::TryFrom;

use crate::primitives::bytes::buf::{Cursor, Writer};
use crate::primitives::bytes::le;
use crate::primitives::cache::CacheEntry;
use crate::storage::{bucket, cluster_state, directory};
use crate::types::{CellarError, FileId, OperationUnitId, PageIndex, RecordId, Result};
use crate::wal::delta::PageDelta;

/// One-byte tag identifying a page operation kind in log segments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    /// Bucket header reset.
    BucketInit = 1,
    /// Leaf flag flip on an empty bucket.
    BucketSwitchType = 2,
    /// Left sibling pointer change.
    BucketSetLeftSibling = 3,
    /// Right sibling pointer change.
    BucketSetRightSibling = 4,
    /// Free-list link change.
    BucketSetNextFreeListPage = 5,
    /// Leaf value rewrite.
    BucketUpdateValue = 6,
    /// Leaf entry insertion.
    BucketAddLeafEntry = 7,
    /// Bulk append of raw entries.
    BucketAddAll = 8,
    /// Compaction to a prefix of the entries.
    BucketShrink = 9,
    /// Leaf entry removal.
    BucketRemoveLeafEntry = 10,
    /// Internal entry insertion.
    BucketAddNonLeafEntry = 11,
    /// Internal entry removal.
    BucketRemoveNonLeafEntry = 12,
    /// Internal key rewrite.
    BucketUpdateKey = 13,
    /// Cluster size change.
    ClusterStateSetSize = 20,
    /// Cluster records size change.
    ClusterStateSetRecordsSize = 21,
    /// Cluster free-list slot change.
    ClusterStateSetFreeListPage = 22,
    /// Directory node max left child depth change.
    DirectorySetMaxLeftChildDepth = 30,
    /// Directory node max right child depth change.
    DirectorySetMaxRightChildDepth = 31,
    /// Directory node local depth change.
    DirectorySetNodeLocalDepth = 32,
    /// Directory node pointer change.
    DirectorySetPointer = 33,
}

impl OperationKind {
    /// Tag byte written to log segments.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OperationKind {
    type Error = CellarError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::BucketInit,
            2 => Self::BucketSwitchType,
            3 => Self::BucketSetLeftSibling,
            4 => Self::BucketSetRightSibling,
            5 => Self::BucketSetNextFreeListPage,
            6 => Self::BucketUpdateValue,
            7 => Self::BucketAddLeafEntry,
            8 => Self::BucketAddAll,
            9 => Self::BucketShrink,
            10 => Self::BucketRemoveLeafEntry,
            11 => Self::BucketAddNonLeafEntry,
            12 => Self::BucketRemoveNonLeafEntry,
            13 => Self::BucketUpdateKey,
            20 => Self::ClusterStateSetSize,
            21 => Self::ClusterStateSetRecordsSize,
            22 => Self::ClusterStateSetFreeListPage,
            30 => Self::DirectorySetMaxLeftChildDepth,
            31 => Self::DirectorySetMaxRightChildDepth,
            32 => Self::DirectorySetNodeLocalDepth,
            33 => Self::DirectorySetPointer,
            other => return Err(CellarError::UnknownOperation(other)),
        })
    }
}

/// Bucket header fields as they were before a `BucketInit`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BucketHeaderImage {
    /// Previous free pointer (or free-list link).
    pub free_pointer: i32,
    /// Previous entry count.
    pub size: i32,
    /// Previous raw leaf flag byte.
    pub is_leaf: u8,
    /// Previous raw left sibling.
    pub left_sibling: i64,
    /// Previous raw right sibling.
    pub right_sibling: i64,
}

impl BucketHeaderImage {
    const LEN: usize = 4 + 4 + 1 + 8 + 8;

    pub(crate) fn read_from(page: &[u8]) -> Self {
        Self {
            free_pointer: le::get_i32(page, bucket::FREE_POINTER_OFFSET),
            size: le::get_i32(page, bucket::SIZE_OFFSET),
            is_leaf: le::get_u8(page, bucket::IS_LEAF_OFFSET),
            left_sibling: le::get_i64(page, bucket::LEFT_SIBLING_OFFSET),
            right_sibling: le::get_i64(page, bucket::RIGHT_SIBLING_OFFSET),
        }
    }

    fn write_to(&self, page: &mut [u8]) {
        le::put_i32(page, bucket::FREE_POINTER_OFFSET, self.free_pointer);
        le::put_i32(page, bucket::SIZE_OFFSET, self.size);
        le::put_u8(page, bucket::IS_LEAF_OFFSET, self.is_leaf);
        le::put_i64(page, bucket::LEFT_SIBLING_OFFSET, self.left_sibling);
        le::put_i64(page, bucket::RIGHT_SIBLING_OFFSET, self.right_sibling);
    }
}

/// Kind-specific payload of a page operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PageOperationBody {
    /// `Bucket::init`; the new header is derived from `is_leaf` and the page size.
    BucketInit {
        /// Kind the bucket was initialised to.
        is_leaf: bool,
        /// Header before initialisation.
        previous: BucketHeaderImage,
    },
    /// `Bucket::switch_bucket_type`.
    BucketSwitchType {
        /// Raw leaf flag before.
        old: u8,
        /// Raw leaf flag after.
        new: u8,
    },
    /// `Bucket::set_left_sibling`.
    BucketSetLeftSibling {
        /// Raw sibling before (`-1` for none).
        old: i64,
        /// Raw sibling after.
        new: i64,
    },
    /// `Bucket::set_right_sibling`.
    BucketSetRightSibling {
        /// Raw sibling before (`-1` for none).
        old: i64,
        /// Raw sibling after.
        new: i64,
    },
    /// `Bucket::set_next_free_list_page`.
    BucketSetNextFreeListPage {
        /// Link before.
        old: i32,
        /// Link after.
        new: i32,
    },
    /// `Bucket::update_value`.
    BucketUpdateValue {
        /// Slot whose value changed.
        index: u32,
        /// Key length of that slot's entry.
        key_size: u32,
        /// Value before.
        old: RecordId,
        /// Value after.
        new: RecordId,
    },
    /// `Bucket::add_leaf_entry` / `Bucket::add_raw_leaf_entry`.
    BucketAddLeafEntry {
        /// Slot the entry was inserted at.
        index: u32,
        /// Encoded entry length.
        entry_size: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::add_all`.
    BucketAddAll {
        /// Slot of the first appended entry.
        first_index: u32,
        /// Number of appended entries.
        count: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::shrink`.
    BucketShrink {
        /// Entry count before.
        old_size: u32,
        /// Entry count after.
        new_size: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::remove_leaf_entry`.
    BucketRemoveLeafEntry {
        /// Removed slot.
        index: u32,
        /// Key length of the removed entry.
        key_size: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::add_non_leaf_entry`.
    BucketAddNonLeafEntry {
        /// Slot the entry was inserted at.
        index: u32,
        /// Left child of the new entry.
        left_child: u32,
        /// Right child of the new entry.
        right_child: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::remove_non_leaf_entry`.
    BucketRemoveNonLeafEntry {
        /// Removed slot.
        index: u32,
        /// Key length of the removed entry.
        key_size: u32,
        /// Which child pointer was dropped.
        remove_left_child_pointer: bool,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `Bucket::update_key`.
    BucketUpdateKey {
        /// Rewritten slot.
        index: u32,
        /// Key length before.
        old_key_size: u32,
        /// Key length after.
        new_key_size: u32,
        /// Changed bytes.
        delta: PageDelta,
    },
    /// `ClusterState::set_size`.
    ClusterStateSetSize {
        /// Size before.
        old_size: i32,
        /// Size after.
        new_size: i32,
    },
    /// `ClusterState::set_records_size`.
    ClusterStateSetRecordsSize {
        /// Records size before.
        old: i32,
        /// Records size after.
        new: i32,
    },
    /// `ClusterState::set_free_list_page`.
    ClusterStateSetFreeListPage {
        /// Free-list slot.
        index: u32,
        /// Page before.
        old: i32,
        /// Page after.
        new: i32,
    },
    /// `DirectoryPage::set_max_left_child_depth`.
    DirectorySetMaxLeftChildDepth {
        /// Node within the page.
        local_node_index: u32,
        /// Depth before.
        old: u8,
        /// Depth after.
        new: u8,
    },
    /// `DirectoryPage::set_max_right_child_depth`.
    DirectorySetMaxRightChildDepth {
        /// Node within the page.
        local_node_index: u32,
        /// Depth before.
        old: u8,
        /// Depth after.
        new: u8,
    },
    /// `DirectoryPage::set_node_local_depth`.
    DirectorySetNodeLocalDepth {
        /// Node within the page.
        local_node_index: u32,
        /// Depth before.
        old: u8,
        /// Depth after.
        new: u8,
    },
    /// `DirectoryPage::set_pointer`.
    DirectorySetPointer {
        /// Node within the page.
        local_node_index: u32,
        /// Pointer slot within the node.
        index: u32,
        /// Pointer before.
        old: i64,
        /// Pointer after.
        new: i64,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    Redo,
    Undo,
}

impl Direction {
    fn pick<T>(self, old: T, new: T) -> T {
        match self {
            Direction::Redo => new,
            Direction::Undo => old,
        }
    }
}

impl PageOperationBody {
    /// Tag of this payload.
    pub fn kind(&self) -> OperationKind {
        use PageOperationBody as B;
        match self {
            B::BucketInit { .. } => OperationKind::BucketInit,
            B::BucketSwitchType { .. } => OperationKind::BucketSwitchType,
            B::BucketSetLeftSibling { .. } => OperationKind::BucketSetLeftSibling,
            B::BucketSetRightSibling { .. } => OperationKind::BucketSetRightSibling,
            B::BucketSetNextFreeListPage { .. } => OperationKind::BucketSetNextFreeListPage,
            B::BucketUpdateValue { .. } => OperationKind::BucketUpdateValue,
            B::BucketAddLeafEntry { .. } => OperationKind::BucketAddLeafEntry,
            B::BucketAddAll { .. } => OperationKind::BucketAddAll,
            B::BucketShrink { .. } => OperationKind::BucketShrink,
            B::BucketRemoveLeafEntry { .. } => OperationKind::BucketRemoveLeafEntry,
            B::BucketAddNonLeafEntry { .. } => OperationKind::BucketAddNonLeafEntry,
            B::BucketRemoveNonLeafEntry { .. } => OperationKind::BucketRemoveNonLeafEntry,
            B::BucketUpdateKey { .. } => OperationKind::BucketUpdateKey,
            B::ClusterStateSetSize { .. } => OperationKind::ClusterStateSetSize,
            B::ClusterStateSetRecordsSize { .. } => OperationKind::ClusterStateSetRecordsSize,
            B::ClusterStateSetFreeListPage { .. } => OperationKind::ClusterStateSetFreeListPage,
            B::DirectorySetMaxLeftChildDepth { .. } => OperationKind::DirectorySetMaxLeftChildDepth,
            B::DirectorySetMaxRightChildDepth { .. } => {
                OperationKind::DirectorySetMaxRightChildDepth
            }
            B::DirectorySetNodeLocalDepth { .. } => OperationKind::DirectorySetNodeLocalDepth,
            B::DirectorySetPointer { .. } => OperationKind::DirectorySetPointer,
        }
    }

    /// Structural delta carried by the payload, if any.
    pub fn delta(&self) -> Option<&PageDelta> {
        use PageOperationBody as B;
        match self {
            B::BucketAddLeafEntry { delta, .. }
            | B::BucketAddAll { delta, .. }
            | B::BucketShrink { delta, .. }
            | B::BucketRemoveLeafEntry { delta, .. }
            | B::BucketAddNonLeafEntry { delta, .. }
            | B::BucketRemoveNonLeafEntry { delta, .. }
            | B::BucketUpdateKey { delta, .. } => Some(delta),
            _ => None,
        }
    }

    fn serialized_size(&self) -> usize {
        use PageOperationBody as B;
        match self {
            B::BucketInit { .. } => 1 + BucketHeaderImage::LEN,
            B::BucketSwitchType { .. } => 2,
            B::BucketSetLeftSibling { .. } | B::BucketSetRightSibling { .. } => 16,
            B::BucketSetNextFreeListPage { .. } => 8,
            B::BucketUpdateValue { .. } => 8 + 2 * RecordId::SIZE,
            B::BucketAddLeafEntry { delta, .. }
            | B::BucketAddAll { delta, .. }
            | B::BucketShrink { delta, .. }
            | B::BucketRemoveLeafEntry { delta, .. } => 8 + delta.serialized_size(),
            B::BucketAddNonLeafEntry { delta, .. } | B::BucketUpdateKey { delta, .. } => {
                12 + delta.serialized_size()
            }
            B::BucketRemoveNonLeafEntry { delta, .. } => 9 + delta.serialized_size(),
            B::ClusterStateSetSize { .. } | B::ClusterStateSetRecordsSize { .. } => 8,
            B::ClusterStateSetFreeListPage { .. } => 12,
            B::DirectorySetMaxLeftChildDepth { .. }
            | B::DirectorySetMaxRightChildDepth { .. }
            | B::DirectorySetNodeLocalDepth { .. } => 6,
            B::DirectorySetPointer { .. } => 24,
        }
    }

    fn write(&self, w: &mut Writer<'_>) {
        use PageOperationBody as B;
        match self {
            B::BucketInit { is_leaf, previous } => {
                w.put_u8(u8::from(*is_leaf));
                w.put_i32(previous.free_pointer);
                w.put_i32(previous.size);
                w.put_u8(previous.is_leaf);
                w.put_i64(previous.left_sibling);
                w.put_i64(previous.right_sibling);
            }
            B::BucketSwitchType { old, new } => {
                w.put_u8(*old);
                w.put_u8(*new);
            }
            B::BucketSetLeftSibling { old, new } | B::BucketSetRightSibling { old, new } => {
                w.put_i64(*old);
                w.put_i64(*new);
            }
            B::BucketSetNextFreeListPage { old, new } => {
                w.put_i32(*old);
                w.put_i32(*new);
            }
            B::BucketUpdateValue {
                index,
                key_size,
                old,
                new,
            } => {
                w.put_u32(*index);
                w.put_u32(*key_size);
                put_rid(w, *old);
                put_rid(w, *new);
            }
            B::BucketAddLeafEntry {
                index,
                entry_size,
                delta,
            } => {
                w.put_u32(*index);
                w.put_u32(*entry_size);
                delta.write(w);
            }
            B::BucketAddAll {
                first_index,
                count,
                delta,
            } => {
                w.put_u32(*first_index);
                w.put_u32(*count);
                delta.write(w);
            }
            B::BucketShrink {
                old_size,
                new_size,
                delta,
            } => {
                w.put_u32(*old_size);
                w.put_u32(*new_size);
                delta.write(w);
            }
            B::BucketRemoveLeafEntry {
                index,
                key_size,
                delta,
            } => {
                w.put_u32(*index);
                w.put_u32(*key_size);
                delta.write(w);
            }
            B::BucketAddNonLeafEntry {
                index,
                left_child,
                right_child,
                delta,
            } => {
                w.put_u32(*index);
                w.put_u32(*left_child);
                w.put_u32(*right_child);
                delta.write(w);
            }
            B::BucketRemoveNonLeafEntry {
                index,
                key_size,
                remove_left_child_pointer,
                delta,
            } => {
                w.put_u32(*index);
                w.put_u32(*key_size);
                w.put_u8(u8::from(*remove_left_child_pointer));
                delta.write(w);
            }
            B::BucketUpdateKey {
                index,
                old_key_size,
                new_key_size,
                delta,
            } => {
                w.put_u32(*index);
                w.put_u32(*old_key_size);
                w.put_u32(*new_key_size);
                delta.write(w);
            }
            B::ClusterStateSetSize { old_size, new_size } => {
                w.put_i32(*old_size);
                w.put_i32(*new_size);
            }
            B::ClusterStateSetRecordsSize { old, new } => {
                w.put_i32(*old);
                w.put_i32(*new);
            }
            B::ClusterStateSetFreeListPage { index, old, new } => {
                w.put_u32(*index);
                w.put_i32(*old);
                w.put_i32(*new);
            }
            B::DirectorySetMaxLeftChildDepth {
                local_node_index,
                old,
                new,
            }
            | B::DirectorySetMaxRightChildDepth {
                local_node_index,
                old,
                new,
            }
            | B::DirectorySetNodeLocalDepth {
                local_node_index,
                old,
                new,
            } => {
                w.put_u32(*local_node_index);
                w.put_u8(*old);
                w.put_u8(*new);
            }
            B::DirectorySetPointer {
                local_node_index,
                index,
                old,
                new,
            } => {
                w.put_u32(*local_node_index);
                w.put_u32(*index);
                w.put_i64(*old);
                w.put_i64(*new);
            }
        }
    }

    fn read(kind: OperationKind, cur: &mut Cursor<'_>) -> Result<Self> {
        use OperationKind as K;
        use PageOperationBody as B;
        Ok(match kind {
            K::BucketInit => B::BucketInit {
                is_leaf: read_bool(cur)?,
                previous: BucketHeaderImage {
                    free_pointer: cur.read_i32()?,
                    size: cur.read_i32()?,
                    is_leaf: cur.read_u8()?,
                    left_sibling: cur.read_i64()?,
                    right_sibling: cur.read_i64()?,
                },
            },
            K::BucketSwitchType => B::BucketSwitchType {
                old: cur.read_u8()?,
                new: cur.read_u8()?,
            },
            K::BucketSetLeftSibling => B::BucketSetLeftSibling {
                old: cur.read_i64()?,
                new: cur.read_i64()?,
            },
            K::BucketSetRightSibling => B::BucketSetRightSibling {
                old: cur.read_i64()?,
                new: cur.read_i64()?,
            },
            K::BucketSetNextFreeListPage => B::BucketSetNextFreeListPage {
                old: cur.read_i32()?,
                new: cur.read_i32()?,
            },
            K::BucketUpdateValue => B::BucketUpdateValue {
                index: cur.read_u32()?,
                key_size: cur.read_u32()?,
                old: read_rid(cur)?,
                new: read_rid(cur)?,
            },
            K::BucketAddLeafEntry => B::BucketAddLeafEntry {
                index: cur.read_u32()?,
                entry_size: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketAddAll => B::BucketAddAll {
                first_index: cur.read_u32()?,
                count: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketShrink => B::BucketShrink {
                old_size: cur.read_u32()?,
                new_size: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketRemoveLeafEntry => B::BucketRemoveLeafEntry {
                index: cur.read_u32()?,
                key_size: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketAddNonLeafEntry => B::BucketAddNonLeafEntry {
                index: cur.read_u32()?,
                left_child: cur.read_u32()?,
                right_child: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketRemoveNonLeafEntry => B::BucketRemoveNonLeafEntry {
                index: cur.read_u32()?,
                key_size: cur.read_u32()?,
                remove_left_child_pointer: read_bool(cur)?,
                delta: PageDelta::read(cur)?,
            },
            K::BucketUpdateKey => B::BucketUpdateKey {
                index: cur.read_u32()?,
                old_key_size: cur.read_u32()?,
                new_key_size: cur.read_u32()?,
                delta: PageDelta::read(cur)?,
            },
            K::ClusterStateSetSize => B::ClusterStateSetSize {
                old_size: cur.read_i32()?,
                new_size: cur.read_i32()?,
            },
            K::ClusterStateSetRecordsSize => B::ClusterStateSetRecordsSize {
                old: cur.read_i32()?,
                new: cur.read_i32()?,
            },
            K::ClusterStateSetFreeListPage => B::ClusterStateSetFreeListPage {
                index: cur.read_u32()?,
                old: cur.read_i32()?,
                new: cur.read_i32()?,
            },
            K::DirectorySetMaxLeftChildDepth => B::DirectorySetMaxLeftChildDepth {
                local_node_index: cur.read_u32()?,
                old: cur.read_u8()?,
                new: cur.read_u8()?,
            },
            K::DirectorySetMaxRightChildDepth => B::DirectorySetMaxRightChildDepth {
                local_node_index: cur.read_u32()?,
                old: cur.read_u8()?,
                new: cur.read_u8()?,
            },
            K::DirectorySetNodeLocalDepth => B::DirectorySetNodeLocalDepth {
                local_node_index: cur.read_u32()?,
                old: cur.read_u8()?,
                new: cur.read_u8()?,
            },
            K::DirectorySetPointer => B::DirectorySetPointer {
                local_node_index: cur.read_u32()?,
                index: cur.read_u32()?,
                old: cur.read_i64()?,
                new: cur.read_i64()?,
            },
        })
    }

    fn apply(&self, page: &mut [u8], dir: Direction) -> Result<()> {
        use PageOperationBody as B;
        match self {
            B::BucketInit { is_leaf, previous } => {
                require(page, bucket::POSITIONS_ARRAY_OFFSET)?;
                match dir {
                    Direction::Redo => {
                        let free_pointer = i32::try_from(page.len())
                            .map_err(|_| CellarError::Corruption("page too large for bucket"))?;
                        BucketHeaderImage {
                            free_pointer,
                            size: 0,
                            is_leaf: u8::from(*is_leaf),
                            left_sibling: -1,
                            right_sibling: -1,
                        }
                        .write_to(page);
                    }
                    Direction::Undo => previous.write_to(page),
                }
            }
            B::BucketSwitchType { old, new } => {
                require(page, bucket::IS_LEAF_OFFSET + 1)?;
                le::put_u8(page, bucket::IS_LEAF_OFFSET, dir.pick(*old, *new));
            }
            B::BucketSetLeftSibling { old, new } => {
                require(page, bucket::LEFT_SIBLING_OFFSET + 8)?;
                le::put_i64(page, bucket::LEFT_SIBLING_OFFSET, dir.pick(*old, *new));
            }
            B::BucketSetRightSibling { old, new } => {
                require(page, bucket::RIGHT_SIBLING_OFFSET + 8)?;
                le::put_i64(page, bucket::RIGHT_SIBLING_OFFSET, dir.pick(*old, *new));
            }
            B::BucketSetNextFreeListPage { old, new } => {
                require(page, bucket::NEXT_FREE_LIST_PAGE_OFFSET + 4)?;
                le::put_i32(page, bucket::NEXT_FREE_LIST_PAGE_OFFSET, dir.pick(*old, *new));
            }
            B::BucketUpdateValue {
                index,
                key_size,
                old,
                new,
            } => {
                let slot = bucket::POSITIONS_ARRAY_OFFSET + *index as usize * bucket::SLOT_LEN;
                require(page, slot + bucket::SLOT_LEN)?;
                let entry = usize::try_from(le::get_i32(page, slot))
                    .map_err(|_| CellarError::Corruption("negative bucket slot offset"))?;
                let value_at = entry + bucket::KEY_LEN_SIZE + *key_size as usize;
                require(page, value_at + RecordId::SIZE)?;
                let rid = dir.pick(*old, *new);
                le::put_i16(page, value_at, rid.cluster_id);
                le::put_i64(page, value_at + 2, rid.cluster_position);
            }
            B::BucketAddLeafEntry { delta, .. }
            | B::BucketAddAll { delta, .. }
            | B::BucketShrink { delta, .. }
            | B::BucketRemoveLeafEntry { delta, .. }
            | B::BucketAddNonLeafEntry { delta, .. }
            | B::BucketRemoveNonLeafEntry { delta, .. }
            | B::BucketUpdateKey { delta, .. } => match dir {
                Direction::Redo => delta.apply_after(page)?,
                Direction::Undo => delta.apply_before(page)?,
            },
            B::ClusterStateSetSize { old_size, new_size } => {
                require(page, cluster_state::SIZE_OFFSET + 4)?;
                le::put_i32(page, cluster_state::SIZE_OFFSET, dir.pick(*old_size, *new_size));
            }
            B::ClusterStateSetRecordsSize { old, new } => {
                require(page, cluster_state::RECORDS_SIZE_OFFSET + 4)?;
                le::put_i32(page, cluster_state::RECORDS_SIZE_OFFSET, dir.pick(*old, *new));
            }
            B::ClusterStateSetFreeListPage { index, old, new } => {
                let offset = cluster_state::free_list_offset(*index as usize)
                    .ok_or(CellarError::Corruption("cluster free list index out of range"))?;
                require(page, offset + 4)?;
                le::put_i32(page, offset, dir.pick(*old, *new));
            }
            B::DirectorySetMaxLeftChildDepth {
                local_node_index,
                old,
                new,
            } => {
                let offset = directory::checked_node_offset(page.len(), *local_node_index)?
                    + directory::MAX_LEFT_CHILD_DEPTH;
                le::put_u8(page, offset, dir.pick(*old, *new));
            }
            B::DirectorySetMaxRightChildDepth {
                local_node_index,
                old,
                new,
            } => {
                let offset = directory::checked_node_offset(page.len(), *local_node_index)?
                    + directory::MAX_RIGHT_CHILD_DEPTH;
                le::put_u8(page, offset, dir.pick(*old, *new));
            }
            B::DirectorySetNodeLocalDepth {
                local_node_index,
                old,
                new,
            } => {
                let offset = directory::checked_node_offset(page.len(), *local_node_index)?
                    + directory::NODE_LOCAL_DEPTH;
                le::put_u8(page, offset, dir.pick(*old, *new));
            }
            B::DirectorySetPointer {
                local_node_index,
                index,
                old,
                new,
            } => {
                if *index as usize >= directory::LEVEL_SIZE {
                    return Err(CellarError::Corruption("directory pointer index out of range"));
                }
                let offset = directory::checked_node_offset(page.len(), *local_node_index)?
                    + directory::pointer_offset(*index as usize);
                le::put_i64(page, offset, dir.pick(*old, *new));
            }
        }
        Ok(())
    }
}

fn require(page: &[u8], end: usize) -> Result<()> {
    if end > page.len() {
        Err(CellarError::Corruption("page operation targets bytes beyond the page"))
    } else {
        Ok(())
    }
}

fn read_bool(cur: &mut Cursor<'_>) -> Result<bool> {
    match cur.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CellarError::Corruption("boolean field not 0 or 1")),
    }
}

fn put_rid(w: &mut Writer<'_>, rid: RecordId) {
    w.put_i16(rid.cluster_id);
    w.put_i64(rid.cluster_position);
}

fn read_rid(cur: &mut Cursor<'_>) -> Result<RecordId> {
    Ok(RecordId::new(cur.read_i16()?, cur.read_i64()?))
}

/// A page operation: envelope plus kind-specific payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageOperation {
    file_id: FileId,
    page_index: PageIndex,
    operation_unit_id: OperationUnitId,
    body: PageOperationBody,
}

impl PageOperation {
    /// Envelope length: `[fileId:8][pageIndex:8][operationUnitId:8]`.
    pub const ENVELOPE_LEN: usize = 24;

    /// Creates a record with a zeroed envelope.
    pub fn new(body: PageOperationBody) -> Self {
        Self::with_envelope(
            FileId::default(),
            PageIndex::default(),
            OperationUnitId::default(),
            body,
        )
    }

    /// Creates a record with the given envelope.
    pub fn with_envelope(
        file_id: FileId,
        page_index: PageIndex,
        operation_unit_id: OperationUnitId,
        body: PageOperationBody,
    ) -> Self {
        Self {
            file_id,
            page_index,
            operation_unit_id,
            body,
        }
    }

    /// File the target page belongs to.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Sets the target file.
    pub fn set_file_id(&mut self, file_id: FileId) {
        self.file_id = file_id;
    }

    /// Target page.
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    /// Sets the target page.
    pub fn set_page_index(&mut self, page_index: PageIndex) {
        self.page_index = page_index;
    }

    /// Operation unit the record belongs to.
    pub fn operation_unit_id(&self) -> OperationUnitId {
        self.operation_unit_id
    }

    /// Sets the operation unit.
    pub fn set_operation_unit_id(&mut self, unit: OperationUnitId) {
        self.operation_unit_id = unit;
    }

    /// Kind-specific payload.
    pub fn body(&self) -> &PageOperationBody {
        &self.body
    }

    /// Tag of the payload.
    pub fn kind(&self) -> OperationKind {
        self.body.kind()
    }

    /// Bytes written by [`PageOperation::to_stream`].
    pub fn serialized_size(&self) -> usize {
        Self::ENVELOPE_LEN + self.body.serialized_size()
    }

    /// Writes the record into `dst` at `offset`, returning the offset after it.
    ///
    /// Panics if `dst` is shorter than `offset + serialized_size()`.
    pub fn to_stream(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut w = Writer::at(dst, offset);
        w.put_u64(self.file_id.0);
        w.put_u64(self.page_index.0);
        w.put_u64(self.operation_unit_id.0);
        self.body.write(&mut w);
        w.position()
    }

    /// Decodes a record of `kind` from `src` at `offset`.
    ///
    /// Returns the record and the offset just past it.
    pub fn from_stream(kind: OperationKind, src: &[u8], offset: usize) -> Result<(Self, usize)> {
        let mut cur = Cursor::at(src, offset);
        let file_id = FileId(cur.read_u64()?);
        let page_index = PageIndex(cur.read_u64()?);
        let operation_unit_id = OperationUnitId(cur.read_u64()?);
        let body = PageOperationBody::read(kind, &mut cur)?;
        Ok((
            Self {
                file_id,
                page_index,
                operation_unit_id,
                body,
            },
            cur.off,
        ))
    }

    /// Re-applies the mutation to the page held by `entry`.
    pub fn redo(&self, entry: &mut CacheEntry) -> Result<()> {
        self.check_target(entry)?;
        let mut buf = entry.raw_page_mut();
        self.redo_page(&mut buf)
    }

    /// Reverts the mutation on the page held by `entry`.
    pub fn undo(&self, entry: &mut CacheEntry) -> Result<()> {
        self.check_target(entry)?;
        let mut buf = entry.raw_page_mut();
        self.undo_page(&mut buf)
    }

    /// Re-applies the mutation to a bare page image.
    pub fn redo_page(&self, page: &mut [u8]) -> Result<()> {
        self.body.apply(page, Direction::Redo)
    }

    /// Reverts the mutation on a bare page image.
    pub fn undo_page(&self, page: &mut [u8]) -> Result<()> {
        self.body.apply(page, Direction::Undo)
    }

    fn check_target(&self, entry: &CacheEntry) -> Result<()> {
        if entry.file_id() != self.file_id || entry.page_index() != self.page_index {
            return Err(CellarError::PageMismatch {
                record_file: self.file_id,
                record_page: self.page_index,
                entry_file: entry.file_id(),
                entry_page: entry.page_index(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_roundtrip(op: &PageOperation) -> PageOperation {
        let size = op.serialized_size();
        let mut stream = vec![0u8; size + 1];
        let end = op.to_stream(&mut stream, 1);
        assert_eq!(end, size + 1);
        let (decoded, pos) = PageOperation::from_stream(op.kind(), &stream, 1).unwrap();
        assert_eq!(pos, size + 1);
        decoded
    }

    #[test]
    fn cluster_size_payload_layout() {
        let mut op = PageOperation::new(PageOperationBody::ClusterStateSetSize {
            old_size: 12,
            new_size: 42,
        });
        op.set_file_id(FileId(42));
        op.set_page_index(PageIndex(24));
        op.set_operation_unit_id(OperationUnitId(1));
        assert_eq!(op.serialized_size(), 24 + 8);

        let mut stream = vec![0u8; op.serialized_size()];
        op.to_stream(&mut stream, 0);
        assert_eq!(&stream[0..8], &42u64.to_le_bytes());
        assert_eq!(&stream[8..16], &24u64.to_le_bytes());
        assert_eq!(&stream[16..24], &1u64.to_le_bytes());
        assert_eq!(&stream[24..28], &12i32.to_le_bytes());
        assert_eq!(&stream[28..32], &42i32.to_le_bytes());
        assert_eq!(stream_roundtrip(&op), op);
    }

    #[test]
    fn directory_depth_payload_layout() {
        let op = PageOperation::with_envelope(
            FileId(42),
            PageIndex(24),
            OperationUnitId(1),
            PageOperationBody::DirectorySetMaxLeftChildDepth {
                local_node_index: 2,
                old: 21,
                new: 12,
            },
        );
        assert_eq!(op.serialized_size(), 24 + 6);
        let mut stream = vec![0u8; op.serialized_size()];
        op.to_stream(&mut stream, 0);
        assert_eq!(&stream[24..28], &2u32.to_le_bytes());
        assert_eq!(stream[28], 21);
        assert_eq!(stream[29], 12);
        assert_eq!(stream_roundtrip(&op), op);
    }

    #[test]
    fn every_kind_tag_roundtrips() {
        for tag in 0u8..=255 {
            match OperationKind::try_from(tag) {
                Ok(kind) => assert_eq!(kind.as_u8(), tag),
                Err(CellarError::UnknownOperation(t)) => assert_eq!(t, tag),
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn short_stream_is_truncation_not_panic() {
        let op = PageOperation::new(PageOperationBody::BucketSetLeftSibling { old: -1, new: 9 });
        let mut stream = vec![0u8; op.serialized_size()];
        op.to_stream(&mut stream, 0);
        let err =
            PageOperation::from_stream(op.kind(), &stream[..stream.len() - 3], 0).unwrap_err();
        assert!(matches!(err, CellarError::Truncated { .. }));
    }

    #[test]
    fn bad_boolean_is_corruption() {
        let op = PageOperation::new(PageOperationBody::BucketRemoveNonLeafEntry {
            index: 0,
            key_size: 3,
            remove_left_child_pointer: true,
            delta: PageDelta::default(),
        });
        let mut stream = vec![0u8; op.serialized_size()];
        op.to_stream(&mut stream, 0);
        stream[24 + 8] = 7;
        let err = PageOperation::from_stream(op.kind(), &stream, 0).unwrap_err();
        assert!(matches!(err, CellarError::Corruption(_)));
    }

    #[test]
    fn scalar_ops_redo_and_undo_on_bare_pages() {
        let mut page = vec![0u8; 64 * 1024];
        let op = PageOperation::new(PageOperationBody::DirectorySetPointer {
            local_node_index: 1,
            index: 255,
            old: 0,
            new: 77,
        });
        op.redo_page(&mut page).unwrap();
        let at = directory::ITEMS_OFFSET + directory::NODE_SIZE + directory::pointer_offset(255);
        assert_eq!(le::get_i64(&page, at), 77);
        op.undo_page(&mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0));

        // a 4 KiB page holds a single directory node
        let mut small = vec![0u8; 4096];
        let err = op.redo_page(&mut small).unwrap_err();
        assert!(matches!(err, CellarError::Corruption(_)));
        assert!(small.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_page_targets_are_corruption() {
        let mut page = vec![0u8; 1024];
        let op = PageOperation::new(PageOperationBody::DirectorySetNodeLocalDepth {
            local_node_index: 5,
            old: 0,
            new: 1,
        });
        assert!(matches!(
            op.redo_page(&mut page),
            Err(CellarError::Corruption(_))
        ));
        let op = PageOperation::new(PageOperationBody::ClusterStateSetFreeListPage {
            index: 1000,
            old: 0,
            new: 1,
        });
        assert!(matches!(
            op.redo_page(&mut page),
            Err(CellarError::Corruption(_))
        ));
    }
}
