//! Hash-table directory page: an array of fixed-size directory nodes.
//!
//! Node layout, starting at `ITEMS_OFFSET + local_node_index * NODE_SIZE`:
//!
//! ```text
//! +0  u8        max left child depth
//! +1  u8        max right child depth
//! +2  u8        node local depth
//! +3  i64[256]  pointers
//! ```

use crate::storage::durable::{DurablePage, PageMut};
use crate::types::page::NEXT_FREE_POSITION;
use crate::types::{CellarError, Result};
use crate::wal::po::PageOperationBody;

/// First node.
pub const ITEMS_OFFSET: usize = NEXT_FREE_POSITION;
/// Pointers per node.
pub const LEVEL_SIZE: usize = 256;
/// Depth bytes preceding the pointers of a node.
pub const NODE_HEADER_LEN: usize = 3;
/// Encoded size of one node.
pub const NODE_SIZE: usize = NODE_HEADER_LEN + LEVEL_SIZE * 8;

/// Node-relative offset of the max left child depth.
pub const MAX_LEFT_CHILD_DEPTH: usize = 0;
/// Node-relative offset of the max right child depth.
pub const MAX_RIGHT_CHILD_DEPTH: usize = 1;
/// Node-relative offset of the node local depth.
pub const NODE_LOCAL_DEPTH: usize = 2;

/// Nodes that fit in a page of `page_size` bytes.
pub const fn nodes_per_page(page_size: usize) -> usize {
    page_size.saturating_sub(ITEMS_OFFSET) / NODE_SIZE
}

/// Node-relative offset of pointer `index`.
pub const fn pointer_offset(index: usize) -> usize {
    NODE_HEADER_LEN + index * 8
}

/// Offset of node `local_node_index`, or a corruption error when the page
/// cannot hold it.
pub fn checked_node_offset(page_size: usize, local_node_index: u32) -> Result<usize> {
    let local = local_node_index as usize;
    if local >= nodes_per_page(page_size) {
        return Err(CellarError::Corruption("directory node index beyond page"));
    }
    Ok(ITEMS_OFFSET + local * NODE_SIZE)
}

/// View of a page as a directory page.
pub struct DirectoryPage<P> {
    page: P,
}

impl<P: DurablePage> DirectoryPage<P> {
    /// Wraps a page.
    pub fn new(page: P) -> Self {
        Self { page }
    }

    fn node(&self, local_node_index: u32) -> usize {
        let nodes = nodes_per_page(self.page.page_size());
        assert!(
            (local_node_index as usize) < nodes,
            "directory node {local_node_index} out of range for page holding {nodes} nodes"
        );
        ITEMS_OFFSET + local_node_index as usize * NODE_SIZE
    }

    fn pointer_at(&self, local_node_index: u32, index: usize) -> usize {
        assert!(
            index < LEVEL_SIZE,
            "directory pointer {index} out of range 0..{LEVEL_SIZE}"
        );
        self.node(local_node_index) + pointer_offset(index)
    }

    /// Max left child depth of a node.
    pub fn max_left_child_depth(&self, local_node_index: u32) -> u8 {
        self.page
            .get_u8(self.node(local_node_index) + MAX_LEFT_CHILD_DEPTH)
    }

    /// Max right child depth of a node.
    pub fn max_right_child_depth(&self, local_node_index: u32) -> u8 {
        self.page
            .get_u8(self.node(local_node_index) + MAX_RIGHT_CHILD_DEPTH)
    }

    /// Local depth of a node.
    pub fn node_local_depth(&self, local_node_index: u32) -> u8 {
        self.page.get_u8(self.node(local_node_index) + NODE_LOCAL_DEPTH)
    }

    /// Pointer `index` of a node.
    pub fn pointer(&self, local_node_index: u32, index: usize) -> i64 {
        self.page.get_i64(self.pointer_at(local_node_index, index))
    }
}

impl DirectoryPage<PageMut<'_>> {
    /// Sets the max left child depth of a node.
    pub fn set_max_left_child_depth(&mut self, local_node_index: u32, depth: u8) {
        let at = self.node(local_node_index) + MAX_LEFT_CHILD_DEPTH;
        let old = self.page.get_u8(at);
        self.page.set_u8(at, depth);
        self.page
            .log(PageOperationBody::DirectorySetMaxLeftChildDepth {
                local_node_index,
                old,
                new: depth,
            });
    }

    /// Sets the max right child depth of a node.
    pub fn set_max_right_child_depth(&mut self, local_node_index: u32, depth: u8) {
        let at = self.node(local_node_index) + MAX_RIGHT_CHILD_DEPTH;
        let old = self.page.get_u8(at);
        self.page.set_u8(at, depth);
        self.page
            .log(PageOperationBody::DirectorySetMaxRightChildDepth {
                local_node_index,
                old,
                new: depth,
            });
    }

    /// Sets the local depth of a node.
    pub fn set_node_local_depth(&mut self, local_node_index: u32, depth: u8) {
        let at = self.node(local_node_index) + NODE_LOCAL_DEPTH;
        let old = self.page.get_u8(at);
        self.page.set_u8(at, depth);
        self.page.log(PageOperationBody::DirectorySetNodeLocalDepth {
            local_node_index,
            old,
            new: depth,
        });
    }

    /// Sets pointer `index` of a node.
    pub fn set_pointer(&mut self, local_node_index: u32, index: usize, pointer: i64) {
        let at = self.pointer_at(local_node_index, index);
        let old = self.page.get_i64(at);
        self.page.set_i64(at, pointer);
        self.page.log(PageOperationBody::DirectorySetPointer {
            local_node_index,
            index: index as u32,
            old,
            new: pointer,
        });
    }
}
