use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::RwLock;

use crate::common::types::{
    PageId, PagePtr, PageReadGuard, PageWriteGuard, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::index::btree::codec::{IndexKey, Storable};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header;
use crate::index::btree::node::{self, decode_node, InternalNode, TreeNode};
use crate::index::btree::{max_internal_entries, max_leaf_entries};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

/// Ancestor latches retained during a write descent, root-most first. Each
/// entry is a node that could still be changed by a split or merge below it.
pub(crate) type CrabStack<K> = Vec<(PageId, PageWriteGuard, InternalNode<K>)>;

/// B+Tree index over the buffer pool. Node pages reference each other only by
/// page id; every page touched by an operation is pinned for its duration and
/// unpinned (dirty where modified) before returning.
///
/// Keys are unique; the tree's ordering is the key type's `Ord`.
pub struct BPlusTree<K, V> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_page_id: RwLock<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<(K, V)>,
}

impl<K: IndexKey, V: Storable> BPlusTree<K, V> {
    /// Open the named index over the buffer pool, creating its record in the
    /// header page (page 0) on first use. `leaf_max_size` and
    /// `internal_max_size` bound leaf entries and internal children
    /// respectively.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let name = name.into();
        if leaf_max_size < 2 || leaf_max_size > max_leaf_entries::<K, V>() {
            return Err(BTreeError::NodeTooLarge(leaf_max_size));
        }
        if internal_max_size < 3 || internal_max_size > max_internal_entries::<K>() {
            return Err(BTreeError::NodeTooLarge(internal_max_size));
        }

        let header_page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let existing = {
            let guard = header_page.read();
            header::lookup_root(&guard, &name)?
        };
        let root_page_id = match existing {
            Some(root) => {
                buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;
                root
            }
            None => {
                {
                    let mut guard = header_page.write();
                    header::set_root(&mut guard, &name, INVALID_PAGE_ID)?;
                }
                buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
                INVALID_PAGE_ID
            }
        };

        Ok(Self {
            name,
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup
    pub fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let Some((leaf_id, _leaf_page, leaf_guard)) = self.find_leaf_read(Some(key))? else {
            return Ok(None);
        };
        let result = match decode_node::<K, V>(&leaf_guard)? {
            TreeNode::Leaf(leaf) => leaf.lookup(key),
            TreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
        };
        drop(leaf_guard);
        self.buffer_pool.unpin_page(leaf_id, false)?;
        Ok(result)
    }

    /// Descend to a leaf with read-latch coupling: the child latch is taken
    /// before the parent latch is released. `None` key means leftmost leaf.
    /// The caller owns the returned pin and guard.
    pub(crate) fn find_leaf_read(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageId, PagePtr, PageReadGuard)>, BTreeError> {
        loop {
            let root_id = *self.root_page_id.read();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let root_page = self.buffer_pool.fetch_page(root_id)?;
            let root_guard = root_page.read_arc();
            // The root may have moved between reading the id and latching the
            // page; a stale latch is released and the descent restarted.
            if *self.root_page_id.read() != root_id {
                drop(root_guard);
                self.buffer_pool.unpin_page(root_id, false)?;
                continue;
            }

            let mut cur_id = root_id;
            let mut cur_page = root_page;
            let mut cur_guard = root_guard;
            loop {
                let child_id = match decode_node::<K, V>(&cur_guard)? {
                    TreeNode::Leaf(_) => return Ok(Some((cur_id, cur_page, cur_guard))),
                    TreeNode::Internal(inner) => match key {
                        Some(key) => inner.child_lookup(key),
                        None => inner.children[0],
                    },
                };
                let child_page = self.buffer_pool.fetch_page(child_id)?;
                let child_guard = child_page.read_arc();
                drop(cur_guard);
                self.buffer_pool.unpin_page(cur_id, false)?;
                cur_id = child_id;
                cur_page = child_page;
                cur_guard = child_guard;
            }
        }
    }

    /// Write-latch the current root, retrying if the root moved before the
    /// latch was taken. `None` when the tree is empty.
    pub(crate) fn root_write_guard(
        &self,
    ) -> Result<Option<(PageId, PageWriteGuard)>, BTreeError> {
        loop {
            let root_id = *self.root_page_id.read();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let root_page = self.buffer_pool.fetch_page(root_id)?;
            let guard = root_page.write_arc();
            if *self.root_page_id.read() == root_id {
                return Ok(Some((root_id, guard)));
            }
            drop(guard);
            self.buffer_pool.unpin_page(root_id, false)?;
        }
    }

    /// Release retained ancestor latches and pins; none of them were modified
    pub(crate) fn release_stack(&self, stack: &mut CrabStack<K>) -> Result<(), BTreeError> {
        while let Some((page_id, guard, _)) = stack.pop() {
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
        }
        Ok(())
    }

    /// Point the root at a new page and persist the change in the header page
    pub(crate) fn set_root(&self, new_root: PageId) -> Result<(), BTreeError> {
        *self.root_page_id.write() = new_root;
        self.sync_root_record(new_root)
    }

    /// Rewrite this index's record in the header page
    pub(crate) fn sync_root_record(&self, root: PageId) -> Result<(), BTreeError> {
        let header_page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = header_page.write();
            header::set_root(&mut guard, &self.name, root)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Rewrite the parent pointer of an unlatched node page. Safe while the
    /// (old or new) parent's write latch is held: no descent can reach the
    /// child to race with this.
    pub(crate) fn set_parent(&self, child_id: PageId, parent_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = page.write();
            node::write_parent(&mut guard, parent_id);
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }

    /// Drop a page that left the tree. A page still pinned elsewhere (a
    /// paused iterator) stays resident until those pins drain; it is already
    /// unreachable from the tree either way.
    pub(crate) fn discard_page(&self, page_id: PageId) -> Result<(), BTreeError> {
        match self.buffer_pool.delete_page(page_id) {
            Ok(()) | Err(BufferPoolError::PagePinned(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
