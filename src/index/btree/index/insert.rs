use log::trace;

use crate::common::types::{PageId, PageWriteGuard, INVALID_PAGE_ID};
use crate::index::btree::codec::{IndexKey, Storable};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{
    decode_node, encode_internal, encode_leaf, InternalNode, LeafNode, TreeNode,
};
use super::base::{BPlusTree, CrabStack};

impl<K: IndexKey, V: Storable> BPlusTree<K, V> {
    /// Insert a key/value pair. Returns false when the key is already
    /// present (existing values are never overwritten).
    pub fn insert(&self, key: K, value: V) -> Result<bool, BTreeError> {
        loop {
            {
                let mut root_id = self.root_page_id.write();
                if *root_id == INVALID_PAGE_ID {
                    // start a new tree: a single leaf root
                    let (page, page_id) = self.buffer_pool.new_page()?;
                    let mut leaf = LeafNode::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
                    leaf.entries.push((key, value));
                    encode_leaf(&leaf, &mut *page.write());
                    *root_id = page_id;
                    drop(root_id);
                    self.sync_root_record(page_id)?;
                    self.buffer_pool.unpin_page(page_id, true)?;
                    return Ok(true);
                }
            }
            // Non-empty tree; the tree may still empty out under us before
            // the root latch lands, in which case the descent restarts.
            let Some((root_id, root_guard)) = self.root_write_guard()? else {
                continue;
            };
            return self.insert_descent(root_id, root_guard, key, value);
        }
    }

    /// Crab down to the target leaf holding write latches, releasing
    /// ancestors as soon as the current node cannot split, then insert
    fn insert_descent(
        &self,
        root_id: PageId,
        root_guard: PageWriteGuard,
        key: K,
        value: V,
    ) -> Result<bool, BTreeError> {
        let mut stack: CrabStack<K> = Vec::new();
        let mut cur_id = root_id;
        let mut cur_guard = root_guard;
        let mut leaf = loop {
            match decode_node::<K, V>(&cur_guard)? {
                TreeNode::Leaf(leaf) => break leaf,
                TreeNode::Internal(inner) => {
                    // An internal node with room for one more child absorbs
                    // any split from below; everything above it is safe.
                    if inner.size() < self.internal_max_size {
                        self.release_stack(&mut stack)?;
                    }
                    let child_id = inner.child_lookup(&key);
                    let child_page = self.buffer_pool.fetch_page(child_id)?;
                    let child_guard = child_page.write_arc();
                    stack.push((cur_id, cur_guard, inner));
                    cur_id = child_id;
                    cur_guard = child_guard;
                }
            }
        };

        if leaf.lookup(&key).is_some() {
            self.release_stack(&mut stack)?;
            drop(cur_guard);
            self.buffer_pool.unpin_page(cur_id, false)?;
            return Ok(false);
        }

        if leaf.entries.len() < self.leaf_max_size {
            leaf.insert(key, value);
            encode_leaf(&leaf, &mut *cur_guard);
            self.release_stack(&mut stack)?;
            drop(cur_guard);
            self.buffer_pool.unpin_page(cur_id, true)?;
            return Ok(true);
        }

        // Overflowing insert: split the leaf, the upper half moves to a new
        // page that is linked into the leaf chain
        leaf.insert(key, value);
        let (new_page, new_page_id) = self.buffer_pool.new_page()?;
        let mut new_guard = new_page.write_arc();
        let mut new_leaf = LeafNode::new(new_page_id, leaf.parent_page_id, self.leaf_max_size);
        new_leaf.entries = leaf.split_off_upper();
        new_leaf.next_page_id = leaf.next_page_id;
        leaf.next_page_id = new_page_id;
        let separator = new_leaf.entries[0].0;
        trace!("leaf {} split; upper half moved to {}", cur_id, new_page_id);

        let (left_home, right_home) =
            self.insert_into_parent(&mut stack, cur_id, separator, new_page_id)?;
        leaf.parent_page_id = left_home;
        new_leaf.parent_page_id = right_home;
        encode_leaf(&leaf, &mut *cur_guard);
        encode_leaf(&new_leaf, &mut *new_guard);
        drop(new_guard);
        self.buffer_pool.unpin_page(new_page_id, true)?;
        drop(cur_guard);
        self.buffer_pool.unpin_page(cur_id, true)?;
        Ok(true)
    }

    /// Hook a freshly split-off node into the tree: `separator` and
    /// `right_id` go into the parent of `left_id`, splitting upward as
    /// needed. Returns the page ids under which left and right now live; the
    /// caller owns both latches and patches their parent pointers itself.
    fn insert_into_parent(
        &self,
        stack: &mut CrabStack<K>,
        left_id: PageId,
        separator: K,
        right_id: PageId,
    ) -> Result<(PageId, PageId), BTreeError> {
        let Some((parent_id, mut parent_guard, mut parent)) = stack.pop() else {
            // left was the root: grow a new root over the two nodes
            let (root_page, new_root_id) = self.buffer_pool.new_page()?;
            let mut root = InternalNode::new(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.keys = vec![K::default(), separator];
            root.children = vec![left_id, right_id];
            encode_internal(&root, &mut *root_page.write());
            self.buffer_pool.unpin_page(new_root_id, true)?;
            self.set_root(new_root_id)?;
            trace!("root split; new root {}", new_root_id);
            return Ok((new_root_id, new_root_id));
        };

        parent.insert_after(left_id, separator, right_id);
        if parent.size() <= self.internal_max_size {
            encode_internal(&parent, &mut *parent_guard);
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, true)?;
            self.release_stack(stack)?;
            return Ok((parent_id, parent_id));
        }

        // The parent overflowed too: split it and push the median up. The
        // median stays in place as the new node's unused slot-0 key.
        let (new_page, new_internal_id) = self.buffer_pool.new_page()?;
        let mut new_guard = new_page.write_arc();
        let mut new_internal =
            InternalNode::new(new_internal_id, parent.parent_page_id, self.internal_max_size);
        let (upper_keys, upper_children) = parent.split_off_upper();
        new_internal.keys = upper_keys;
        new_internal.children = upper_children;
        let median = new_internal.keys[0];

        let (left_of_split, right_of_split) =
            self.insert_into_parent(stack, parent_id, median, new_internal_id)?;
        parent.parent_page_id = left_of_split;
        new_internal.parent_page_id = right_of_split;

        // Reparent the children that moved. The caller's two nodes are
        // skipped; it still holds their latches and patches them from the
        // homes returned below.
        for &child in &new_internal.children {
            if child == left_id || child == right_id {
                continue;
            }
            self.set_parent(child, new_internal_id)?;
        }
        let left_home = if parent.children.contains(&left_id) {
            parent_id
        } else {
            new_internal_id
        };
        let right_home = if parent.children.contains(&right_id) {
            parent_id
        } else {
            new_internal_id
        };

        encode_internal(&parent, &mut *parent_guard);
        drop(parent_guard);
        self.buffer_pool.unpin_page(parent_id, true)?;
        encode_internal(&new_internal, &mut *new_guard);
        drop(new_guard);
        self.buffer_pool.unpin_page(new_internal_id, true)?;
        Ok((left_home, right_home))
    }
}
