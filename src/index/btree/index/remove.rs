use log::trace;

use crate::common::types::{PageId, PageWriteGuard, INVALID_PAGE_ID};
use crate::index::btree::codec::{IndexKey, Storable};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{
    decode_node, encode_internal, encode_leaf, InternalNode, LeafNode, TreeNode,
};
use super::base::{BPlusTree, CrabStack};

impl<K: IndexKey, V: Storable> BPlusTree<K, V> {
    /// Remove the entry for the key. Missing keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let Some((root_id, root_guard)) = self.root_write_guard()? else {
            return Ok(());
        };

        let mut stack: CrabStack<K> = Vec::new();
        let mut cur_id = root_id;
        let mut cur_guard = root_guard;
        let mut leaf = loop {
            match decode_node::<K, V>(&cur_guard)? {
                TreeNode::Leaf(leaf) => break leaf,
                TreeNode::Internal(inner) => {
                    // A node that stays above its minimum after losing one
                    // child shields everything above it. The root is safe as
                    // long as it keeps at least two children.
                    let safe = if stack.is_empty() {
                        inner.size() > 2
                    } else {
                        inner.size() > inner.min_size()
                    };
                    if safe {
                        self.release_stack(&mut stack)?;
                    }
                    let child_id = inner.child_lookup(key);
                    let child_page = self.buffer_pool.fetch_page(child_id)?;
                    let child_guard = child_page.write_arc();
                    stack.push((cur_id, cur_guard, inner));
                    cur_id = child_id;
                    cur_guard = child_guard;
                }
            }
        };

        if !leaf.remove(key) {
            self.release_stack(&mut stack)?;
            drop(cur_guard);
            self.buffer_pool.unpin_page(cur_id, false)?;
            return Ok(());
        }

        if stack.is_empty() {
            // The leaf is the root
            if leaf.entries.is_empty() {
                self.set_root(INVALID_PAGE_ID)?;
                drop(cur_guard);
                self.buffer_pool.unpin_page(cur_id, false)?;
                self.discard_page(cur_id)?;
                trace!("tree emptied; root {} dropped", cur_id);
                return Ok(());
            }
            encode_leaf(&leaf, &mut *cur_guard);
            drop(cur_guard);
            self.buffer_pool.unpin_page(cur_id, true)?;
            return Ok(());
        }

        if leaf.entries.len() >= leaf.min_size() {
            encode_leaf(&leaf, &mut *cur_guard);
            self.release_stack(&mut stack)?;
            drop(cur_guard);
            self.buffer_pool.unpin_page(cur_id, true)?;
            return Ok(());
        }

        self.rebalance_leaf(leaf, cur_id, cur_guard, &mut stack)
    }

    /// Fix an underflowing leaf: borrow from a sibling when it has spare
    /// entries, otherwise merge. Redistribution looks at the left sibling
    /// when one exists, else at the right; merges prefer moving into the
    /// left sibling.
    fn rebalance_leaf(
        &self,
        mut leaf: LeafNode<K, V>,
        leaf_id: PageId,
        mut leaf_guard: PageWriteGuard,
        stack: &mut CrabStack<K>,
    ) -> Result<(), BTreeError> {
        let (parent_id, mut parent_guard, mut parent) =
            stack.pop().expect("non-root leaf has a latched parent");
        let idx = parent
            .child_index_of(leaf_id)
            .ok_or(BTreeError::InvalidPageFormat)?;

        if idx > 0 {
            let sibling_id = parent.children[idx - 1];
            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let TreeNode::Leaf(mut sibling) = decode_node::<K, V>(&sibling_guard)? else {
                return Err(BTreeError::InvalidPageFormat);
            };

            if sibling.entries.len() > sibling.min_size() {
                // borrow the left sibling's last entry
                let moved = sibling.entries.pop().expect("left sibling has entries");
                leaf.entries.insert(0, moved);
                parent.set_key_at(idx, leaf.entries[0].0);
                encode_leaf(&sibling, &mut *sibling_guard);
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                encode_leaf(&leaf, &mut *leaf_guard);
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                encode_internal(&parent, &mut *parent_guard);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                return self.release_stack(stack);
            }

            // merge this leaf into its left sibling
            trace!("merging leaf {} into {}", leaf_id, sibling_id);
            sibling.entries.append(&mut leaf.entries);
            sibling.next_page_id = leaf.next_page_id;
            parent.remove_at(idx);
            encode_leaf(&sibling, &mut *sibling_guard);
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            self.discard_page(leaf_id)?;
            self.rebalance_internal(parent, parent_id, parent_guard, stack)
        } else {
            let sibling_id = parent.children[idx + 1];
            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let TreeNode::Leaf(mut sibling) = decode_node::<K, V>(&sibling_guard)? else {
                return Err(BTreeError::InvalidPageFormat);
            };

            if sibling.entries.len() > sibling.min_size() {
                // borrow the right sibling's first entry
                leaf.entries.push(sibling.entries.remove(0));
                parent.set_key_at(idx + 1, sibling.entries[0].0);
                encode_leaf(&sibling, &mut *sibling_guard);
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                encode_leaf(&leaf, &mut *leaf_guard);
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                encode_internal(&parent, &mut *parent_guard);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                return self.release_stack(stack);
            }

            // merge the right sibling into this leaf
            trace!("merging leaf {} into {}", sibling_id, leaf_id);
            leaf.entries.append(&mut sibling.entries);
            leaf.next_page_id = sibling.next_page_id;
            parent.remove_at(idx + 1);
            encode_leaf(&leaf, &mut *leaf_guard);
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, false)?;
            self.discard_page(sibling_id)?;
            self.rebalance_internal(parent, parent_id, parent_guard, stack)
        }
    }

    /// Fix an internal node that just lost a child. Mirrors the leaf logic,
    /// except entries rotate through the parent's separator key and the root
    /// collapses into its only child when it reaches size one.
    fn rebalance_internal(
        &self,
        mut node: InternalNode<K>,
        node_id: PageId,
        mut node_guard: PageWriteGuard,
        stack: &mut CrabStack<K>,
    ) -> Result<(), BTreeError> {
        if stack.is_empty() {
            // node is the root
            if node.size() == 1 {
                let only_child = node.children[0];
                self.set_parent(only_child, INVALID_PAGE_ID)?;
                self.set_root(only_child)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, false)?;
                self.discard_page(node_id)?;
                trace!("root {} collapsed into {}", node_id, only_child);
                return Ok(());
            }
            encode_internal(&node, &mut *node_guard);
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            return Ok(());
        }

        if node.size() >= node.min_size() {
            encode_internal(&node, &mut *node_guard);
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            return self.release_stack(stack);
        }

        let (parent_id, mut parent_guard, mut parent) =
            stack.pop().expect("non-root internal node has a latched parent");
        let idx = parent
            .child_index_of(node_id)
            .ok_or(BTreeError::InvalidPageFormat)?;

        if idx > 0 {
            let sibling_id = parent.children[idx - 1];
            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let TreeNode::Internal(mut sibling) = decode_node::<K, V>(&sibling_guard)? else {
                return Err(BTreeError::InvalidPageFormat);
            };

            if sibling.size() > sibling.min_size() {
                // rotate the left sibling's last child through the parent
                let moved_child = sibling.children.pop().expect("sibling has children");
                let moved_key = sibling.keys.pop().expect("sibling has keys");
                node.children.insert(0, moved_child);
                node.keys.insert(0, K::default());
                node.keys[1] = parent.key_at(idx);
                parent.set_key_at(idx, moved_key);
                self.set_parent(moved_child, node_id)?;
                encode_internal(&sibling, &mut *sibling_guard);
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                encode_internal(&node, &mut *node_guard);
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                encode_internal(&parent, &mut *parent_guard);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                return self.release_stack(stack);
            }

            // merge node into the left sibling; the separator comes down to
            // key the first moved child
            trace!("merging internal {} into {}", node_id, sibling_id);
            sibling.keys.push(parent.key_at(idx));
            sibling.keys.extend(node.keys[1..].iter().copied());
            for &child in &node.children {
                self.set_parent(child, sibling_id)?;
            }
            sibling.children.append(&mut node.children);
            parent.remove_at(idx);
            encode_internal(&sibling, &mut *sibling_guard);
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, false)?;
            self.discard_page(node_id)?;
            self.rebalance_internal(parent, parent_id, parent_guard, stack)
        } else {
            let sibling_id = parent.children[idx + 1];
            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let TreeNode::Internal(mut sibling) = decode_node::<K, V>(&sibling_guard)? else {
                return Err(BTreeError::InvalidPageFormat);
            };

            if sibling.size() > sibling.min_size() {
                // rotate the right sibling's first child through the parent
                let moved_child = sibling.children.remove(0);
                sibling.keys.remove(0);
                node.children.push(moved_child);
                node.keys.push(parent.key_at(idx + 1));
                parent.set_key_at(idx + 1, sibling.key_at(0));
                self.set_parent(moved_child, node_id)?;
                encode_internal(&sibling, &mut *sibling_guard);
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                encode_internal(&node, &mut *node_guard);
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                encode_internal(&parent, &mut *parent_guard);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                return self.release_stack(stack);
            }

            // merge the right sibling into node
            trace!("merging internal {} into {}", sibling_id, node_id);
            node.keys.push(parent.key_at(idx + 1));
            node.keys.extend(sibling.keys[1..].iter().copied());
            for &child in &sibling.children {
                self.set_parent(child, node_id)?;
            }
            node.children.append(&mut sibling.children);
            parent.remove_at(idx + 1);
            encode_internal(&node, &mut *node_guard);
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, false)?;
            self.discard_page(sibling_id)?;
            self.rebalance_internal(parent, parent_id, parent_guard, stack)
        }
    }
}
