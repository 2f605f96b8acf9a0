use std::marker::PhantomData;
use std::sync::Arc;

use crate::common::types::{PageId, PagePtr, INVALID_PAGE_ID};
use crate::index::btree::codec::{IndexKey, Storable};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{decode_node, TreeNode};
use crate::storage::buffer::BufferPoolManager;
use super::base::BPlusTree;

/// Forward iterator over `(key, value)` pairs in ascending key order.
///
/// The iterator keeps a pin on its current leaf; crossing to the next leaf
/// pins it and drops the previous pin. The final pin is released when the
/// iterator runs out of entries or is dropped.
pub struct TreeIterator<K, V> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<(PageId, PagePtr)>,
    index: usize,
    _phantom: PhantomData<(K, V)>,
}

impl<K: IndexKey, V: Storable> BPlusTree<K, V> {
    /// Iterator positioned at the first entry of the tree
    pub fn iter(&self) -> Result<TreeIterator<K, V>, BTreeError> {
        match self.find_leaf_read(None)? {
            Some((page_id, page, guard)) => {
                drop(guard);
                Ok(TreeIterator::at(self.buffer_pool.clone(), page_id, page, 0))
            }
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K, V>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            Some((page_id, page, guard)) => {
                let index = match decode_node::<K, V>(&guard)? {
                    TreeNode::Leaf(leaf) => leaf.lower_bound(key),
                    TreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
                };
                drop(guard);
                Ok(TreeIterator::at(self.buffer_pool.clone(), page_id, page, index))
            }
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
        }
    }
}

impl<K: IndexKey, V: Storable> TreeIterator<K, V> {
    fn at(buffer_pool: Arc<BufferPoolManager>, page_id: PageId, page: PagePtr, index: usize) -> Self {
        Self {
            buffer_pool,
            leaf: Some((page_id, page)),
            index,
            _phantom: PhantomData,
        }
    }

    fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            index: 0,
            _phantom: PhantomData,
        }
    }

    /// True when the iterator is past the final entry of the final leaf
    pub fn is_end(&self) -> bool {
        let Some((_, page)) = &self.leaf else {
            return true;
        };
        let guard = page.read();
        match decode_node::<K, V>(&guard) {
            Ok(TreeNode::Leaf(leaf)) => {
                self.index >= leaf.entries.len() && leaf.next_page_id == INVALID_PAGE_ID
            }
            _ => true,
        }
    }

    /// Yield the entry at the current position and advance, chasing the leaf
    /// chain across page boundaries. `None` past the end.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, BTreeError> {
        loop {
            let Some((page_id, page)) = self.leaf.clone() else {
                return Ok(None);
            };
            let (entry, next_id) = {
                let guard = page.read();
                match decode_node::<K, V>(&guard)? {
                    TreeNode::Leaf(leaf) => {
                        (leaf.entries.get(self.index).copied(), leaf.next_page_id)
                    }
                    TreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
                }
            };

            if let Some(entry) = entry {
                self.index += 1;
                return Ok(Some(entry));
            }
            if next_id == INVALID_PAGE_ID {
                self.release()?;
                return Ok(None);
            }
            // Pin the next leaf before letting go of the current one
            let next_page = self.buffer_pool.fetch_page(next_id)?;
            self.buffer_pool.unpin_page(page_id, false)?;
            self.leaf = Some((next_id, next_page));
            self.index = 0;
        }
    }

    fn release(&mut self) -> Result<(), BTreeError> {
        if let Some((page_id, _)) = self.leaf.take() {
            self.buffer_pool.unpin_page(page_id, false)?;
        }
        Ok(())
    }
}

impl<K: IndexKey, V: Storable> Iterator for TreeIterator<K, V> {
    type Item = Result<(K, V), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<K, V> Drop for TreeIterator<K, V> {
    fn drop(&mut self) {
        if let Some((page_id, _)) = self.leaf.take() {
            let _ = self.buffer_pool.unpin_page(page_id, false);
        }
    }
}
