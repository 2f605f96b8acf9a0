use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LRUKReplacer;
use crate::storage::disk::DiskManager;

/// Buffer pool manager: owns a fixed set of frames, maps page ids to frames,
/// and enforces the pinning discipline. Every page handed out carries one pin
/// on behalf of the caller until it calls [`unpin_page`].
///
/// One pool latch covers the page table, the free list, the frame metadata,
/// the replacer and the page-id counter; page contents additionally require
/// the per-page latch.
///
/// [`unpin_page`]: BufferPoolManager::unpin_page
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    inner: Mutex<PoolInner>,
    disk: Arc<dyn DiskManager>,
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    frame_meta: Vec<FrameMeta>,
    replacer: LRUKReplacer,
    next_page_id: PageId,
}

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn free() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

impl BufferPoolManager {
    /// Create a pool of `pool_size` frames over the given disk provider,
    /// replacing pages under an LRU-K policy with the given K.
    ///
    /// Page ids are allocated from a monotonically increasing counter and are
    /// never reused; page 0 is reserved for the index header page and is only
    /// ever reached through [`fetch_page`](BufferPoolManager::fetch_page).
    pub fn new(pool_size: usize, disk: Arc<dyn DiskManager>, replacer_k: usize) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                frame_meta: vec![FrameMeta::free(); pool_size],
                replacer: LRUKReplacer::new(pool_size, replacer_k),
                next_page_id: 1,
            }),
            disk,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id, install it in a frame, and return it pinned
    /// and zeroed
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = self.available_frame(&mut inner)?;

        let page_id = inner.next_page_id;
        inner.next_page_id += 1;

        {
            let mut page = self.frames[frame_id].write();
            page.data.fill(0);
            page.page_id = page_id;
        }
        inner.frame_meta[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false);

        Ok((self.frames[frame_id].clone(), page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident. The returned
    /// page is pinned on behalf of the caller.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID || page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.frame_meta[frame_id].pin_count += 1;
            inner.replacer.record_access(frame_id)?;
            inner.replacer.set_evictable(frame_id, false);
            return Ok(self.frames[frame_id].clone());
        }

        let frame_id = self.available_frame(&mut inner)?;
        {
            let mut page = self.frames[frame_id].write();
            self.disk.read_page(page_id, &mut page.data)?;
            page.page_id = page_id;
        }
        inner.frame_meta[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false);

        Ok(self.frames[frame_id].clone())
    }

    /// Drop one pin on the page, folding `is_dirty` into its dirty flag. When
    /// the pin count reaches zero the frame becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut inner.frame_meta[frame_id];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            inner.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write the page back to disk if dirty and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        if inner.frame_meta[frame_id].is_dirty {
            let page = self.frames[frame_id].read();
            self.disk.write_page(page_id, &page.data)?;
            inner.frame_meta[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let resident: Vec<(PageId, FrameId)> =
            inner.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in resident {
            if inner.frame_meta[frame_id].is_dirty {
                let page = self.frames[frame_id].read();
                self.disk.write_page(page_id, &page.data)?;
                drop(page);
                inner.frame_meta[frame_id].is_dirty = false;
            }
        }
        Ok(())
    }

    /// Drop the page from the pool and return its frame to the free list.
    /// Deleting a page that is not resident is a no-op; deleting a pinned
    /// page is an error.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(());
        };

        if inner.frame_meta[frame_id].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        inner.page_table.remove(&page_id);
        inner.replacer.remove(frame_id)?;
        inner.frame_meta[frame_id] = FrameMeta::free();
        self.frames[frame_id].write().reset();
        inner.free_list.push_back(frame_id);
        Ok(())
    }

    /// Find a usable frame: pop the free list, or evict a victim (writing it
    /// back first when dirty)
    fn available_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let victim = inner.replacer.evict().ok_or(BufferPoolError::OutOfMemory)?;
        let meta = inner.frame_meta[victim];
        debug!(
            "evicting page {} from frame {} (dirty: {})",
            meta.page_id, victim, meta.is_dirty
        );
        if meta.is_dirty {
            let page = self.frames[victim].read();
            self.disk.write_page(meta.page_id, &page.data)?;
        }
        inner.page_table.remove(&meta.page_id);
        inner.frame_meta[victim] = FrameMeta::free();
        self.frames[victim].write().reset();
        Ok(victim)
    }
}
