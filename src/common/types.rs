use std::sync::Arc;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type; pages are addressed by signed ids so that INVALID can be -1
pub type PageId = i32;

/// Marker for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// Page 0 is reserved for the index header page
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type (zero-based slot index)
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = i32;

/// Marker for "no transaction"
pub const INVALID_TXN_ID: TxnId = -1;

/// Table object ID type
pub type TableOid = u32;

/// Record ID: identifies a row by the page holding it and its slot on that page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

/// Page structure: a fixed-size buffer plus the id of the page it holds.
///
/// Pin count and dirty flag live in the buffer pool's frame metadata, under
/// the pool latch; the `RwLock` wrapping a `Page` is the per-page latch.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the buffer and forget the held page
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a latched page
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned read latch on a page (keeps the page alive while held)
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned write latch on a page (keeps the page alive while held)
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
