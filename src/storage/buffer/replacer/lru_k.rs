use std::collections::HashMap;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::FrameId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplacerError {
    #[error("Frame id {0} is out of range")]
    InvalidFrame(FrameId),
    #[error("Frame {0} cannot be removed while non-evictable")]
    RemoveNonEvictable(FrameId),
}

/// LRU-K page replacement policy.
///
/// Frames live in one of two recency queues: the history queue holds frames
/// with fewer than K recorded accesses, the buffer queue holds frames with at
/// least K. Victims come from the history queue first (a frame that never
/// reached K accesses has the higher eviction priority), then from the buffer
/// queue by least-recent access. Pinned frames stay in their queue but are
/// skipped until marked evictable again.
pub struct LRUKReplacer {
    inner: Mutex<ReplacerInner>,
}

struct ReplacerInner {
    capacity: usize,
    k: usize,
    current_timestamp: u64,
    evictable_count: usize,
    /// Frames with fewer than K accesses; oldest insertion at the front
    history: LinkedHashMap<FrameId, FrameRecord>,
    /// Frames with at least K accesses; least recently touched at the front
    buffer: LinkedHashMap<FrameId, FrameRecord>,
    /// Evictability flag for every tracked frame
    evictable: HashMap<FrameId, bool>,
}

#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    access_count: usize,
    last_access: u64,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K needs k >= 1");
        Self {
            inner: Mutex::new(ReplacerInner {
                capacity: num_frames,
                k,
                current_timestamp: 0,
                evictable_count: 0,
                history: LinkedHashMap::new(),
                buffer: LinkedHashMap::new(),
                evictable: HashMap::new(),
            }),
        }
    }

    /// Register an access to the frame, promoting it from the history queue
    /// to the buffer queue once it reaches K accesses. A frame seen for the
    /// first time enters the history queue as evictable.
    pub fn record_access(&self, frame_id: FrameId) -> Result<(), ReplacerError> {
        let mut inner = self.inner.lock();
        if frame_id >= inner.capacity {
            return Err(ReplacerError::InvalidFrame(frame_id));
        }

        inner.current_timestamp += 1;
        let now = inner.current_timestamp;
        let k = inner.k;

        if let Some(record) = inner.buffer.get_refresh(&frame_id) {
            record.access_count += 1;
            record.last_access = now;
            return Ok(());
        }

        if let Some(record) = inner.history.get_mut(&frame_id) {
            record.access_count += 1;
            record.last_access = now;
            if record.access_count >= k {
                let promoted = *record;
                inner.history.remove(&frame_id);
                inner.buffer.insert(frame_id, promoted);
            }
            return Ok(());
        }

        inner.history.insert(
            frame_id,
            FrameRecord {
                access_count: 1,
                last_access: now,
            },
        );
        inner.evictable.insert(frame_id, true);
        inner.evictable_count += 1;
        Ok(())
    }

    /// Move the frame into or out of the evictable set. Untracked frames are
    /// silently ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        let Some(flag) = inner.evictable.get(&frame_id).copied() else {
            return;
        };
        if evictable && !flag {
            inner.evictable_count += 1;
        } else if !evictable && flag {
            inner.evictable_count -= 1;
        }
        inner.evictable.insert(frame_id, evictable);
    }

    /// Pick a victim frame and forget it, or `None` if nothing is evictable.
    /// History frames are considered before buffer frames; within each queue
    /// the least recently used evictable frame wins.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        let pick = |queue: &LinkedHashMap<FrameId, FrameRecord>,
                    evictable: &HashMap<FrameId, bool>| {
            queue
                .keys()
                .find(|frame_id| evictable.get(frame_id).copied().unwrap_or(false))
                .copied()
        };

        if let Some(victim) = pick(&inner.history, &inner.evictable) {
            inner.history.remove(&victim);
            inner.evictable.remove(&victim);
            inner.evictable_count -= 1;
            return Some(victim);
        }
        if let Some(victim) = pick(&inner.buffer, &inner.evictable) {
            inner.buffer.remove(&victim);
            inner.evictable.remove(&victim);
            inner.evictable_count -= 1;
            return Some(victim);
        }
        None
    }

    /// Forget a specific frame. A no-op for untracked frames; removing a
    /// non-evictable frame is a caller error.
    pub fn remove(&self, frame_id: FrameId) -> Result<(), ReplacerError> {
        let mut inner = self.inner.lock();
        if frame_id >= inner.capacity {
            return Err(ReplacerError::InvalidFrame(frame_id));
        }
        let Some(flag) = inner.evictable.get(&frame_id).copied() else {
            return Ok(());
        };
        if !flag {
            return Err(ReplacerError::RemoveNonEvictable(frame_id));
        }
        inner.history.remove(&frame_id);
        inner.buffer.remove(&frame_id);
        inner.evictable.remove(&frame_id);
        inner.evictable_count -= 1;
        Ok(())
    }

    /// Number of frames currently eligible for eviction
    pub fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}
