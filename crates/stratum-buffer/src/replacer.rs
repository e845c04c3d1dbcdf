//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use stratum_common::{Result, StratumError};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    ///
    /// Fails with `ReplacerOverflow` only if a frame not yet tracked would
    /// push the replacer past its capacity.
    fn record_access(&self, frame_id: FrameId) -> Result<()>;

    /// Marks a frame as evictable (unpinned) or not. No-op for frames the
    /// replacer is not tracking.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction and stops tracking it.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Stops tracking a frame unconditionally.
    ///
    /// Fails if the frame is tracked but not evictable.
    fn remove(&self, frame_id: FrameId) -> Result<()>;

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU-K replacement policy.
///
/// A frame with fewer than `k` recorded accesses lives in the history
/// class, ordered by its first access time; once it reaches `k` accesses it
/// moves to the cache class, ordered by the timestamp of its k-th most
/// recent access. Eviction drains the history class before the cache class,
/// oldest ordering key first, skipping non-evictable frames. Given the same
/// access sequence the victim choice is deterministic.
pub struct LruKReplacer {
    /// Maximum number of tracked frames.
    capacity: usize,
    /// The K in LRU-K.
    k: usize,
    /// Internal state protected by a single mutex.
    inner: Mutex<LruKInner>,
}

struct LruKInner {
    /// Monotonic logical clock; two accesses never share a timestamp.
    timestamp: u64,
    /// Per-frame bookkeeping.
    nodes: HashMap<FrameId, LruKNode>,
    /// Frames with fewer than k accesses, keyed by first access time.
    history_queue: BTreeSet<(u64, FrameId)>,
    /// Frames with at least k accesses, keyed by k-th most recent access.
    cache_queue: BTreeSet<(u64, FrameId)>,
    /// Number of evictable tracked frames.
    evictable_count: usize,
}

struct LruKNode {
    /// The k most recent access timestamps, oldest first.
    history: VecDeque<u64>,
    /// Total number of recorded accesses.
    count: u64,
    /// Whether the frame may be evicted.
    evictable: bool,
    /// Timestamp this node is currently ordered by in its queue.
    order_key: u64,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer tracking up to `capacity` frames.
    pub fn new(capacity: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            capacity,
            k,
            inner: Mutex::new(LruKInner {
                timestamp: 0,
                nodes: HashMap::new(),
                history_queue: BTreeSet::new(),
                cache_queue: BTreeSet::new(),
                evictable_count: 0,
            }),
        }
    }

    /// Returns the configured capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the configured k.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.timestamp += 1;
        let ts = inner.timestamp;

        if !inner.nodes.contains_key(&frame_id) {
            if inner.nodes.len() >= self.capacity {
                return Err(StratumError::ReplacerOverflow {
                    capacity: self.capacity,
                });
            }
            inner.nodes.insert(
                frame_id,
                LruKNode {
                    history: VecDeque::from([ts]),
                    count: 1,
                    evictable: false,
                    order_key: ts,
                },
            );
            inner.history_queue.insert((ts, frame_id));
            return Ok(());
        }

        let k = self.k as u64;
        let node = inner.nodes.get_mut(&frame_id).unwrap();
        node.count += 1;
        node.history.push_back(ts);
        let count = node.count;
        let old_key = node.order_key;

        if count == k {
            // Graduates from the history class into the cache class.
            let new_key = *node.history.front().unwrap();
            node.order_key = new_key;
            inner.history_queue.remove(&(old_key, frame_id));
            inner.cache_queue.insert((new_key, frame_id));
        } else if count > k {
            // Slide the k-window forward and re-sort within the cache class.
            node.history.pop_front();
            let new_key = *node.history.front().unwrap();
            node.order_key = new_key;
            inner.cache_queue.remove(&(old_key, frame_id));
            inner.cache_queue.insert((new_key, frame_id));
        }
        // count < k: stays in the history class at its first-access position.

        Ok(())
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&frame_id) else {
            return;
        };
        let was = node.evictable;
        node.evictable = evictable;
        if !was && evictable {
            inner.evictable_count += 1;
        } else if was && !evictable {
            inner.evictable_count -= 1;
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable_count == 0 {
            return None;
        }

        let victim = inner
            .history_queue
            .iter()
            .find(|(_, fid)| inner.nodes[fid].evictable)
            .copied()
            .or_else(|| {
                inner
                    .cache_queue
                    .iter()
                    .find(|(_, fid)| inner.nodes[fid].evictable)
                    .copied()
            });

        let (key, frame_id) = victim?;
        let node = inner.nodes.remove(&frame_id).unwrap();
        if node.count < self.k as u64 {
            inner.history_queue.remove(&(key, frame_id));
        } else {
            inner.cache_queue.remove(&(key, frame_id));
        }
        inner.evictable_count -= 1;
        Some(frame_id)
    }

    fn remove(&self, frame_id: FrameId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get(&frame_id) else {
            return Ok(());
        };
        if !node.evictable {
            return Err(StratumError::FrameNotEvictable {
                frame_id: frame_id.0,
            });
        }
        let node = inner.nodes.remove(&frame_id).unwrap();
        if node.count < self.k as u64 {
            inner.history_queue.remove(&(node.order_key, frame_id));
        } else {
            inner.cache_queue.remove(&(node.order_key, frame_id));
        }
        inner.evictable_count -= 1;
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_evictable(replacer: &LruKReplacer, ids: &[u32]) {
        for &id in ids {
            replacer.set_evictable(FrameId(id), true);
        }
    }

    #[test]
    fn test_lru_k_new() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.k(), 2);
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_single_frame() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(5)).unwrap();
        assert_eq!(replacer.size(), 0); // not yet evictable

        replacer.set_evictable(FrameId(5), true);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(FrameId(5)));
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_history_before_cache() {
        let replacer = LruKReplacer::new(10, 2);

        // Frame 1 reaches k accesses (cache class), frame 2 stays in history.
        replacer.record_access(FrameId(1)).unwrap();
        replacer.record_access(FrameId(1)).unwrap();
        replacer.record_access(FrameId(2)).unwrap();
        make_evictable(&replacer, &[1, 2]);

        // History class (frame 2) is evicted first even though frame 1 is
        // colder by raw recency.
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_k_history_first_access_order() {
        let replacer = LruKReplacer::new(10, 3);

        replacer.record_access(FrameId(1)).unwrap(); // t1
        replacer.record_access(FrameId(2)).unwrap(); // t2
        replacer.record_access(FrameId(1)).unwrap(); // t3: still < k accesses
        make_evictable(&replacer, &[1, 2]);

        // Frame 1 was seen first; a second access does not reorder the
        // history class.
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_cache_kth_recency_order() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(1)).unwrap(); // t1
        replacer.record_access(FrameId(1)).unwrap(); // t2 -> key t1
        replacer.record_access(FrameId(2)).unwrap(); // t3
        replacer.record_access(FrameId(2)).unwrap(); // t4 -> key t3
        make_evictable(&replacer, &[1, 2]);

        // Frame 1's 2nd-most-recent access (t1) is older than frame 2's (t3).
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_reaccess_reorders_cache() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(1)).unwrap(); // t1
        replacer.record_access(FrameId(1)).unwrap(); // t2 -> key t1
        replacer.record_access(FrameId(2)).unwrap(); // t3
        replacer.record_access(FrameId(2)).unwrap(); // t4 -> key t3
        replacer.record_access(FrameId(1)).unwrap(); // t5 -> key slides to t2

        make_evictable(&replacer, &[1, 2]);

        // Frame 1's window slid forward: key t2 < t3 still, so frame 1 goes
        // first; another access flips the order.
        assert_eq!(replacer.evict(), Some(FrameId(1)));

        replacer.record_access(FrameId(2)).unwrap(); // key slides to t4
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_skips_non_evictable() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(1)).unwrap();
        replacer.record_access(FrameId(2)).unwrap();
        replacer.set_evictable(FrameId(2), true);

        // Frame 1 is older but pinned.
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_set_evictable_untracked_is_noop() {
        let replacer = LruKReplacer::new(10, 2);
        replacer.set_evictable(FrameId(99), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_set_evictable_idempotent() {
        let replacer = LruKReplacer::new(10, 2);
        replacer.record_access(FrameId(1)).unwrap();

        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId(1), false);
        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_remove() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(1)).unwrap();
        replacer.record_access(FrameId(2)).unwrap();
        make_evictable(&replacer, &[1, 2]);

        replacer.remove(FrameId(1)).unwrap();
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_k_remove_untracked_is_noop() {
        let replacer = LruKReplacer::new(10, 2);
        assert!(replacer.remove(FrameId(42)).is_ok());
    }

    #[test]
    fn test_lru_k_remove_pinned_fails() {
        let replacer = LruKReplacer::new(10, 2);
        replacer.record_access(FrameId(1)).unwrap();

        let err = replacer.remove(FrameId(1)).unwrap_err();
        assert!(matches!(err, StratumError::FrameNotEvictable { frame_id: 1 }));
    }

    #[test]
    fn test_lru_k_overflow_rejected() {
        let replacer = LruKReplacer::new(2, 2);

        replacer.record_access(FrameId(1)).unwrap();
        replacer.record_access(FrameId(2)).unwrap();

        let err = replacer.record_access(FrameId(3)).unwrap_err();
        assert!(matches!(err, StratumError::ReplacerOverflow { capacity: 2 }));

        // Re-accessing tracked frames is still fine at capacity.
        replacer.record_access(FrameId(1)).unwrap();
    }

    #[test]
    fn test_lru_k_evict_frees_capacity() {
        let replacer = LruKReplacer::new(1, 2);

        replacer.record_access(FrameId(1)).unwrap();
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.evict(), Some(FrameId(1)));

        // The slot is free again.
        replacer.record_access(FrameId(2)).unwrap();
    }

    #[test]
    fn test_lru_k_classic_sequence() {
        // The canonical scenario: six frames, k = 2.
        let replacer = LruKReplacer::new(7, 2);

        for id in [1u32, 2, 3, 4, 5, 6] {
            replacer.record_access(FrameId(id)).unwrap();
        }
        replacer.record_access(FrameId(1)).unwrap(); // frame 1 joins the cache class
        make_evictable(&replacer, &[1, 2, 3, 4, 5]);
        // Frame 6 stays pinned.

        assert_eq!(replacer.size(), 5);

        // History class drains in first-access order, then the cache class.
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(3)));
        assert_eq!(replacer.evict(), Some(FrameId(4)));
        assert_eq!(replacer.evict(), Some(FrameId(5)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict().is_none());
    }
}
