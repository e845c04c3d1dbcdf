//! Forward iterator over leaf entries.

use std::marker::PhantomData;
use tracing::warn;

use stratum_buffer::{BasicGuard, BufferPoolManager};
use stratum_common::key::{IndexKey, SlotValue};
use stratum_common::page::PageId;
use stratum_common::Result;

use super::page::LeafPage;

/// Forward iterator over the leaf chain in ascending key order.
///
/// The iterator pins the current leaf (no latch), so the entry it points at
/// stays resident. Concurrent structural mutation of the tree while an
/// iterator is seated is undefined; iterate inside a serialized section or
/// over the single-threaded variant.
pub struct IndexIterator<'a, K, V> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    index: usize,
    guard: Option<BasicGuard<'a>>,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: IndexKey, V: SlotValue> IndexIterator<'a, K, V> {
    /// Creates an iterator seated at `(page_id, index)`.
    pub(crate) fn new(
        pool: &'a BufferPoolManager,
        page_id: PageId,
        index: usize,
    ) -> Result<Self> {
        let guard = if page_id.is_valid() {
            Some(pool.fetch_basic(page_id)?)
        } else {
            None
        };
        Ok(Self {
            pool,
            page_id,
            index,
            guard,
            _marker: PhantomData,
        })
    }

    /// The sentinel iterator.
    pub(crate) fn end(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            page_id: PageId::INVALID,
            index: 0,
            guard: None,
            _marker: PhantomData,
        }
    }

    /// True when the iterator has run off the last leaf.
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// The entry under the iterator. Panics at end.
    pub fn entry(&self) -> (K, V) {
        let guard = match &self.guard {
            Some(guard) => guard,
            None => panic!("dereferenced an end iterator"),
        };
        let data = guard.data();
        LeafPage::<K, V>::new(&data[..]).entry_at(self.index)
    }

    /// The key under the iterator. Panics at end.
    pub fn key(&self) -> K {
        self.entry().0
    }

    /// The value under the iterator. Panics at end.
    pub fn value(&self) -> V {
        self.entry().1
    }

    /// Steps to the next entry, hopping the leaf chain at page boundaries.
    /// Advancing an end iterator is a no-op.
    pub fn advance(&mut self) -> Result<()> {
        let Some(guard) = &self.guard else {
            return Ok(());
        };

        let (size, next_leaf) = {
            let data = guard.data();
            let leaf = LeafPage::<K, V>::new(&data[..]);
            (leaf.size(), leaf.next_leaf_id())
        };

        self.index += 1;
        if self.index >= size {
            self.index = 0;
            if next_leaf.is_valid() {
                self.guard = Some(self.pool.fetch_basic(next_leaf)?);
                self.page_id = next_leaf;
            } else {
                self.guard = None;
                self.page_id = PageId::INVALID;
            }
        }
        Ok(())
    }
}

impl<K, V> PartialEq for IndexIterator<'_, K, V> {
    /// Two end iterators are equal no matter which pool they came from.
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && (self.index == other.index || !self.page_id.is_valid())
    }
}

impl<K: IndexKey, V: SlotValue> Iterator for IndexIterator<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.is_end() {
            return None;
        }
        let entry = self.entry();
        if let Err(e) = self.advance() {
            warn!(error = %e, "iterator advance failed, ending scan");
            self.guard = None;
            self.page_id = PageId::INVALID;
            self.index = 0;
        }
        Some(entry)
    }
}
