//! Single-threaded B+ tree variant.
//!
//! Shares the page layouts and rebalancing logic with the latch-crabbing
//! [`super::BPlusTree`], but all page guards are pin-only and the root page
//! id is cached in memory instead of being re-read from the header page on
//! every operation. The cached root is written back by [`checkpoint`] and
//! on drop.
//!
//! [`checkpoint`]: LocalBPlusTree::checkpoint

use std::cell::Cell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{trace, warn};

use stratum_buffer::{BasicGuard, BufferPoolManager};
use stratum_common::key::{IndexKey, KeyComparator, SlotValue};
use stratum_common::page::{PageId, PageType};
use stratum_common::{Result, StratumError};

use super::iterator::IndexIterator;
use super::page::{
    self, coalesce_internal_left, coalesce_internal_right, coalesce_leaf_left,
    coalesce_leaf_right, replenish_internal_from_left, replenish_internal_from_right,
    replenish_leaf_from_left, replenish_leaf_from_right, shift_internal_into_left,
    shift_internal_into_right, shift_leaf_into_left, shift_leaf_into_right, HeaderPage,
    InternalPage, InternalPageMut, LeafPage, LeafPageMut,
};
use super::BPlusTreeOptions;

/// Single-threaded, latch-free B+ tree over a buffer pool.
///
/// Guards only manage pinning; the type is `!Sync` by construction, so the
/// compiler enforces the single-logical-thread contract. The buffer pool
/// must outlive the tree, which the `Arc` expresses.
pub struct LocalBPlusTree<K, V, C> {
    pool: Arc<BufferPoolManager>,
    comparator: C,
    index_name: String,
    header_page_id: PageId,
    root_page_id: Cell<PageId>,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> LocalBPlusTree<K, V, C>
where
    K: IndexKey,
    V: SlotValue,
    C: KeyComparator<K>,
{
    /// Opens a tree over the given pool and header page.
    ///
    /// The header page must already be allocated (see
    /// [`super::create_header_page`]); a zeroed header page is formatted in
    /// place. Unless `options.inherit_file` is set, the stored root id is
    /// reset and the tree starts empty.
    pub fn new(
        pool: Arc<BufferPoolManager>,
        comparator: C,
        options: BPlusTreeOptions,
    ) -> Result<Self> {
        let leaf_max_size = options
            .leaf_max_size
            .unwrap_or_else(page::default_leaf_max_size::<K, V>);
        let internal_max_size = options
            .internal_max_size
            .unwrap_or_else(page::default_internal_max_size::<K>);
        assert!(
            leaf_max_size >= 2 && (leaf_max_size as usize) < page::leaf_capacity::<K, V>(),
            "leaf max size {} out of range for this key/value encoding",
            leaf_max_size
        );
        assert!(
            internal_max_size >= 3
                && (internal_max_size as usize) < page::internal_capacity::<K>(),
            "internal max size {} out of range for this key encoding",
            internal_max_size
        );

        let header_guard = pool.fetch_basic(options.header_page_id)?;
        let tag = page::page_type(&header_guard.data()[..]);
        let root_page_id = match tag {
            PageType::Invalid => {
                let mut data = header_guard.data_mut();
                HeaderPage::init(&mut data[..]);
                PageId::INVALID
            }
            PageType::Header => {
                if options.inherit_file {
                    HeaderPage::root_page_id(&header_guard.data()[..])
                } else {
                    let mut data = header_guard.data_mut();
                    HeaderPage::set_root_page_id(&mut data[..], PageId::INVALID);
                    PageId::INVALID
                }
            }
            other => {
                return Err(StratumError::Corrupted(format!(
                    "expected header page at {}, found {:?}",
                    options.header_page_id, other
                )))
            }
        };
        drop(header_guard);

        Ok(Self {
            pool,
            comparator,
            index_name: options.index_name,
            header_page_id: options.header_page_id,
            root_page_id: Cell::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// The name this index was opened with.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// The buffer pool backing this tree.
    pub fn pool(&self) -> &BufferPoolManager {
        &self.pool
    }

    /// The current root page id (the sentinel when the tree is empty).
    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.get()
    }

    /// True if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(true);
        }
        let guard = self.pool.fetch_basic(root)?;
        let data = guard.data();
        let empty = match page::page_type(&data[..]) {
            PageType::Leaf => LeafPage::<K, V>::new(&data[..]).size() == 0,
            _ => false,
        };
        Ok(empty)
    }

    /// Number of levels from root to leaf; 0 for an empty tree.
    pub fn height(&self) -> Result<u32> {
        let mut cur_id = self.root_page_id.get();
        let mut height = 0;
        while cur_id.is_valid() {
            let guard = self.pool.fetch_basic(cur_id)?;
            let data = guard.data();
            height += 1;
            match page::page_type(&data[..]) {
                PageType::Leaf => break,
                PageType::Internal => {
                    cur_id = InternalPage::<K>::new(&data[..]).child_at(0);
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            }
        }
        Ok(height)
    }

    /// Writes the cached root id back to the header page.
    pub fn checkpoint(&self) -> Result<()> {
        let guard = self.pool.fetch_basic(self.header_page_id)?;
        let mut data = guard.data_mut();
        HeaderPage::set_root_page_id(&mut data[..], self.root_page_id.get());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Collects every value whose key compares equal under the default
    /// comparator (zero or one value for this unique-key tree).
    pub fn get_value(&self, key: &K) -> Result<Vec<V>> {
        self.get_value_with(key, &self.comparator.clone())
    }

    /// Collects every value whose key compares equal under `cmp`. With a
    /// prefix comparator this can span several leaves.
    pub fn get_value_with<C2: KeyComparator<K>>(&self, key: &K, cmp: &C2) -> Result<Vec<V>> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(Vec::new());
        }

        let mut cur = self.pool.fetch_basic(root)?;
        loop {
            let next = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    PageType::Internal => {
                        let node = InternalPage::<K>::new(&data[..]);
                        Some(node.child_at(node.last_index_lt(key, cmp)))
                    }
                    other => {
                        return Err(StratumError::Corrupted(format!(
                            "unexpected page type {:?} in tree",
                            other
                        )))
                    }
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_basic(child)?,
                None => break,
            }
        }

        let mut result = Vec::new();
        loop {
            let next_leaf = {
                let data = cur.data();
                let leaf = LeafPage::<K, V>::new(&data[..]);
                let size = leaf.size();
                let mut i = leaf.last_index_lt(key, cmp).map_or(0, |i| i + 1);
                while i < size && cmp.compare(&leaf.key_at(i), key) == Ordering::Equal {
                    result.push(leaf.value_at(i));
                    i += 1;
                }
                if i == size {
                    leaf.next_leaf_id()
                } else {
                    PageId::INVALID
                }
            };
            if next_leaf.is_valid() {
                cur = self.pool.fetch_basic(next_leaf)?;
            } else {
                break;
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Inserts a key/value pair. Returns false (and changes nothing) when
    /// the key is already present.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        if !self.root_page_id.get().is_valid() {
            let (root_id, guard) = self.pool.new_page()?;
            LeafPageMut::<K, V>::init(&mut guard.data_mut()[..], self.leaf_max_size);
            drop(guard);
            self.root_page_id.set(root_id);
            trace!(index = %self.index_name, root = %root_id, "started new tree");
        }

        let cmp = &self.comparator;
        let mut stack: Vec<(BasicGuard<'_>, usize)> = Vec::new();
        let mut cur = self.pool.fetch_basic(self.root_page_id.get())?;

        loop {
            let step = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    PageType::Internal => {
                        let node = InternalPage::<K>::new(&data[..]);
                        let idx = node.last_index_le(key, cmp);
                        Some((node.child_at(idx), idx, node.insert_safe()))
                    }
                    other => {
                        return Err(StratumError::Corrupted(format!(
                            "unexpected page type {:?} in tree",
                            other
                        )))
                    }
                }
            };
            match step {
                None => break,
                Some((child, idx, safe)) => {
                    if safe {
                        // This node absorbs any growth below it.
                        stack.clear();
                    }
                    let next = self.pool.fetch_basic(child)?;
                    stack.push((cur, idx));
                    cur = next;
                }
            }
        }

        let inserted = {
            let mut data = cur.data_mut();
            LeafPageMut::<K, V>::new(&mut data[..])
                .insert_sorted(key, value, cmp)
                .is_some()
        };
        if !inserted {
            return Ok(false);
        }

        loop {
            let overfull = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => LeafPage::<K, V>::new(&data[..]).size_exceeded(),
                    _ => InternalPage::<K>::new(&data[..]).size_exceeded(),
                }
            };
            if !overfull {
                break;
            }
            match stack.pop() {
                None => {
                    self.split_root(&cur)?;
                    break;
                }
                Some((parent, pos)) => {
                    if !self.try_shift(&cur, &parent, pos)? {
                        self.split_child(&cur, &parent)?;
                    }
                    cur = parent;
                }
            }
        }
        Ok(true)
    }

    /// Splits an overfull root, growing the tree by one level.
    fn split_root(&self, cur: &BasicGuard<'_>) -> Result<()> {
        let cmp = &self.comparator;
        let old_root = self.root_page_id.get();
        let (new_root_id, root_guard) = self.pool.new_page()?;
        let (sibling_id, sibling_guard) = self.pool.new_page()?;

        {
            let mut root_data = root_guard.data_mut();
            let mut new_root =
                InternalPageMut::<K>::init(&mut root_data[..], self.internal_max_size);
            new_root.init_root(old_root);

            let mut cur_data = cur.data_mut();
            let mut sibling_data = sibling_guard.data_mut();
            let tag = page::page_type(&cur_data[..]);
            match tag {
                PageType::Leaf => {
                    let mut cur_view = LeafPageMut::<K, V>::new(&mut cur_data[..]);
                    let mut sibling =
                        LeafPageMut::<K, V>::init(&mut sibling_data[..], self.leaf_max_size);
                    let old_next = cur_view.next_leaf_id();
                    cur_view.copy_second_half_to(&mut sibling);
                    new_root.insert_sorted(&sibling.key_at(0), sibling_id, cmp);
                    sibling.set_next_leaf_id(old_next);
                    cur_view.set_next_leaf_id(sibling_id);
                }
                _ => {
                    let mut cur_view = InternalPageMut::<K>::new(&mut cur_data[..]);
                    let mut sibling =
                        InternalPageMut::<K>::init(&mut sibling_data[..], self.internal_max_size);
                    let promoted = cur_view.copy_second_half_to(&mut sibling);
                    new_root.insert_sorted(&promoted, sibling_id, cmp);
                }
            }
        }

        self.root_page_id.set(new_root_id);
        trace!(index = %self.index_name, root = %new_root_id, "root split");
        Ok(())
    }

    /// Splits an overfull non-root page, inserting the separator into its
    /// parent.
    fn split_child(&self, cur: &BasicGuard<'_>, parent: &BasicGuard<'_>) -> Result<()> {
        let cmp = &self.comparator;
        let (sibling_id, sibling_guard) = self.pool.new_page()?;

        let mut parent_data = parent.data_mut();
        let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
        let mut cur_data = cur.data_mut();
        let mut sibling_data = sibling_guard.data_mut();

        let tag = page::page_type(&cur_data[..]);
        match tag {
            PageType::Leaf => {
                let mut cur_view = LeafPageMut::<K, V>::new(&mut cur_data[..]);
                let mut sibling =
                    LeafPageMut::<K, V>::init(&mut sibling_data[..], self.leaf_max_size);
                let old_next = cur_view.next_leaf_id();
                cur_view.copy_second_half_to(&mut sibling);
                parent_view.insert_sorted(&sibling.key_at(0), sibling_id, cmp);
                sibling.set_next_leaf_id(old_next);
                cur_view.set_next_leaf_id(sibling_id);
            }
            _ => {
                let mut cur_view = InternalPageMut::<K>::new(&mut cur_data[..]);
                let mut sibling =
                    InternalPageMut::<K>::init(&mut sibling_data[..], self.internal_max_size);
                let promoted = cur_view.copy_second_half_to(&mut sibling);
                parent_view.insert_sorted(&promoted, sibling_id, cmp);
            }
        }
        Ok(())
    }

    /// Tries to cure overflow by donating entries to an adjacent sibling
    /// under the same parent, right first.
    fn try_shift(
        &self,
        cur: &BasicGuard<'_>,
        parent: &BasicGuard<'_>,
        pos: usize,
    ) -> Result<bool> {
        let parent_size = {
            let data = parent.data();
            InternalPage::<K>::new(&data[..]).size()
        };

        if pos + 1 < parent_size {
            let right_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos + 1)
            };
            let right_guard = self.pool.fetch_basic(right_id)?;
            let mut parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let mut cur_data = cur.data_mut();
            let mut right_data = right_guard.data_mut();
            let tag = page::page_type(&cur_data[..]);
            let shifted = match tag {
                PageType::Leaf => shift_leaf_into_right(
                    &mut LeafPageMut::<K, V>::new(&mut cur_data[..]),
                    &mut LeafPageMut::<K, V>::new(&mut right_data[..]),
                    &mut parent_view,
                    pos,
                ),
                _ => shift_internal_into_right(
                    &mut InternalPageMut::<K>::new(&mut cur_data[..]),
                    &mut InternalPageMut::<K>::new(&mut right_data[..]),
                    &mut parent_view,
                    pos,
                ),
            };
            if shifted {
                return Ok(true);
            }
        }

        if pos > 0 {
            let left_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos - 1)
            };
            let left_guard = self.pool.fetch_basic(left_id)?;
            let mut parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let mut cur_data = cur.data_mut();
            let mut left_data = left_guard.data_mut();
            let tag = page::page_type(&cur_data[..]);
            let shifted = match tag {
                PageType::Leaf => shift_leaf_into_left(
                    &mut LeafPageMut::<K, V>::new(&mut cur_data[..]),
                    &mut LeafPageMut::<K, V>::new(&mut left_data[..]),
                    &mut parent_view,
                    pos,
                ),
                _ => shift_internal_into_left(
                    &mut InternalPageMut::<K>::new(&mut cur_data[..]),
                    &mut InternalPageMut::<K>::new(&mut left_data[..]),
                    &mut parent_view,
                    pos,
                ),
            };
            if shifted {
                return Ok(true);
            }
        }

        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    /// Removes a key. Returns false when the key is absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(false);
        }

        let cmp = &self.comparator;
        let mut stack: Vec<(BasicGuard<'_>, usize)> = Vec::new();
        let mut root_may_change = true;
        let mut cur = self.pool.fetch_basic(root)?;

        loop {
            let step = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    PageType::Internal => {
                        let node = InternalPage::<K>::new(&data[..]);
                        let idx = node.last_index_le(key, cmp);
                        Some((node.child_at(idx), idx, node.remove_safe()))
                    }
                    other => {
                        return Err(StratumError::Corrupted(format!(
                            "unexpected page type {:?} in tree",
                            other
                        )))
                    }
                }
            };
            match step {
                None => break,
                Some((child, idx, safe)) => {
                    if safe && !stack.is_empty() {
                        // This node absorbs any shrink below it.
                        stack.clear();
                        root_may_change = false;
                    }
                    let next = self.pool.fetch_basic(child)?;
                    stack.push((cur, idx));
                    cur = next;
                }
            }
        }

        let replacement = {
            let mut data = cur.data_mut();
            let mut leaf = LeafPageMut::<K, V>::new(&mut data[..]);
            match leaf.remove_by_key(key, cmp) {
                None => return Ok(false),
                Some(0) if leaf.size() > 0 => Some(leaf.key_at(0)),
                Some(_) => None,
            }
        };

        let mut dead = None;
        if let Some((parent, pos)) = stack.last() {
            let underfull = {
                let data = cur.data();
                LeafPage::<K, V>::new(&data[..]).size_not_enough()
            };
            if underfull {
                dead = self.rebalance(&cur, parent, *pos)?;
            }
        }
        drop(cur);
        if let Some(page_id) = dead {
            self.pool.delete_page(page_id)?;
        }

        while let Some((guard, descent_idx)) = stack.pop() {
            if let Some(rep) = &replacement {
                let stale = {
                    let data = guard.data();
                    let node = InternalPage::<K>::new(&data[..]);
                    descent_idx > 0
                        && descent_idx < node.size()
                        && cmp.compare(&node.key_at(descent_idx), key) == Ordering::Equal
                };
                if stale {
                    let mut data = guard.data_mut();
                    InternalPageMut::<K>::new(&mut data[..]).set_key_at(descent_idx, rep);
                }
            }

            let mut dead = None;
            if let Some((parent, pos)) = stack.last() {
                let underfull = {
                    let data = guard.data();
                    InternalPage::<K>::new(&data[..]).size_not_enough()
                };
                if underfull {
                    dead = self.rebalance(&guard, parent, *pos)?;
                }
            }
            drop(guard);
            if let Some(page_id) = dead {
                self.pool.delete_page(page_id)?;
            }
        }

        if root_may_change {
            self.collapse_root()?;
        }
        Ok(true)
    }

    /// Shrinks the tree when the root is down to one child, and resets the
    /// root to the sentinel when the last entry of a root leaf is gone.
    fn collapse_root(&self) -> Result<()> {
        let root_id = self.root_page_id.get();
        let action = {
            let guard = self.pool.fetch_basic(root_id)?;
            let data = guard.data();
            match page::page_type(&data[..]) {
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&data[..]);
                    (node.size() == 1).then(|| (node.child_at(0), false))
                }
                PageType::Leaf => {
                    let leaf = LeafPage::<K, V>::new(&data[..]);
                    (leaf.size() == 0).then_some((PageId::INVALID, true))
                }
                _ => None,
            }
        };
        if let Some((new_root, delete_old)) = action {
            self.root_page_id.set(new_root);
            trace!(index = %self.index_name, root = %new_root, "root collapsed");
            if delete_old {
                self.pool.delete_page(root_id)?;
            }
        }
        Ok(())
    }

    /// Cures underflow: borrow from an adjacent sibling if it can spare
    /// entries, otherwise merge with one. Right sibling first. Returns the
    /// page to delete after the caller drops its guards.
    fn rebalance(
        &self,
        cur: &BasicGuard<'_>,
        parent: &BasicGuard<'_>,
        pos: usize,
    ) -> Result<Option<PageId>> {
        let parent_size = {
            let data = parent.data();
            InternalPage::<K>::new(&data[..]).size()
        };
        let is_leaf = {
            let data = cur.data();
            page::page_type(&data[..]) == PageType::Leaf
        };

        if pos + 1 < parent_size {
            let right_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos + 1)
            };
            let right_guard = self.pool.fetch_basic(right_id)?;
            let mut parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let mut cur_data = cur.data_mut();
            let mut right_data = right_guard.data_mut();
            let replenished = if is_leaf {
                replenish_leaf_from_right(
                    &mut LeafPageMut::<K, V>::new(&mut cur_data[..]),
                    &mut LeafPageMut::<K, V>::new(&mut right_data[..]),
                    &mut parent_view,
                    pos,
                )
            } else {
                replenish_internal_from_right(
                    &mut InternalPageMut::<K>::new(&mut cur_data[..]),
                    &mut InternalPageMut::<K>::new(&mut right_data[..]),
                    &mut parent_view,
                    pos,
                )
            };
            if replenished {
                return Ok(None);
            }
        }

        if pos > 0 {
            let left_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos - 1)
            };
            let left_guard = self.pool.fetch_basic(left_id)?;
            let mut parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let mut cur_data = cur.data_mut();
            let mut left_data = left_guard.data_mut();
            let replenished = if is_leaf {
                replenish_leaf_from_left(
                    &mut LeafPageMut::<K, V>::new(&mut cur_data[..]),
                    &mut LeafPageMut::<K, V>::new(&mut left_data[..]),
                    &mut parent_view,
                    pos,
                )
            } else {
                replenish_internal_from_left(
                    &mut InternalPageMut::<K>::new(&mut cur_data[..]),
                    &mut InternalPageMut::<K>::new(&mut left_data[..]),
                    &mut parent_view,
                    pos,
                )
            };
            if replenished {
                return Ok(None);
            }
        }

        let fit = if is_leaf {
            self.leaf_max_size as usize
        } else {
            self.internal_max_size as usize
        };

        if pos + 1 < parent_size {
            let right_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos + 1)
            };
            let right_guard = self.pool.fetch_basic(right_id)?;
            let merged = {
                let mut parent_data = parent.data_mut();
                let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
                let mut cur_data = cur.data_mut();
                let mut right_data = right_guard.data_mut();
                if is_leaf {
                    let mut cur_view = LeafPageMut::<K, V>::new(&mut cur_data[..]);
                    let mut right_view = LeafPageMut::<K, V>::new(&mut right_data[..]);
                    (cur_view.size() + right_view.size() <= fit).then(|| {
                        coalesce_leaf_right(&mut cur_view, &mut right_view, &mut parent_view, pos)
                    })
                } else {
                    let mut cur_view = InternalPageMut::<K>::new(&mut cur_data[..]);
                    let mut right_view = InternalPageMut::<K>::new(&mut right_data[..]);
                    (cur_view.size() + right_view.size() <= fit).then(|| {
                        coalesce_internal_right(
                            &mut cur_view,
                            &mut right_view,
                            &mut parent_view,
                            pos,
                        )
                    })
                }
            };
            if merged.is_some() {
                return Ok(merged);
            }
        }

        if pos > 0 {
            let left_id = {
                let data = parent.data();
                InternalPage::<K>::new(&data[..]).child_at(pos - 1)
            };
            let left_guard = self.pool.fetch_basic(left_id)?;
            let merged = {
                let mut parent_data = parent.data_mut();
                let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
                let mut cur_data = cur.data_mut();
                let mut left_data = left_guard.data_mut();
                if is_leaf {
                    let mut cur_view = LeafPageMut::<K, V>::new(&mut cur_data[..]);
                    let mut left_view = LeafPageMut::<K, V>::new(&mut left_data[..]);
                    (cur_view.size() + left_view.size() <= fit).then(|| {
                        coalesce_leaf_left(&mut cur_view, &mut left_view, &mut parent_view, pos)
                    })
                } else {
                    let mut cur_view = InternalPageMut::<K>::new(&mut cur_data[..]);
                    let mut left_view = InternalPageMut::<K>::new(&mut left_data[..]);
                    (cur_view.size() + left_view.size() <= fit).then(|| {
                        coalesce_internal_left(&mut cur_view, &mut left_view, &mut parent_view, pos)
                    })
                }
            };
            if merged.is_some() {
                return Ok(merged);
            }
        }

        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    /// Iterator over the first entry of the tree.
    pub fn begin(&self) -> Result<IndexIterator<'_, K, V>> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(IndexIterator::end(self.pool()));
        }
        let mut cur = self.pool.fetch_basic(root)?;
        loop {
            let next = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    _ => Some(InternalPage::<K>::new(&data[..]).child_at(0)),
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_basic(child)?,
                None => break,
            }
        }
        let (leaf_id, size) = {
            let data = cur.data();
            (cur.page_id(), LeafPage::<K, V>::new(&data[..]).size())
        };
        drop(cur);
        if size == 0 {
            return Ok(IndexIterator::end(self.pool()));
        }
        IndexIterator::new(self.pool(), leaf_id, 0)
    }

    /// Iterator seated at the last entry whose key compares <= `key` under
    /// the default comparator; end when every key is greater.
    pub fn begin_at(&self, key: &K) -> Result<IndexIterator<'_, K, V>> {
        let cmp = self.comparator.clone();
        let Some(leaf_id) = self.find_leaf_le(key, &cmp)? else {
            return Ok(IndexIterator::end(self.pool()));
        };
        let index = {
            let guard = self.pool.fetch_basic(leaf_id)?;
            let data = guard.data();
            LeafPage::<K, V>::new(&data[..]).last_index_le(key, &cmp)
        };
        match index {
            Some(index) => IndexIterator::new(self.pool(), leaf_id, index),
            None => Ok(IndexIterator::end(self.pool())),
        }
    }

    /// Iterator at the exact key under the default comparator, or end.
    pub fn find(&self, key: &K) -> Result<IndexIterator<'_, K, V>> {
        let cmp = self.comparator.clone();
        let Some(leaf_id) = self.find_leaf_le(key, &cmp)? else {
            return Ok(IndexIterator::end(self.pool()));
        };
        let index = {
            let guard = self.pool.fetch_basic(leaf_id)?;
            let data = guard.data();
            LeafPage::<K, V>::new(&data[..]).index_eq(key, &cmp)
        };
        match index {
            Some(index) => IndexIterator::new(self.pool(), leaf_id, index),
            None => Ok(IndexIterator::end(self.pool())),
        }
    }

    /// Iterator at the first entry comparing equal to `key` under `cmp`,
    /// stepping to the next leaf when the match sits at a page boundary.
    pub fn first<C2: KeyComparator<K>>(
        &self,
        key: &K,
        cmp: &C2,
    ) -> Result<IndexIterator<'_, K, V>> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(IndexIterator::end(self.pool()));
        }
        let mut cur = self.pool.fetch_basic(root)?;
        loop {
            let next = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    _ => {
                        let node = InternalPage::<K>::new(&data[..]);
                        Some(node.child_at(node.last_index_lt(key, cmp)))
                    }
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_basic(child)?,
                None => break,
            }
        }

        let seat = {
            let data = cur.data();
            let leaf = LeafPage::<K, V>::new(&data[..]);
            let index = leaf.first_index_ge(key, cmp);
            if index < leaf.size() {
                if cmp.compare(&leaf.key_at(index), key) == Ordering::Equal {
                    Some((cur.page_id(), index))
                } else {
                    None
                }
            } else if leaf.next_leaf_id().is_valid() {
                // The match, if any, sits at the start of the next leaf.
                let next_id = leaf.next_leaf_id();
                let next_guard = self.pool.fetch_basic(next_id)?;
                let next_data = next_guard.data();
                let next_leaf = LeafPage::<K, V>::new(&next_data[..]);
                if next_leaf.size() > 0
                    && cmp.compare(&next_leaf.key_at(0), key) == Ordering::Equal
                {
                    Some((next_id, 0))
                } else {
                    None
                }
            } else {
                None
            }
        };
        drop(cur);
        match seat {
            Some((leaf_id, index)) => IndexIterator::new(self.pool(), leaf_id, index),
            None => Ok(IndexIterator::end(self.pool())),
        }
    }

    /// The sentinel iterator.
    pub fn end(&self) -> IndexIterator<'_, K, V> {
        IndexIterator::end(self.pool())
    }

    /// Descends by `last_index_le` to the leaf that could hold `key`.
    fn find_leaf_le(&self, key: &K, cmp: &C) -> Result<Option<PageId>> {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut cur = self.pool.fetch_basic(root)?;
        loop {
            let next = {
                let data = cur.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => None,
                    _ => {
                        let node = InternalPage::<K>::new(&data[..]);
                        Some(node.child_at(node.last_index_le(key, cmp)))
                    }
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_basic(child)?,
                None => return Ok(Some(cur.page_id())),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Debugging
    // -----------------------------------------------------------------------

    /// Renders the tree one line per level, keys only. For small trees and
    /// debugging sessions.
    pub fn render(&self) -> Result<String>
    where
        K: std::fmt::Display,
    {
        let root = self.root_page_id.get();
        if !root.is_valid() {
            return Ok("(empty)".to_string());
        }
        let mut out = String::new();
        let mut level = vec![root];
        loop {
            let mut next_level = Vec::new();
            let mut line = String::new();
            for &page_id in &level {
                let guard = self.pool.fetch_basic(page_id)?;
                let data = guard.data();
                match page::page_type(&data[..]) {
                    PageType::Leaf => {
                        let leaf = LeafPage::<K, V>::new(&data[..]);
                        line.push('(');
                        for i in 0..leaf.size() {
                            if i > 0 {
                                line.push(',');
                            }
                            line.push_str(&leaf.key_at(i).to_string());
                        }
                        line.push_str(") ");
                    }
                    _ => {
                        let node = InternalPage::<K>::new(&data[..]);
                        line.push('[');
                        for i in 1..node.size() {
                            if i > 1 {
                                line.push(',');
                            }
                            line.push_str(&node.key_at(i).to_string());
                        }
                        line.push_str("] ");
                        for i in 0..node.size() {
                            next_level.push(node.child_at(i));
                        }
                    }
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
            if next_level.is_empty() {
                break;
            }
            level = next_level;
        }
        Ok(out)
    }
}

impl<K, V, C> Drop for LocalBPlusTree<K, V, C> {
    fn drop(&mut self) {
        // Best effort: persist the cached root id.
        if let Err(e) = (|| -> Result<()> {
            let guard = self.pool.fetch_basic(self.header_page_id)?;
            let mut data = guard.data_mut();
            if page::page_type(&data[..]) == PageType::Header {
                HeaderPage::set_root_page_id(&mut data[..], self.root_page_id.get());
            }
            Ok(())
        })() {
            warn!(index = %self.index_name, error = %e, "failed to persist root id on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::create_header_page;
    use stratum_buffer::{BufferPoolConfig, MemoryDiskManager};
    use stratum_common::key::{CompoundKey, DefaultComparator};

    type Key = CompoundKey<8>;
    type Tree = LocalBPlusTree<Key, u64, DefaultComparator>;

    fn key(v: u64) -> Key {
        Key::from_u64(v)
    }

    fn small_tree(pool_size: usize, leaf_max: u32, internal_max: u32) -> Tree {
        let pool = Arc::new(BufferPoolManager::new(
            BufferPoolConfig {
                pool_size,
                replacer_k: 2,
            },
            Arc::new(MemoryDiskManager::new()),
        ));
        create_header_page(&pool).unwrap();
        Tree::new(
            pool,
            DefaultComparator,
            BPlusTreeOptions::default().with_max_sizes(leaf_max, internal_max),
        )
        .unwrap()
    }

    #[test]
    fn test_local_tree_empty() {
        let tree = small_tree(16, 4, 4);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
        assert!(tree.get_value(&key(1)).unwrap().is_empty());
        assert!(!tree.remove(&key(1)).unwrap());
        assert!(tree.begin().unwrap().is_end());
        assert_eq!(tree.height().unwrap(), 0);
    }

    #[test]
    fn test_local_tree_single_leaf() {
        let tree = small_tree(16, 4, 4);

        assert!(tree.insert(&key(2), &20).unwrap());
        assert!(tree.insert(&key(1), &10).unwrap());
        assert!(tree.insert(&key(3), &30).unwrap());

        assert_eq!(tree.get_value(&key(1)).unwrap(), vec![10]);
        assert_eq!(tree.get_value(&key(2)).unwrap(), vec![20]);
        assert_eq!(tree.get_value(&key(3)).unwrap(), vec![30]);
        assert!(tree.get_value(&key(4)).unwrap().is_empty());
        assert_eq!(tree.height().unwrap(), 1);
    }

    #[test]
    fn test_local_tree_duplicate_insert() {
        let tree = small_tree(16, 4, 4);

        assert!(tree.insert(&key(5), &1).unwrap());
        assert!(!tree.insert(&key(5), &2).unwrap());
        assert_eq!(tree.get_value(&key(5)).unwrap(), vec![1]);
    }

    #[test]
    fn test_local_tree_leaf_split() {
        let tree = small_tree(16, 4, 4);

        for v in 1..=5u64 {
            assert!(tree.insert(&key(v), &(v * 100)).unwrap());
        }
        assert_eq!(tree.height().unwrap(), 2);

        for v in 1..=5u64 {
            assert_eq!(tree.get_value(&key(v)).unwrap(), vec![v * 100]);
        }

        let collected: Vec<u64> = tree.begin().unwrap().map(|(k, _)| k.as_u64()).collect();
        assert_eq!(collected, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_local_tree_grows_three_levels() {
        let tree = small_tree(64, 3, 3);

        for v in 1..=30u64 {
            assert!(tree.insert(&key(v), &v).unwrap());
        }
        assert!(tree.height().unwrap() >= 3);

        for v in 1..=30u64 {
            assert_eq!(tree.get_value(&key(v)).unwrap(), vec![v]);
        }
    }

    #[test]
    fn test_local_tree_remove_to_empty() {
        let tree = small_tree(16, 4, 4);

        for v in 1..=3u64 {
            tree.insert(&key(v), &v).unwrap();
        }
        for v in 1..=3u64 {
            assert!(tree.remove(&key(v)).unwrap());
            assert!(!tree.remove(&key(v)).unwrap());
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
    }

    #[test]
    fn test_local_tree_checkpoint_persists_root() {
        let tree = small_tree(16, 4, 4);
        tree.insert(&key(1), &1).unwrap();
        tree.checkpoint().unwrap();

        let header = tree.pool().fetch_basic(PageId::HEADER).unwrap();
        let data = header.data();
        assert_eq!(
            HeaderPage::root_page_id(&data[..]),
            tree.root_page_id()
        );
    }

    #[test]
    fn test_local_tree_render() {
        let tree = small_tree(16, 4, 4);
        for v in 1..=5u64 {
            tree.insert(&key(v), &v).unwrap();
        }
        let rendered = tree.render().unwrap();
        assert!(rendered.contains('('));
        assert!(rendered.lines().count() >= 2);
    }
}
