//! Multi-threaded B+ tree variant.
//!
//! Readers descend with single-guard read latching. Writers first try an
//! optimistic descent that read-latches the path and write-latches only the
//! leaf; whenever a node on the path might need structural change the
//! attempt aborts and the operation retries pessimistically, crabbing a
//! chain of write guards top-down and releasing ancestors the moment the
//! current node is proven safe. The header page guard participates in the
//! crab so the root id can change only under its exclusive latch.
//!
//! Latch order is strictly top-down (header before root before child); the
//! buffer pool mutex is always released before a guard's latch is taken, so
//! no cycle is possible.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

use stratum_buffer::{BufferPoolManager, WriteGuard};
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

/// Thread-safe B+ tree over a buffer pool, using latch crabbing with an
/// optimistic fast path.
///
/// Operations against the same key serialize through the latches;
/// operations on disjoint subtrees proceed in parallel. The buffer pool
/// must outlive the tree, which the `Arc` expresses.
pub struct BPlusTree<K, V, C> {
    pool: Arc<BufferPoolManager>,
    comparator: C,
    index_name: String,
    header_page_id: PageId,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
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

        let mut header = pool.fetch_write(options.header_page_id)?;
        let tag = page::page_type(header.data());
        match tag {
            PageType::Invalid => {
                HeaderPage::init(&mut header.data_mut()[..]);
            }
            PageType::Header => {
                if !options.inherit_file {
                    HeaderPage::set_root_page_id(&mut header.data_mut()[..], PageId::INVALID);
                }
            }
            other => {
                return Err(StratumError::Corrupted(format!(
                    "expected header page at {}, found {:?}",
                    options.header_page_id, other
                )))
            }
        }
        drop(header);

        Ok(Self {
            pool,
            comparator,
            index_name: options.index_name,
            header_page_id: options.header_page_id,
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

    /// The current root page id, read through the header page.
    pub fn root_page_id(&self) -> Result<PageId> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        Ok(HeaderPage::root_page_id(header.data()))
    }

    /// True if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let root = self.root_page_id()?;
        if !root.is_valid() {
            return Ok(true);
        }
        let guard = self.pool.fetch_read(root)?;
        let empty = match page::page_type(guard.data()) {
            PageType::Leaf => LeafPage::<K, V>::new(&guard.data()[..]).size() == 0,
            _ => false,
        };
        Ok(empty)
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
    ///
    /// Read guards are released as the descent proceeds; during the
    /// collection phase the current leaf and its successor are briefly held
    /// together.
    pub fn get_value_with<C2: KeyComparator<K>>(&self, key: &K, cmp: &C2) -> Result<Vec<V>> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root = HeaderPage::root_page_id(header.data());
        if !root.is_valid() {
            return Ok(Vec::new());
        }
        let mut cur = self.pool.fetch_read(root)?;
        drop(header);

        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    Some(node.child_at(node.last_index_lt(key, cmp)))
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_read(child)?,
                None => break,
            }
        }

        let mut result = Vec::new();
        loop {
            let next_leaf = {
                let leaf = LeafPage::<K, V>::new(&cur.data()[..]);
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
                cur = self.pool.fetch_read(next_leaf)?;
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
        if let Some(done) = self.insert_optimistic(key, value)? {
            return Ok(done);
        }
        self.insert_pessimistic(key, value)
    }

    /// Optimistic attempt: read-latched descent, write latch on the leaf
    /// only. Returns None when the operation might need structural change
    /// and must retry pessimistically.
    ///
    /// The parent's read latch stays held while the leaf latch is upgraded
    /// from read to write; restructuring a leaf needs the parent
    /// write-latched, so the leaf the descent chose cannot move in that
    /// window.
    fn insert_optimistic(&self, key: &K, value: &V) -> Result<Option<bool>> {
        let cmp = &self.comparator;
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root = HeaderPage::root_page_id(header.data());
        if !root.is_valid() {
            return Ok(None);
        }
        let mut cur = self.pool.fetch_read(root)?;
        drop(header);
        let mut cur_id = root;
        let mut parent = None;

        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    if !node.insert_safe() {
                        return Ok(None);
                    }
                    Some(node.child_at(node.last_index_le(key, cmp)))
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            };
            match next {
                Some(child) => {
                    let next_guard = self.pool.fetch_read(child)?;
                    parent = Some(cur);
                    cur = next_guard;
                    cur_id = child;
                }
                None => break,
            }
        }
        if parent.is_none() {
            // A root leaf has no parent latch bridging the upgrade; let
            // the pessimistic path pin it down under the header latch.
            return Ok(None);
        }
        drop(cur);

        let mut leaf_guard = self.pool.fetch_write(cur_id)?;
        drop(parent);
        let abort = {
            let leaf = LeafPage::<K, V>::new(&leaf_guard.data()[..]);
            // An insertion in front of the leaf's leading key can ripple a
            // separator change upward, outside this leaf.
            !leaf.insert_safe()
                || leaf.size() == 0
                || cmp.compare(&leaf.key_at(0), key) != Ordering::Less
        };
        if abort {
            return Ok(None);
        }
        let inserted = LeafPageMut::<K, V>::new(&mut leaf_guard.data_mut()[..])
            .insert_sorted(key, value, cmp)
            .is_some();
        Ok(Some(inserted))
    }

    /// Pessimistic insert: crab write guards top-down, restructure on the
    /// way back up.
    fn insert_pessimistic(&self, key: &K, value: &V) -> Result<bool> {
        let cmp = &self.comparator;
        let mut header_guard = self.pool.fetch_write(self.header_page_id)?;
        let mut root = HeaderPage::root_page_id(header_guard.data());
        if !root.is_valid() {
            let (new_root, guard) = self.pool.new_page()?;
            LeafPageMut::<K, V>::init(&mut guard.data_mut()[..], self.leaf_max_size);
            drop(guard);
            HeaderPage::set_root_page_id(&mut header_guard.data_mut()[..], new_root);
            root = new_root;
            trace!(index = %self.index_name, root = %new_root, "started new tree");
        }

        let mut header = Some(header_guard);
        let mut stack: Vec<(WriteGuard<'_>, usize)> = Vec::new();
        let mut cur = self.pool.fetch_write(root)?;

        loop {
            let step = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    let idx = node.last_index_le(key, cmp);
                    Some((node.child_at(idx), idx, node.insert_safe()))
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            };
            match step {
                None => break,
                Some((child, idx, safe)) => {
                    if safe {
                        // This node absorbs any growth below it; ancestors
                        // and the header can be released.
                        stack.clear();
                        header = None;
                    }
                    let next = self.pool.fetch_write(child)?;
                    stack.push((cur, idx));
                    cur = next;
                }
            }
        }

        let inserted = LeafPageMut::<K, V>::new(&mut cur.data_mut()[..])
            .insert_sorted(key, value, cmp)
            .is_some();
        if !inserted {
            return Ok(false);
        }

        loop {
            let overfull = match page::page_type(cur.data()) {
                PageType::Leaf => LeafPage::<K, V>::new(&cur.data()[..]).size_exceeded(),
                _ => InternalPage::<K>::new(&cur.data()[..]).size_exceeded(),
            };
            if !overfull {
                break;
            }
            match stack.pop() {
                None => {
                    let mut header_guard = match header.take() {
                        Some(guard) => guard,
                        None => unreachable!("root overflow with released header latch"),
                    };
                    self.split_root(&mut cur, &mut header_guard)?;
                    break;
                }
                Some((mut parent, pos)) => {
                    if !self.try_shift(&mut cur, &mut parent, pos)? {
                        self.split_child(&mut cur, &mut parent)?;
                    }
                    cur = parent;
                }
            }
        }
        Ok(true)
    }

    /// Splits an overfull root, growing the tree by one level.
    fn split_root(
        &self,
        cur: &mut WriteGuard<'_>,
        header: &mut WriteGuard<'_>,
    ) -> Result<()> {
        let cmp = &self.comparator;
        let old_root = cur.page_id();
        let (new_root_id, root_guard) = self.pool.new_page()?;
        let (sibling_id, sibling_guard) = self.pool.new_page()?;

        {
            let mut root_data = root_guard.data_mut();
            let mut new_root =
                InternalPageMut::<K>::init(&mut root_data[..], self.internal_max_size);
            new_root.init_root(old_root);

            let cur_data = cur.data_mut();
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

        HeaderPage::set_root_page_id(&mut header.data_mut()[..], new_root_id);
        trace!(index = %self.index_name, root = %new_root_id, "root split");
        Ok(())
    }

    /// Splits an overfull non-root page, inserting the separator into its
    /// parent.
    fn split_child(&self, cur: &mut WriteGuard<'_>, parent: &mut WriteGuard<'_>) -> Result<()> {
        let cmp = &self.comparator;
        let (sibling_id, sibling_guard) = self.pool.new_page()?;

        let parent_data = parent.data_mut();
        let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
        let cur_data = cur.data_mut();
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
        cur: &mut WriteGuard<'_>,
        parent: &mut WriteGuard<'_>,
        pos: usize,
    ) -> Result<bool> {
        let parent_size = InternalPage::<K>::new(&parent.data()[..]).size();

        if pos + 1 < parent_size {
            let right_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos + 1);
            let mut right_guard = self.pool.fetch_write(right_id)?;
            let parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let cur_data = cur.data_mut();
            let right_data = right_guard.data_mut();
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
            let left_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos - 1);
            let mut left_guard = self.pool.fetch_write(left_id)?;
            let parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let cur_data = cur.data_mut();
            let left_data = left_guard.data_mut();
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
        if let Some(done) = self.remove_optimistic(key)? {
            return Ok(done);
        }
        self.remove_pessimistic(key)
    }

    /// Optimistic attempt: read-latched descent, write latch on the leaf
    /// only. Returns None when the operation might need structural change
    /// or a separator update and must retry pessimistically.
    ///
    /// As with the optimistic insert, the parent's read latch bridges the
    /// leaf's read-to-write upgrade.
    fn remove_optimistic(&self, key: &K) -> Result<Option<bool>> {
        let cmp = &self.comparator;
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root = HeaderPage::root_page_id(header.data());
        if !root.is_valid() {
            return Ok(Some(false));
        }
        let mut cur = self.pool.fetch_read(root)?;
        drop(header);
        let mut cur_id = root;
        let mut parent = None;

        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    let is_root = cur_id == root;
                    // Abort when a root collapse is imminent or the node
                    // could underflow.
                    if (is_root && node.size() == 1) || (!is_root && !node.remove_safe()) {
                        return Ok(None);
                    }
                    let idx = node.last_index_le(key, cmp);
                    // An equal separator would need replacing after the
                    // removal.
                    if idx != 0 && cmp.compare(&node.key_at(idx), key) == Ordering::Equal {
                        return Ok(None);
                    }
                    Some(node.child_at(idx))
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            };
            match next {
                Some(child) => {
                    let next_guard = self.pool.fetch_read(child)?;
                    parent = Some(cur);
                    cur = next_guard;
                    cur_id = child;
                }
                None => break,
            }
        }
        if parent.is_none() {
            // A root leaf has no parent latch bridging the upgrade; let
            // the pessimistic path pin it down under the header latch.
            return Ok(None);
        }
        drop(cur);

        let mut leaf_guard = self.pool.fetch_write(cur_id)?;
        drop(parent);
        let abort = {
            let leaf = LeafPage::<K, V>::new(&leaf_guard.data()[..]);
            // Removing the leading key propagates a separator change.
            !leaf.remove_safe()
                || (leaf.size() > 0 && cmp.compare(&leaf.key_at(0), key) == Ordering::Equal)
        };
        if abort {
            return Ok(None);
        }
        let removed = LeafPageMut::<K, V>::new(&mut leaf_guard.data_mut()[..])
            .remove_by_key(key, cmp)
            .is_some();
        Ok(Some(removed))
    }

    /// Pessimistic remove: crab write guards top-down, fix separators and
    /// cure underflow on the way back up.
    fn remove_pessimistic(&self, key: &K) -> Result<bool> {
        let cmp = &self.comparator;
        let header_guard = self.pool.fetch_write(self.header_page_id)?;
        let root = HeaderPage::root_page_id(header_guard.data());
        if !root.is_valid() {
            return Ok(false);
        }

        let mut header = Some(header_guard);
        let mut stack: Vec<(WriteGuard<'_>, usize)> = Vec::new();
        let mut cur = self.pool.fetch_write(root)?;

        loop {
            let step = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                PageType::Internal => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    let idx = node.last_index_le(key, cmp);
                    Some((node.child_at(idx), idx, node.remove_safe()))
                }
                other => {
                    return Err(StratumError::Corrupted(format!(
                        "unexpected page type {:?} in tree",
                        other
                    )))
                }
            };
            match step {
                None => break,
                Some((child, idx, safe)) => {
                    if safe && !stack.is_empty() {
                        // This node absorbs any shrink below it; ancestors
                        // and the header can be released.
                        stack.clear();
                        header = None;
                    }
                    let next = self.pool.fetch_write(child)?;
                    stack.push((cur, idx));
                    cur = next;
                }
            }
        }

        let replacement = {
            let mut leaf = LeafPageMut::<K, V>::new(&mut cur.data_mut()[..]);
            match leaf.remove_by_key(key, cmp) {
                None => return Ok(false),
                Some(0) if leaf.size() > 0 => Some(leaf.key_at(0)),
                Some(_) => None,
            }
        };

        let mut dead = None;
        if !stack.is_empty() {
            let underfull = LeafPage::<K, V>::new(&cur.data()[..]).size_not_enough();
            if underfull {
                if let Some((parent, pos)) = stack.last_mut() {
                    let pos = *pos;
                    dead = self.rebalance(&mut cur, parent, pos)?;
                }
            }
        }
        drop(cur);
        if let Some(page_id) = dead {
            self.pool.delete_page(page_id)?;
        }

        while let Some((mut guard, descent_idx)) = stack.pop() {
            if let Some(rep) = &replacement {
                let stale = {
                    let node = InternalPage::<K>::new(&guard.data()[..]);
                    descent_idx > 0
                        && descent_idx < node.size()
                        && cmp.compare(&node.key_at(descent_idx), key) == Ordering::Equal
                };
                if stale {
                    InternalPageMut::<K>::new(&mut guard.data_mut()[..])
                        .set_key_at(descent_idx, rep);
                }
            }

            let mut dead = None;
            if !stack.is_empty() {
                let underfull = InternalPage::<K>::new(&guard.data()[..]).size_not_enough();
                if underfull {
                    if let Some((parent, pos)) = stack.last_mut() {
                        let pos = *pos;
                        dead = self.rebalance(&mut guard, parent, pos)?;
                    }
                }
            }
            drop(guard);
            if let Some(page_id) = dead {
                self.pool.delete_page(page_id)?;
            }
        }

        if let Some(mut header_guard) = header.take() {
            self.collapse_root(&mut header_guard)?;
        }
        Ok(true)
    }

    /// Shrinks the tree when the root is down to one child, and resets the
    /// root to the sentinel when the last entry of a root leaf is gone.
    fn collapse_root(&self, header: &mut WriteGuard<'_>) -> Result<()> {
        let root_id = HeaderPage::root_page_id(header.data());
        let root_guard = self.pool.fetch_write(root_id)?;
        let action = match page::page_type(root_guard.data()) {
            PageType::Internal => {
                let node = InternalPage::<K>::new(&root_guard.data()[..]);
                (node.size() == 1).then(|| (node.child_at(0), false))
            }
            PageType::Leaf => {
                let leaf = LeafPage::<K, V>::new(&root_guard.data()[..]);
                (leaf.size() == 0).then_some((PageId::INVALID, true))
            }
            _ => None,
        };
        drop(root_guard);

        if let Some((new_root, delete_old)) = action {
            HeaderPage::set_root_page_id(&mut header.data_mut()[..], new_root);
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
        cur: &mut WriteGuard<'_>,
        parent: &mut WriteGuard<'_>,
        pos: usize,
    ) -> Result<Option<PageId>> {
        let parent_size = InternalPage::<K>::new(&parent.data()[..]).size();
        let is_leaf = page::page_type(cur.data()) == PageType::Leaf;

        if pos + 1 < parent_size {
            let right_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos + 1);
            let mut right_guard = self.pool.fetch_write(right_id)?;
            let parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let cur_data = cur.data_mut();
            let right_data = right_guard.data_mut();
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
            let left_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos - 1);
            let mut left_guard = self.pool.fetch_write(left_id)?;
            let parent_data = parent.data_mut();
            let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
            let cur_data = cur.data_mut();
            let left_data = left_guard.data_mut();
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
            let right_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos + 1);
            let mut right_guard = self.pool.fetch_write(right_id)?;
            let merged = {
                let parent_data = parent.data_mut();
                let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
                let cur_data = cur.data_mut();
                let right_data = right_guard.data_mut();
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
            let left_id = InternalPage::<K>::new(&parent.data()[..]).child_at(pos - 1);
            let mut left_guard = self.pool.fetch_write(left_id)?;
            let merged = {
                let parent_data = parent.data_mut();
                let mut parent_view = InternalPageMut::<K>::new(&mut parent_data[..]);
                let cur_data = cur.data_mut();
                let left_data = left_guard.data_mut();
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
        let root = self.root_page_id()?;
        if !root.is_valid() {
            return Ok(IndexIterator::end(self.pool()));
        }
        let mut cur = self.pool.fetch_read(root)?;
        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                _ => Some(InternalPage::<K>::new(&cur.data()[..]).child_at(0)),
            };
            match next {
                Some(child) => cur = self.pool.fetch_read(child)?,
                None => break,
            }
        }
        let leaf_id = cur.page_id();
        let size = LeafPage::<K, V>::new(&cur.data()[..]).size();
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
            let guard = self.pool.fetch_read(leaf_id)?;
            LeafPage::<K, V>::new(&guard.data()[..]).last_index_le(key, &cmp)
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
            let guard = self.pool.fetch_read(leaf_id)?;
            LeafPage::<K, V>::new(&guard.data()[..]).index_eq(key, &cmp)
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
        let root = self.root_page_id()?;
        if !root.is_valid() {
            return Ok(IndexIterator::end(self.pool()));
        }
        let mut cur = self.pool.fetch_read(root)?;
        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                _ => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    Some(node.child_at(node.last_index_lt(key, cmp)))
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_read(child)?,
                None => break,
            }
        }

        let seat = {
            let leaf = LeafPage::<K, V>::new(&cur.data()[..]);
            let index = leaf.first_index_ge(key, cmp);
            if index < leaf.size() {
                if cmp.compare(&leaf.key_at(index), key) == Ordering::Equal {
                    Some((cur.page_id(), index))
                } else {
                    None
                }
            } else if leaf.next_leaf_id().is_valid() {
                let next_id = leaf.next_leaf_id();
                let next_guard = self.pool.fetch_read(next_id)?;
                let next_leaf = LeafPage::<K, V>::new(&next_guard.data()[..]);
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
        let root = self.root_page_id()?;
        if !root.is_valid() {
            return Ok(None);
        }
        let mut cur = self.pool.fetch_read(root)?;
        loop {
            let next = match page::page_type(cur.data()) {
                PageType::Leaf => None,
                _ => {
                    let node = InternalPage::<K>::new(&cur.data()[..]);
                    Some(node.child_at(node.last_index_le(key, cmp)))
                }
            };
            match next {
                Some(child) => cur = self.pool.fetch_read(child)?,
                None => return Ok(Some(cur.page_id())),
            }
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
    type Tree = BPlusTree<Key, u64, DefaultComparator>;

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
    fn test_tree_empty() {
        let tree = small_tree(16, 4, 4);
        assert!(tree.is_empty().unwrap());
        assert!(tree.get_value(&key(1)).unwrap().is_empty());
        assert!(!tree.remove(&key(1)).unwrap());
        assert!(tree.begin().unwrap().is_end());
    }

    #[test]
    fn test_tree_insert_find_remove() {
        let tree = small_tree(32, 4, 4);

        for v in 1..=20u64 {
            assert!(tree.insert(&key(v), &(v * 2)).unwrap());
        }
        for v in 1..=20u64 {
            assert_eq!(tree.get_value(&key(v)).unwrap(), vec![v * 2]);
        }
        for v in 1..=20u64 {
            assert!(tree.remove(&key(v)).unwrap());
            assert!(tree.get_value(&key(v)).unwrap().is_empty());
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_id().unwrap(), PageId::INVALID);
    }

    #[test]
    fn test_tree_duplicate_insert() {
        let tree = small_tree(16, 4, 4);
        assert!(tree.insert(&key(5), &1).unwrap());
        assert!(!tree.insert(&key(5), &2).unwrap());
        assert_eq!(tree.get_value(&key(5)).unwrap(), vec![1]);
    }

    #[test]
    fn test_tree_scan_order() {
        let tree = small_tree(64, 4, 4);
        for v in (1..=50u64).rev() {
            tree.insert(&key(v), &v).unwrap();
        }
        let collected: Vec<u64> = tree.begin().unwrap().map(|(k, _)| k.as_u64()).collect();
        assert_eq!(collected, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_tree_pin_balance_after_ops() {
        let tree = small_tree(32, 4, 4);
        for v in 1..=30u64 {
            tree.insert(&key(v), &v).unwrap();
        }
        for v in (1..=30u64).step_by(2) {
            tree.remove(&key(v)).unwrap();
        }
        let stats = tree.pool().stats();
        assert_eq!(stats.pinned_frames, 0);
    }

    #[test]
    fn test_tree_concurrent_disjoint_inserts() {
        use std::thread;

        let tree = Arc::new(small_tree(256, 4, 4));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for v in 0..200u64 {
                    let k = t * 1000 + v;
                    assert!(tree.insert(&key(k), &k).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4u64 {
            for v in 0..200u64 {
                let k = t * 1000 + v;
                assert_eq!(tree.get_value(&key(k)).unwrap(), vec![k]);
            }
        }
        let collected: Vec<u64> = tree.begin().unwrap().map(|(k, _)| k.as_u64()).collect();
        assert_eq!(collected.len(), 800);
        assert!(collected.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_tree_concurrent_readers_and_writers() {
        use std::thread;

        let tree = Arc::new(small_tree(256, 8, 8));
        for v in 0..500u64 {
            tree.insert(&key(v), &v).unwrap();
        }

        let mut handles = Vec::new();
        // Writers touch a disjoint upper key range.
        for t in 0..2u64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for v in 0..100u64 {
                    let k = 10_000 + t * 1000 + v;
                    tree.insert(&key(k), &k).unwrap();
                }
            }));
        }
        // Readers hammer the stable lower range.
        for _ in 0..2 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for round in 0..5 {
                    for v in 0..500u64 {
                        let got = tree.get_value(&key(v)).unwrap();
                        assert_eq!(got, vec![v], "round {}", round);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
