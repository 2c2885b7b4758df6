//! Module ``cfavl`` export [CfAvl] type, a concurrent ordered map over
//! a contention-friendly, relaxed-balance AVL tree.
//!
//! Readers descend the tree without taking any lock; writers acquire
//! the per-node lock only around the validate-then-mutate window on the
//! one or two nodes they touch. Removal is split into a logical delete,
//! which swings the value slot to a tombstone at the linearization
//! point, and a physical unlink performed by the maintenance walk when
//! the routing node has at most one child.
//!
//! Balance is relaxed: the AVL height invariant may be violated between
//! maintenance steps and is restored by a per-mutation walk that climbs
//! from the mutated node toward the root, updating heights and rotating
//! where the snapshot shows a skew of two or more. Rotations never
//! mutate the pivot in place, they splice a fresh clone below the risen
//! child and retire the old allocation, so a reader that is still
//! descending through it keeps making progress.
//!
//! Unlinked storage is reclaimed through crossbeam-epoch, every
//! operation runs under a pinned guard.

use std::{
    borrow::Borrow,
    cmp::{self, Ordering},
    fmt::Debug,
    mem,
    sync::atomic::{
        AtomicBool, AtomicI32, AtomicIsize, AtomicU64,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::trace;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::Config,
    core::{IndexIter, Reader, Result, Writer},
    depth::Depth,
    error::Error,
    node::{height_of, spin_lock, Dir, Node},
    stats::{sum_slots, OpStats, Stats},
};

use self::CfAvl as Tree;

include!("cf_common.rs");

/// Concurrent ordered map over a contention-friendly AVL tree.
///
/// ```
/// use cftree::CfAvl;
///
/// let index: Box<CfAvl<i64, i64>> = CfAvl::new("users");
/// assert_eq!(index.set_if_absent(10, 100), None);
/// assert_eq!(index.get(&10), Some(100));
/// ```
///
/// Under multi-threading, register one handle per thread with
/// [CfAvl::to_handle]; handles carry the thread's statistics slot.
pub struct CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    name: String,
    config: Config,
    holder: Atomic<Node<K, V>>,
    n_count: AtomicIsize,
    n_nodes: AtomicIsize,
    slots: Vec<OpStats>,
}

impl<K, V> Drop for CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let holder = self.holder.load(Relaxed, guard);
        if holder.is_null() {
            return;
        }
        let root = unsafe { holder.deref() }.right.load(Relaxed, guard);
        self.free_subtree(root, guard);
        unsafe { drop(holder.into_owned()) };
    }
}

/// Different ways to construct a CfAvl index.
impl<K, V> CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Create an empty index with default configuration, identified by
    /// `name`. Applications can choose unique names.
    pub fn new<S: AsRef<str>>(name: S) -> Box<CfAvl<K, V>> {
        CfAvl::with_config(name, Config::default()).unwrap()
    }

    /// Create an empty index with `config`, which is range-checked.
    pub fn with_config<S: AsRef<str>>(name: S, config: Config) -> Result<Box<CfAvl<K, V>>> {
        let config = config.resolve()?;
        let slots = (0..config.thread_num).map(|_| OpStats::default()).collect();
        Ok(Box::new(CfAvl {
            name: name.as_ref().to_string(),
            config,
            holder: Atomic::from(Node::holder()),
            n_count: AtomicIsize::new(0),
            n_nodes: AtomicIsize::new(0),
            slots,
        }))
    }

    /// Register a cheap per-thread handle. `thread_id` must be below
    /// the configured `thread_num`, it picks the statistics slot.
    pub fn to_handle(&self, thread_id: usize) -> Result<CfAvlHandle<K, V>> {
        match self.slots.get(thread_id) {
            Some(slot) => Ok(CfAvlHandle { index: self, slot }),
            None => Err(Error::InvalidThreadId(thread_id, self.slots.len())),
        }
    }
}

/// Maintenance API.
impl<K, V> CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Identify this index. Applications can choose unique names while
    /// creating CfAvl indices.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Return the resolved configuration this index runs with.
    pub fn to_config(&self) -> Config {
        self.config.clone()
    }

    /// Return number of live entries, weakly consistent while writers
    /// are active.
    #[inline]
    pub fn len(&self) -> usize {
        cmp::max(self.n_count.load(Relaxed), 0) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return quickly with basic statistics.
    pub fn to_stats(&self) -> Stats {
        Stats::new_partial(
            &self.name,
            self.len(),
            cmp::max(self.n_nodes.load(Relaxed), 0) as usize,
            mem::size_of::<Node<K, V>>(),
            sum_slots(&self.slots),
        )
    }

    /// Approximate live heap footprint in bytes, node storage plus
    /// value storage.
    pub fn footprint(&self) -> isize {
        let nodes = self.n_nodes.load(Relaxed);
        let entries = self.n_count.load(Relaxed);
        nodes * (mem::size_of::<Node<K, V>>() as isize) + entries * (mem::size_of::<V>() as isize)
    }

    /// Drop every entry. Must be called in quiescence, which the
    /// exclusive borrow enforces; in-progress operations on other
    /// threads would be undefined behaviour and cannot compile.
    pub fn clear(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let holder = self.holder.load(Relaxed, guard);
        let href = unsafe { holder.deref() };
        let root = href.right.load(Relaxed, guard);
        self.free_subtree(root, guard);
        href.right.store(Shared::<Node<K, V>>::null(), Relaxed);
        self.n_count.store(0, Relaxed);
        self.n_nodes.store(0, Relaxed);
    }

    /// Weakly-consistent ascending iterator over live entries.
    pub fn iter(&self) -> Iter<K, V> {
        Iter {
            index: self,
            last: None,
        }
    }
}

/// CRUD operations on CfAvl index.
impl<K, V> CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Get a clone of the value for `key`, if a live entry exists.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.do_get(key, &self.slots[0])
    }

    /// Insert `{key, value}` only if no live entry exists for `key`,
    /// otherwise return a clone of the existing value. A tombstone
    /// node for `key` is revived in place.
    pub fn set_if_absent(&self, key: K, value: V) -> Option<V> {
        self.do_set_if_absent(key, value, &self.slots[0])
    }

    /// Logically delete the entry for `key` and return its value. The
    /// routing node is unlinked by the maintenance walk once it has at
    /// most one child.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.do_remove(key, &self.slots[0])
    }

    fn do_get<Q>(&self, key: &Q, slot: &OpStats) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        slot.mark(&slot.gets);
        let path = self.search(key, &guard);
        slot.mark_n(&slot.traversed, path.depth as u64);
        if path.node.is_null() {
            slot.mark(&slot.not_founds);
            return None;
        }
        let value = unsafe { path.node.deref() }.value.load(Acquire, &guard);
        if value.is_null() {
            slot.mark(&slot.not_founds);
            None
        } else {
            slot.mark(&slot.founds);
            Some(unsafe { value.deref() }.clone())
        }
    }

    fn do_set_if_absent(&self, key: K, value: V, slot: &OpStats) -> Option<V> {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        let mut key = Some(key);
        let mut value = Some(Owned::new(value));
        loop {
            let path = self.search(key.as_ref().unwrap(), &guard);
            slot.mark_n(&slot.traversed, path.depth as u64);
            if path.node.is_null() {
                match self.try_insert(path.parent, path.dir, &mut key, &mut value, slot, &guard) {
                    Some(node) => {
                        slot.mark(&slot.not_founds);
                        let parent = unsafe { node.deref() }.parent.load(Acquire, &guard);
                        self.repair(parent, slot, &guard);
                        return None;
                    }
                    None => continue,
                }
            }
            match self.try_revive(path.node, &mut value, &guard) {
                Upsert::Present(old) => {
                    slot.mark(&slot.founds);
                    return Some(old);
                }
                Upsert::Revived => {
                    slot.mark(&slot.not_founds);
                    return None;
                }
                Upsert::Stale => continue,
            }
        }
    }

    fn do_remove<Q>(&self, key: &Q, slot: &OpStats) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        loop {
            let path = self.search(key, &guard);
            slot.mark_n(&slot.traversed, path.depth as u64);
            if path.node.is_null() {
                slot.mark(&slot.not_founds);
                return None;
            }
            match self.try_delete(path.node, &guard) {
                Unset::Missing => {
                    slot.mark(&slot.not_founds);
                    return None;
                }
                Unset::Done(old) => {
                    slot.mark(&slot.founds);
                    self.repair(path.node, slot, &guard);
                    return Some(old);
                }
                Unset::Stale => continue,
            }
        }
    }
}

/// Rebalance machine.
impl<K, V> CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Climb from `start` toward the root, fixing what the snapshot
    /// shows broken at each node: unlink a drained routing node,
    /// rotate on a skew of two or more, refresh a stale height, stop
    /// once nothing is owed.
    ///
    /// Decisions come from unlocked snapshots; the locked section of
    /// each fix re-validates and a stale decision leaves the node as
    /// damaged, to be re-examined on the next turn of the loop. Every
    /// failed fix implies the tree moved on under us, so the loop
    /// never spins on unchanged state.
    fn repair<'g>(&self, start: Shared<'g, Node<K, V>>, slot: &OpStats, guard: &'g Guard) {
        let holder = self.holder.load(Relaxed, guard);
        let mut node = start;
        while !node.is_null() && node != holder {
            let nref = unsafe { node.deref() };
            if nref.removed.load(Acquire) {
                node = nref.parent.load(Acquire, guard);
                continue;
            }
            let left = nref.left.load(Acquire, guard);
            let right = nref.right.load(Acquire, guard);
            let (lh, rh) = (height_of(left), height_of(right));
            let balance = lh - rh;
            let want = 1 + cmp::max(lh, rh);
            let tombstone = nref.value.load(Acquire, guard).is_null();

            if tombstone && (left.is_null() || right.is_null()) {
                let parent = nref.parent.load(Acquire, guard);
                if parent.is_null() {
                    break;
                }
                if self.try_unlink(parent, node, None, slot, guard) {
                    node = parent;
                }
                continue;
            }
            if balance.abs() > 1 {
                let rise = if balance > 0 { Dir::Left } else { Dir::Right };
                let c = if balance > 0 { left } else { right };
                let cref = unsafe { c.deref() };
                let inner_h = height_of(cref.child(rise.flip()).load(Acquire, guard));
                let outer_h = height_of(cref.child(rise).load(Acquire, guard));
                if inner_h > outer_h {
                    // first half of the double rotation, align the
                    // taller grandchild outward.
                    let _ = self.rotate(node, c, rise.flip(), None, slot, guard);
                    continue;
                }
                let parent = nref.parent.load(Acquire, guard);
                if parent.is_null() {
                    break;
                }
                match self.rotate(parent, node, rise, None, slot, guard) {
                    Spliced::Done(risen) => node = risen,
                    Spliced::Stale | Spliced::Busy => (),
                }
                continue;
            }
            if nref.height.load(Relaxed) != want {
                {
                    let _nl = nref.lock.lock();
                    if nref.removed.load(Relaxed) {
                        continue;
                    }
                    let lh = height_of(nref.left.load(Acquire, guard));
                    let rh = height_of(nref.right.load(Acquire, guard));
                    let want = 1 + cmp::max(lh, rh);
                    if nref.height.load(Relaxed) != want {
                        nref.height.store(want, Relaxed);
                    }
                }
                node = nref.parent.load(Acquire, guard);
                continue;
            }
            break;
        }
    }
}

/// Deep walk validation of CfAvl index. Assumes quiescence.
impl<K, V> CfAvl<K, V>
where
    K: Clone + Ord + Debug,
    V: Clone,
{
    /// Validate the tree with following rules:
    ///
    /// * Strict BST order between every node and its subtrees.
    /// * Every reachable node's parent back-reference agrees with the
    ///   tree edge, and no unlinked node is reachable.
    /// * Stored heights equal computed heights.
    ///
    /// Additionally return full statistics on the tree, including the
    /// leaf [`Depth`] histogram.
    pub fn validate(&self) -> Result<Stats> {
        let guard = epoch::pin();
        let holder = self.holder.load(Relaxed, &guard);
        let root = unsafe { holder.deref() }.right.load(Acquire, &guard);
        let mut depths: Depth = Default::default();
        let (mut entries, mut routing) = (0, 0);
        self.validate_tree(
            root,
            holder,
            None,
            None,
            true,
            0,
            &mut depths,
            &mut entries,
            &mut routing,
            &guard,
        )?;
        Ok(Stats::new_full(
            &self.name,
            entries,
            routing,
            cmp::max(self.n_nodes.load(Relaxed), 0) as usize,
            mem::size_of::<Node<K, V>>(),
            sum_slots(&self.slots),
            depths,
        ))
    }
}

/// Per-thread handle into [CfAvl] index.
pub struct CfAvlHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a CfAvl<K, V>,
    slot: &'a OpStats,
}

impl<'a, K, V> CfAvlHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// This thread's statistics slot.
    pub fn to_op_stats(&self) -> &OpStats {
        self.slot
    }
}

impl<'a, K, V> Reader<K, V> for CfAvlHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.index.do_get(key, self.slot)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(self.index.iter())
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

impl<'a, K, V> Writer<K, V> for CfAvlHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        self.index.do_set_if_absent(key, value, self.slot)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.index.do_remove(key, self.slot)
    }
}

impl<K, V> Reader<K, V> for CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        CfAvl::get(self, key)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(CfAvl::iter(self))
    }

    fn len(&self) -> usize {
        CfAvl::len(self)
    }
}

impl<K, V> Writer<K, V> for CfAvl<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        CfAvl::set_if_absent(self, key, value)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        CfAvl::remove(self, key)
    }
}

#[cfg(test)]
#[path = "cfavl_test.rs"]
mod cfavl_test;
