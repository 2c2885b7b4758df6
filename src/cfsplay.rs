//! Module ``cfsplay`` export [CfSplay] type, a concurrent ordered map
//! over a contention-friendly splay tree.
//!
//! [CfSplay] shares the node model, the locking discipline and the
//! logical-delete/physical-unlink split with
//! [CfAvl][crate::cfavl::CfAvl]. What differs is self-adjustment: no
//! heights are kept and there is no balance predicate. Instead, an
//! operation that touched a node may probabilistically splay it toward
//! the root with zig, zig-zig and zig-zag rotations, so that hot keys
//! drift to shallow positions under skewed workloads.
//!
//! Splaying is best effort. Locks along the ancestor chain are taken
//! with a bounded try-lock and the whole invocation carries a conflict
//! budget; on exhaustion the splay simply stops, leaving a correct
//! tree. The decision gate weighs the access frequency of the node
//! (per-node counter) against the calling thread's total accesses, so
//! rarely-touched nodes deep in the tree are the ones moved first.

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
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    config::Config,
    core::{IndexIter, Reader, Result, Writer},
    depth::Depth,
    error::Error,
    node::{height_of, spin_lock, Dir, Node},
    stats::{sum_slots, OpStats, Stats},
};

use self::CfSplay as Tree;

include!("cf_common.rs");

// mixing constant for the per-operation seed stream.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

enum Step {
    /// The accessed node rose this many levels, possibly zero when a
    /// rotation lost its validation race.
    Rose(usize),
    /// Terminal for this invocation, root reached or state moved away.
    Stuck,
}

/// Concurrent ordered map over a contention-friendly splay tree.
///
/// Register one handle per thread with [CfSplay::to_handle]; handles
/// own the thread's random source feeding the splay-probability gate.
pub struct CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    name: String,
    config: Config,
    holder: Atomic<Node<K, V>>,
    n_count: AtomicIsize,
    n_nodes: AtomicIsize,
    seed: AtomicU64,
    slots: Vec<OpStats>,
}

impl<K, V> Drop for CfSplay<K, V>
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

/// Different ways to construct a CfSplay index.
impl<K, V> CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Create an empty index with default configuration, identified by
    /// `name`.
    pub fn new<S: AsRef<str>>(name: S) -> Box<CfSplay<K, V>> {
        CfSplay::with_config(name, Config::default()).unwrap()
    }

    /// Create an empty index with `config`, which is range-checked.
    /// The splay probability works out to
    /// `1 / (inv_splay_prob * thread_num)`.
    pub fn with_config<S: AsRef<str>>(name: S, config: Config) -> Result<Box<CfSplay<K, V>>> {
        let config = config.resolve()?;
        let slots = (0..config.thread_num).map(|_| OpStats::default()).collect();
        Ok(Box::new(CfSplay {
            name: name.as_ref().to_string(),
            config,
            holder: Atomic::from(Node::holder()),
            n_count: AtomicIsize::new(0),
            n_nodes: AtomicIsize::new(0),
            seed: AtomicU64::new(SEED_STRIDE),
            slots,
        }))
    }

    /// Register a cheap per-thread handle carrying the thread's
    /// statistics slot and its independent random source.
    pub fn to_handle(&self, thread_id: usize) -> Result<CfSplayHandle<K, V>> {
        match self.slots.get(thread_id) {
            Some(slot) => Ok(CfSplayHandle {
                index: self,
                slot,
                rng: self.op_rng(),
            }),
            None => Err(Error::InvalidThreadId(thread_id, self.slots.len())),
        }
    }

    fn op_rng(&self) -> SmallRng {
        SmallRng::seed_from_u64(self.seed.fetch_add(SEED_STRIDE, Relaxed))
    }
}

/// Maintenance API.
impl<K, V> CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Identify this index.
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

    /// Approximate live heap footprint in bytes.
    pub fn footprint(&self) -> isize {
        let nodes = self.n_nodes.load(Relaxed);
        let entries = self.n_count.load(Relaxed);
        nodes * (mem::size_of::<Node<K, V>>() as isize) + entries * (mem::size_of::<V>() as isize)
    }

    /// Drop every entry. Must be called in quiescence, which the
    /// exclusive borrow enforces.
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

/// CRUD operations on CfSplay index.
impl<K, V> CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Get a clone of the value for `key`, if a live entry exists.
    /// The matched node may be splayed toward the root.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.do_get(key, &self.slots[0], &mut self.op_rng())
    }

    /// Insert `{key, value}` only if no live entry exists for `key`,
    /// otherwise return a clone of the existing value.
    pub fn set_if_absent(&self, key: K, value: V) -> Option<V> {
        self.do_set_if_absent(key, value, &self.slots[0], &mut self.op_rng())
    }

    /// Logically delete the entry for `key` and return its value,
    /// opportunistically unlinking the routing node right away when
    /// its preconditions already hold.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.do_remove(key, &self.slots[0], &mut self.op_rng())
    }

    fn do_get<Q>(&self, key: &Q, slot: &OpStats, rng: &mut SmallRng) -> Option<V>
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
        let nref = unsafe { path.node.deref() };
        nref.counter.fetch_add(1, Relaxed);
        let value = nref.value.load(Acquire, &guard);
        let out = if value.is_null() {
            slot.mark(&slot.not_founds);
            None
        } else {
            slot.mark(&slot.founds);
            Some(unsafe { value.deref() }.clone())
        };
        self.maybe_splay(path.node, path.depth, slot, rng, &guard);
        out
    }

    fn do_set_if_absent(&self, key: K, value: V, slot: &OpStats, rng: &mut SmallRng) -> Option<V> {
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
                        self.maybe_splay(node, path.depth + 1, slot, rng, &guard);
                        return None;
                    }
                    None => continue,
                }
            }
            let nref = unsafe { path.node.deref() };
            nref.counter.fetch_add(1, Relaxed);
            match self.try_revive(path.node, &mut value, &guard) {
                Upsert::Present(old) => {
                    slot.mark(&slot.founds);
                    self.maybe_splay(path.node, path.depth, slot, rng, &guard);
                    return Some(old);
                }
                Upsert::Revived => {
                    slot.mark(&slot.not_founds);
                    self.maybe_splay(path.node, path.depth, slot, rng, &guard);
                    return None;
                }
                Upsert::Stale => continue,
            }
        }
    }

    fn do_remove<Q>(&self, key: &Q, slot: &OpStats, rng: &mut SmallRng) -> Option<V>
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
            let nref = unsafe { path.node.deref() };
            nref.counter.fetch_add(1, Relaxed);
            match self.try_delete(path.node, &guard) {
                Unset::Missing => {
                    slot.mark(&slot.not_founds);
                    return None;
                }
                Unset::Done(old) => {
                    slot.mark(&slot.founds);
                    let parent = nref.parent.load(Acquire, &guard);
                    let unlinked = !parent.is_null()
                        && self.try_unlink(
                            parent,
                            path.node,
                            Some(self.config.spin_count),
                            slot,
                            &guard,
                        );
                    if unlinked {
                        self.drain_routing(parent, slot, &guard);
                    } else {
                        // keep the routing node splayable, it still
                        // serves searches until a later pass drains it.
                        self.maybe_splay(path.node, path.depth, slot, rng, &guard);
                    }
                    return Some(old);
                }
                Unset::Stale => continue,
            }
        }
    }
}

/// Splay machine.
impl<K, V> CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// After an unlink, climb while the parent chain consists of
    /// drained tombstones with at most one child. Best effort, any
    /// contention ends the climb.
    fn drain_routing<'g>(&self, start: Shared<'g, Node<K, V>>, slot: &OpStats, guard: &'g Guard) {
        let holder = self.holder.load(Relaxed, guard);
        let mut node = start;
        while !node.is_null() && node != holder {
            let nref = unsafe { node.deref() };
            if nref.removed.load(Acquire) {
                node = nref.parent.load(Acquire, guard);
                continue;
            }
            if !nref.value.load(Acquire, guard).is_null() {
                break;
            }
            let left = nref.left.load(Acquire, guard);
            let right = nref.right.load(Acquire, guard);
            if !left.is_null() && !right.is_null() {
                break;
            }
            let parent = nref.parent.load(Acquire, guard);
            if parent.is_null() {
                break;
            }
            if self.try_unlink(parent, node, Some(self.config.spin_count), slot, guard) {
                node = parent;
            } else {
                break;
            }
        }
    }

    /// Probabilistic splay of `node`, last seen at `depth`.
    ///
    /// The frequency gate computes `m = floor(ln(thread_accesses /
    /// node_accesses))` and enters only when `depth > k1 * m` with
    /// `depth > max_depth`; iteration continues while `depth > k2 * m`,
    /// `depth > max_depth + 1` and the conflict budget holds out.
    fn maybe_splay<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        depth: usize,
        slot: &OpStats,
        rng: &mut SmallRng,
        guard: &'g Guard,
    ) {
        let config = &self.config;
        let gate = cmp::max(config.inv_splay_prob.saturating_mul(config.thread_num), 1);
        if rng.gen_range(0..gate as u64) != 0 {
            return;
        }
        let nref = unsafe { node.deref() };
        let thread_total = cmp::max(slot.accesses.load(Relaxed), 1);
        let node_count = cmp::max(nref.counter.load(Relaxed), 1);
        let ratio = thread_total as f64 / node_count as f64;
        let m = if ratio <= 1.0 { 0.0 } else { ratio.ln().floor() };
        if (depth as f64) <= config.k1 * m || depth <= config.max_depth {
            return;
        }
        let mut conflicts = 0_u32;
        let mut cur_depth = depth;
        while (cur_depth as f64) > config.k2 * m
            && cur_depth > config.max_depth + 1
            && conflicts < config.conflicts
        {
            if nref.removed.load(Acquire) {
                break;
            }
            match self.splay_step(node, slot, &mut conflicts, guard) {
                Step::Rose(levels) => cur_depth = cur_depth.saturating_sub(levels),
                Step::Stuck => break,
            }
        }
        trace!(
            "{}: splay stopped at depth {} with {} conflicts",
            self.name,
            cur_depth,
            conflicts
        );
    }

    /// One zig / zig-zig / zig-zag step raising `x`, or an
    /// opportunistic unlink of a drained routing parent on its path.
    /// Failed lock or validation attempts are charged to `conflicts`;
    /// any rotation that begins is completed before its locks drop.
    fn splay_step<'g>(
        &self,
        x: Shared<'g, Node<K, V>>,
        slot: &OpStats,
        conflicts: &mut u32,
        guard: &'g Guard,
    ) -> Step {
        let spin = Some(self.config.spin_count);
        let holder = self.holder.load(Relaxed, guard);
        let xr = unsafe { x.deref() };

        let p = xr.parent.load(Acquire, guard);
        if p.is_null() || p == holder {
            return Step::Stuck;
        }
        let pr = unsafe { p.deref() };
        let g = pr.parent.load(Acquire, guard);
        if g.is_null() {
            return Step::Stuck;
        }

        // piggyback garbage collection on the hot path: a drained
        // routing parent is cheaper to drop than to rotate around.
        if pr.value.load(Acquire, guard).is_null()
            && (pr.left.load(Acquire, guard).is_null() || pr.right.load(Acquire, guard).is_null())
        {
            if self.try_unlink(g, p, spin, slot, guard) {
                return Step::Rose(1);
            }
            *conflicts += 1;
            return Step::Rose(0);
        }

        let dir_x = if pr.left.load(Acquire, guard) == x {
            Dir::Left
        } else if pr.right.load(Acquire, guard) == x {
            Dir::Right
        } else {
            return Step::Stuck;
        };

        if g == holder {
            // zig, the parent is the root.
            return match self.rotate(g, p, dir_x, spin, slot, guard) {
                Spliced::Done(_) => Step::Rose(1),
                Spliced::Busy | Spliced::Stale => {
                    *conflicts += 1;
                    Step::Rose(0)
                }
            };
        }

        let gr = unsafe { g.deref() };
        let dir_p = if gr.left.load(Acquire, guard) == p {
            Dir::Left
        } else if gr.right.load(Acquire, guard) == p {
            Dir::Right
        } else {
            *conflicts += 1;
            return Step::Rose(0);
        };
        let gg = gr.parent.load(Acquire, guard);
        if gg.is_null() {
            return Step::Stuck;
        }

        if dir_x == dir_p {
            // zig-zig, rotate the grandparent first, then the parent.
            match self.rotate(gg, g, dir_p, spin, slot, guard) {
                Spliced::Done(_) => (),
                Spliced::Busy | Spliced::Stale => {
                    *conflicts += 1;
                    return Step::Rose(0);
                }
            }
            match self.rotate(gg, p, dir_x, spin, slot, guard) {
                Spliced::Done(_) => Step::Rose(2),
                Spliced::Busy | Spliced::Stale => {
                    *conflicts += 1;
                    Step::Rose(1)
                }
            }
        } else {
            // zig-zag, raise x over the parent, then over the old
            // grandparent.
            match self.rotate(g, p, dir_x, spin, slot, guard) {
                Spliced::Done(_) => (),
                Spliced::Busy | Spliced::Stale => {
                    *conflicts += 1;
                    return Step::Rose(0);
                }
            }
            match self.rotate(gg, g, dir_p, spin, slot, guard) {
                Spliced::Done(_) => Step::Rose(2),
                Spliced::Busy | Spliced::Stale => {
                    *conflicts += 1;
                    Step::Rose(1)
                }
            }
        }
    }
}

/// Deep walk validation of CfSplay index. Assumes quiescence.
impl<K, V> CfSplay<K, V>
where
    K: Clone + Ord + Debug,
    V: Clone,
{
    /// Validate BST order, parent agreement and reachability, and
    /// return full statistics with the leaf [`Depth`] histogram. No
    /// height rule applies to the splay variant.
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
            false,
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

/// Per-thread handle into [CfSplay] index.
pub struct CfSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a CfSplay<K, V>,
    slot: &'a OpStats,
    rng: SmallRng,
}

impl<'a, K, V> CfSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// This thread's statistics slot.
    pub fn to_op_stats(&self) -> &OpStats {
        self.slot
    }
}

impl<'a, K, V> Reader<K, V> for CfSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.index.do_get(key, self.slot, &mut self.rng)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(self.index.iter())
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

impl<'a, K, V> Writer<K, V> for CfSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        self.index.do_set_if_absent(key, value, self.slot, &mut self.rng)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.index.do_remove(key, self.slot, &mut self.rng)
    }
}

impl<K, V> Reader<K, V> for CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        CfSplay::get(self, key)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(CfSplay::iter(self))
    }

    fn len(&self) -> usize {
        CfSplay::len(self)
    }
}

impl<K, V> Writer<K, V> for CfSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        CfSplay::set_if_absent(self, key, value)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        CfSplay::remove(self, key)
    }
}

#[cfg(test)]
#[path = "cfsplay_test.rs"]
mod cfsplay_test;
