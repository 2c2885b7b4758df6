//! Module ``ovlsplay`` export [OvlSplay] type, a concurrent ordered
//! map over a splay tree whose readers validate per-node change
//! counters instead of taking read locks.
//!
//! Every node carries a 64-bit version word partitioned into a
//! grow-in-progress bit, a shrink-in-progress bit, an unlinked
//! sentinel bit and two counter fields whose width is configured by
//! `ovl_bits`. A rotation moving a node's subtree downward is a
//! *shrink* and is bracketed by begin-shrink/end-shrink on that word;
//! the symmetric upward move is a *grow*. Readers descend hand over
//! hand: each link is trusted only while the word it was read under
//! has neither shrunk nor been unlinked, and a reader that observes an
//! in-progress shrink spins, yields, and finally takes the node's
//! mutex to serialize past the writer. Growth never invalidates a
//! read, a key that grew into a subtree behind a reader would already
//! have been matched higher on the reader's path.
//!
//! Unlike the contention-friendly variants, rotations here mutate the
//! nodes in place, reader safety comes from the version word rather
//! than from clone displacement. Self-adjustment is the same
//! probabilistic splaying as [CfSplay][crate::cfsplay::CfSplay].

use std::{
    borrow::Borrow,
    cmp::{self, Ordering},
    fmt::Debug,
    mem,
    sync::atomic::{
        AtomicIsize, AtomicU64,
        Ordering::{Acquire, Relaxed, Release},
    },
    thread,
};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::trace;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    config::Config,
    core::{IndexIter, Reader, Result, Writer},
    depth::Depth,
    error::Error,
    node::{spin_lock, Dir},
    stats::{sum_slots, OpStats, Stats},
};

const GROW_LOCK: u64 = 0b001;
const SHRINK_LOCK: u64 = 0b010;
const UNLINKED: u64 = 0b100;
const COUNT_SHIFT: u32 = 3;

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Field geometry of the version word, derived from `ovl_bits`.
#[derive(Clone, Copy)]
struct OvlLayout {
    shrink_unit: u64,
    grow_unit: u64,
    /// Bits a reader may ignore, the grow lock and the grow counter.
    grow_field: u64,
}

impl OvlLayout {
    fn new(bits: u32) -> OvlLayout {
        OvlLayout {
            shrink_unit: 1 << COUNT_SHIFT,
            grow_unit: 1 << (COUNT_SHIFT + bits),
            grow_field: GROW_LOCK | (u64::MAX << (COUNT_SHIFT + bits)),
        }
    }

    /// Whether the word moved in a way that can reroute a search,
    /// shrink count, shrink lock or the unlinked sentinel.
    #[inline]
    fn has_shrunk_or_unlinked(&self, orig: u64, cur: u64) -> bool {
        ((orig ^ cur) & !self.grow_field) != 0
    }
}

#[inline]
fn is_changing(ovl: u64) -> bool {
    ovl & (GROW_LOCK | SHRINK_LOCK) != 0
}

#[inline]
fn is_shrinking_or_unlinked(ovl: u64) -> bool {
    ovl & (SHRINK_LOCK | UNLINKED) != 0
}

#[inline]
fn is_unlinked(ovl: u64) -> bool {
    ovl & UNLINKED != 0
}

struct Node<K, V> {
    key: Option<K>, // None only for the root holder
    version: AtomicU64,
    value: Atomic<V>, // null encodes the tombstone
    left: Atomic<Node<K, V>>,
    right: Atomic<Node<K, V>>,
    parent: Atomic<Node<K, V>>,
    lock: Mutex<()>,
    counter: AtomicU64,
}

impl<K, V> Node<K, V> {
    fn holder() -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: None,
            version: AtomicU64::new(0),
            value: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::null(),
            lock: Mutex::new(()),
            counter: AtomicU64::new(0),
        })
    }

    fn leaf(key: K, value: Owned<V>, parent: Shared<'_, Node<K, V>>) -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: Some(key),
            version: AtomicU64::new(0),
            value: Atomic::from(value),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::from(parent),
            lock: Mutex::new(()),
            counter: AtomicU64::new(1),
        })
    }

    #[inline]
    fn child(&self, dir: Dir) -> &Atomic<Node<K, V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    #[inline]
    fn cmp_key<Q>(&self, key: &Q) -> Ordering
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match &self.key {
            None => Ordering::Less,
            Some(k) => k.borrow().cmp(key),
        }
    }

    // version brackets, caller must hold this node's lock.
    fn begin_shrink(&self) {
        let v = self.version.load(Relaxed);
        self.version.store(v | SHRINK_LOCK, Release);
    }

    fn end_shrink(&self, layout: OvlLayout) {
        let v = self.version.load(Relaxed);
        self.version
            .store((v & !SHRINK_LOCK).wrapping_add(layout.shrink_unit), Release);
    }

    fn begin_grow(&self) {
        let v = self.version.load(Relaxed);
        self.version.store(v | GROW_LOCK, Release);
    }

    fn end_grow(&self, layout: OvlLayout) {
        let v = self.version.load(Relaxed);
        self.version
            .store((v & !GROW_LOCK).wrapping_add(layout.grow_unit), Release);
    }
}

enum GetResult<'g, K, V> {
    Retry,
    Absent,
    Hit(V, Shared<'g, Node<K, V>>, usize),
}

enum PutResult<'g, K, V> {
    Retry,
    Present(V, Shared<'g, Node<K, V>>, usize),
    Installed(Shared<'g, Node<K, V>>, usize),
}

enum RmResult<'g, K, V> {
    Retry,
    Absent,
    /// Logical delete only, the node stays behind as a routing node.
    Logical(V, Shared<'g, Node<K, V>>, usize),
    /// The node was unlinked from under this parent.
    Unlinked(V, Shared<'g, Node<K, V>>),
}

enum Step {
    Rose(usize),
    Stuck,
}

/// Concurrent ordered map over an optimistically versioned splay tree.
pub struct OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    name: String,
    config: Config,
    layout: OvlLayout,
    holder: Atomic<Node<K, V>>,
    n_count: AtomicIsize,
    n_nodes: AtomicIsize,
    seed: AtomicU64,
    slots: Vec<OpStats>,
}

impl<K, V> Drop for OvlSplay<K, V>
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

/// Different ways to construct an OvlSplay index.
impl<K, V> OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Create an empty index with default configuration, identified by
    /// `name`.
    pub fn new<S: AsRef<str>>(name: S) -> Box<OvlSplay<K, V>> {
        OvlSplay::with_config(name, Config::default()).unwrap()
    }

    /// Create an empty index with `config`. `ovl_bits` fixes the
    /// counter field width inside the version word.
    pub fn with_config<S: AsRef<str>>(name: S, config: Config) -> Result<Box<OvlSplay<K, V>>> {
        let config = config.resolve()?;
        let layout = OvlLayout::new(config.ovl_bits);
        let slots = (0..config.thread_num).map(|_| OpStats::default()).collect();
        Ok(Box::new(OvlSplay {
            name: name.as_ref().to_string(),
            config,
            layout,
            holder: Atomic::from(Node::holder()),
            n_count: AtomicIsize::new(0),
            n_nodes: AtomicIsize::new(0),
            seed: AtomicU64::new(SEED_STRIDE),
            slots,
        }))
    }

    /// Register a cheap per-thread handle.
    pub fn to_handle(&self, thread_id: usize) -> Result<OvlSplayHandle<K, V>> {
        match self.slots.get(thread_id) {
            Some(slot) => Ok(OvlSplayHandle {
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
impl<K, V> OvlSplay<K, V>
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

    fn free_subtree(&self, node: Shared<Node<K, V>>, guard: &Guard) {
        if node.is_null() {
            return;
        }
        let nref = unsafe { node.deref() };
        self.free_subtree(nref.left.load(Relaxed, guard), guard);
        self.free_subtree(nref.right.load(Relaxed, guard), guard);
        let value = nref.value.load(Relaxed, guard);
        unsafe {
            if !value.is_null() {
                drop(value.into_owned());
            }
            drop(node.into_owned());
        }
    }

    /// Spin, then yield, then fall back to the node's mutex, which is
    /// guaranteed to wait out any in-progress change.
    fn wait_until_not_changing(&self, node: &Node<K, V>) {
        let mut ovl = node.version.load(Acquire);
        if !is_changing(ovl) {
            return;
        }
        for _ in 0..self.config.spin_count {
            std::hint::spin_loop();
            ovl = node.version.load(Acquire);
            if !is_changing(ovl) {
                return;
            }
        }
        for _ in 0..self.config.yield_count {
            thread::yield_now();
            ovl = node.version.load(Acquire);
            if !is_changing(ovl) {
                return;
            }
        }
        drop(node.lock.lock());
    }
}

/// CRUD operations on OvlSplay index.
impl<K, V> OvlSplay<K, V>
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
        self.do_get(key, &self.slots[0], &mut self.op_rng())
    }

    /// Insert `{key, value}` only if no live entry exists for `key`,
    /// otherwise return a clone of the existing value.
    pub fn set_if_absent(&self, key: K, value: V) -> Option<V> {
        self.do_set_if_absent(key, value, &self.slots[0], &mut self.op_rng())
    }

    /// Logically delete the entry for `key` and return its value. A
    /// node with fewer than two children is unlinked on the spot, a
    /// fuller one stays behind as a routing node.
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
        let holder = self.holder.load(Relaxed, &guard);
        let href = unsafe { holder.deref() };
        loop {
            let root = href.right.load(Acquire, &guard);
            if root.is_null() {
                slot.mark(&slot.not_founds);
                return None;
            }
            let root_ref = unsafe { root.deref() };
            let ovl = root_ref.version.load(Acquire);
            if is_shrinking_or_unlinked(ovl) {
                self.wait_until_not_changing(root_ref);
                continue;
            }
            if href.right.load(Acquire, &guard) != root {
                continue;
            }
            match self.attempt_get(key, root, ovl, 1, slot, &guard) {
                GetResult::Retry => continue,
                GetResult::Absent => {
                    slot.mark(&slot.not_founds);
                    return None;
                }
                GetResult::Hit(value, node, depth) => {
                    slot.mark(&slot.founds);
                    unsafe { node.deref() }.counter.fetch_add(1, Relaxed);
                    self.maybe_splay(node, depth, slot, rng, &guard);
                    return Some(value);
                }
            }
        }
    }

    /// Hand-over-hand validated descent. `node_ovl` is the version
    /// under which the link into `node` was read; any shrink of `node`
    /// since then bubbles a retry up to the caller, who revalidates its
    /// own word before re-reading the link.
    fn attempt_get<'g, Q>(
        &self,
        key: &Q,
        node: Shared<'g, Node<K, V>>,
        node_ovl: u64,
        depth: usize,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> GetResult<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let nref = unsafe { node.deref() };
        slot.mark(&slot.traversed);
        loop {
            let dir = match nref.cmp_key(key) {
                Ordering::Equal => {
                    let value = nref.value.load(Acquire, guard);
                    if self
                        .layout
                        .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                    {
                        return GetResult::Retry;
                    }
                    return if value.is_null() {
                        GetResult::Absent
                    } else {
                        GetResult::Hit(unsafe { value.deref() }.clone(), node, depth)
                    };
                }
                Ordering::Less => Dir::Right,
                Ordering::Greater => Dir::Left,
            };
            let child = nref.child(dir).load(Acquire, guard);
            if self
                .layout
                .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
            {
                return GetResult::Retry;
            }
            if child.is_null() {
                return GetResult::Absent;
            }
            let cref = unsafe { child.deref() };
            let child_ovl = cref.version.load(Acquire);
            if is_shrinking_or_unlinked(child_ovl) {
                self.wait_until_not_changing(cref);
                if self
                    .layout
                    .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                {
                    return GetResult::Retry;
                }
                continue;
            }
            if child != nref.child(dir).load(Acquire, guard) {
                continue;
            }
            match self.attempt_get(key, child, child_ovl, depth + 1, slot, guard) {
                GetResult::Retry => {
                    if self
                        .layout
                        .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                    {
                        return GetResult::Retry;
                    }
                    continue;
                }
                done => return done,
            }
        }
    }

    fn do_set_if_absent(&self, key: K, value: V, slot: &OpStats, rng: &mut SmallRng) -> Option<V> {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        let holder = self.holder.load(Relaxed, &guard);
        let href = unsafe { holder.deref() };
        let mut key = Some(key);
        let mut value = Some(Owned::new(value));
        loop {
            let root = href.right.load(Acquire, &guard);
            if root.is_null() {
                let _hl = href.lock.lock();
                if !href.right.load(Acquire, &guard).is_null() {
                    continue;
                }
                let fresh = Node::leaf(key.take().unwrap(), value.take().unwrap(), holder);
                href.right.store(fresh, Release);
                self.n_count.fetch_add(1, Relaxed);
                self.n_nodes.fetch_add(1, Relaxed);
                slot.mark(&slot.structural);
                slot.mark(&slot.not_founds);
                return None;
            }
            let root_ref = unsafe { root.deref() };
            let ovl = root_ref.version.load(Acquire);
            if is_shrinking_or_unlinked(ovl) {
                self.wait_until_not_changing(root_ref);
                continue;
            }
            if href.right.load(Acquire, &guard) != root {
                continue;
            }
            match self.attempt_put(&mut key, &mut value, root, ovl, 1, slot, &guard) {
                PutResult::Retry => continue,
                PutResult::Present(old, node, depth) => {
                    slot.mark(&slot.founds);
                    unsafe { node.deref() }.counter.fetch_add(1, Relaxed);
                    self.maybe_splay(node, depth, slot, rng, &guard);
                    return Some(old);
                }
                PutResult::Installed(node, depth) => {
                    slot.mark(&slot.not_founds);
                    self.maybe_splay(node, depth, slot, rng, &guard);
                    return None;
                }
            }
        }
    }

    fn attempt_put<'g>(
        &self,
        key: &mut Option<K>,
        value: &mut Option<Owned<V>>,
        node: Shared<'g, Node<K, V>>,
        node_ovl: u64,
        depth: usize,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> PutResult<'g, K, V> {
        let nref = unsafe { node.deref() };
        slot.mark(&slot.traversed);
        loop {
            let dir = match nref.cmp_key(key.as_ref().unwrap()) {
                Ordering::Equal => {
                    let _nl = nref.lock.lock();
                    if is_unlinked(nref.version.load(Relaxed)) {
                        return PutResult::Retry;
                    }
                    let cur = nref.value.load(Acquire, guard);
                    if !cur.is_null() {
                        let old = unsafe { cur.deref() }.clone();
                        return PutResult::Present(old, node, depth);
                    }
                    nref.value.store(value.take().unwrap(), Release);
                    self.n_count.fetch_add(1, Relaxed);
                    return PutResult::Installed(node, depth);
                }
                Ordering::Less => Dir::Right,
                Ordering::Greater => Dir::Left,
            };
            let child = nref.child(dir).load(Acquire, guard);
            if self
                .layout
                .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
            {
                return PutResult::Retry;
            }
            if child.is_null() {
                // attach here, provided the word did not move since
                // the descent decided this is the spot.
                let _nl = nref.lock.lock();
                if self
                    .layout
                    .has_shrunk_or_unlinked(node_ovl, nref.version.load(Relaxed))
                {
                    return PutResult::Retry;
                }
                if !nref.child(dir).load(Acquire, guard).is_null() {
                    continue;
                }
                let fresh = Node::leaf(key.take().unwrap(), value.take().unwrap(), node);
                let fresh = fresh.into_shared(guard);
                nref.child(dir).store(fresh, Release);
                self.n_count.fetch_add(1, Relaxed);
                self.n_nodes.fetch_add(1, Relaxed);
                slot.mark(&slot.structural);
                return PutResult::Installed(fresh, depth + 1);
            }
            let cref = unsafe { child.deref() };
            let child_ovl = cref.version.load(Acquire);
            if is_shrinking_or_unlinked(child_ovl) {
                self.wait_until_not_changing(cref);
                if self
                    .layout
                    .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                {
                    return PutResult::Retry;
                }
                continue;
            }
            if child != nref.child(dir).load(Acquire, guard) {
                continue;
            }
            match self.attempt_put(key, value, child, child_ovl, depth + 1, slot, guard) {
                PutResult::Retry => {
                    if self
                        .layout
                        .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                    {
                        return PutResult::Retry;
                    }
                    continue;
                }
                done => return done,
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
        let holder = self.holder.load(Relaxed, &guard);
        let href = unsafe { holder.deref() };
        loop {
            let root = href.right.load(Acquire, &guard);
            if root.is_null() {
                slot.mark(&slot.not_founds);
                return None;
            }
            let root_ref = unsafe { root.deref() };
            let ovl = root_ref.version.load(Acquire);
            if is_shrinking_or_unlinked(ovl) {
                self.wait_until_not_changing(root_ref);
                continue;
            }
            if href.right.load(Acquire, &guard) != root {
                continue;
            }
            match self.attempt_remove(key, holder, root, ovl, 1, slot, &guard) {
                RmResult::Retry => continue,
                RmResult::Absent => {
                    slot.mark(&slot.not_founds);
                    return None;
                }
                RmResult::Logical(old, node, depth) => {
                    slot.mark(&slot.founds);
                    unsafe { node.deref() }.counter.fetch_add(1, Relaxed);
                    self.maybe_splay(node, depth, slot, rng, &guard);
                    return Some(old);
                }
                RmResult::Unlinked(old, parent) => {
                    slot.mark(&slot.founds);
                    self.drain_routing(parent, slot, &guard);
                    return Some(old);
                }
            }
        }
    }

    fn attempt_remove<'g, Q>(
        &self,
        key: &Q,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        node_ovl: u64,
        depth: usize,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> RmResult<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let nref = unsafe { node.deref() };
        slot.mark(&slot.traversed);
        loop {
            let dir = match nref.cmp_key(key) {
                Ordering::Equal => {
                    let two_children = !nref.left.load(Acquire, guard).is_null()
                        && !nref.right.load(Acquire, guard).is_null();
                    if two_children {
                        // logical delete only, the node stays behind
                        // as a routing node.
                        let _nl = nref.lock.lock();
                        if is_unlinked(nref.version.load(Relaxed)) {
                            return RmResult::Retry;
                        }
                        let cur = nref.value.load(Acquire, guard);
                        if cur.is_null() {
                            return RmResult::Absent;
                        }
                        let old = unsafe { cur.deref() }.clone();
                        nref.value.store(Shared::<V>::null(), Release);
                        unsafe { guard.defer_destroy(cur) };
                        self.n_count.fetch_sub(1, Relaxed);
                        return RmResult::Logical(old, node, depth);
                    }
                    match self.attempt_unlink(parent, node, true, slot, guard) {
                        Unlink::Done(Some(old)) => {
                            return RmResult::Unlinked(old, parent);
                        }
                        Unlink::Done(None) => return RmResult::Absent,
                        Unlink::Stale => return RmResult::Retry,
                    }
                }
                Ordering::Less => Dir::Right,
                Ordering::Greater => Dir::Left,
            };
            let child = nref.child(dir).load(Acquire, guard);
            if self
                .layout
                .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
            {
                return RmResult::Retry;
            }
            if child.is_null() {
                return RmResult::Absent;
            }
            let cref = unsafe { child.deref() };
            let child_ovl = cref.version.load(Acquire);
            if is_shrinking_or_unlinked(child_ovl) {
                self.wait_until_not_changing(cref);
                if self
                    .layout
                    .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                {
                    return RmResult::Retry;
                }
                continue;
            }
            if child != nref.child(dir).load(Acquire, guard) {
                continue;
            }
            match self.attempt_remove(key, node, child, child_ovl, depth + 1, slot, guard) {
                RmResult::Retry => {
                    if self
                        .layout
                        .has_shrunk_or_unlinked(node_ovl, nref.version.load(Acquire))
                    {
                        return RmResult::Retry;
                    }
                    continue;
                }
                done => return done,
            }
        }
    }
}

enum Unlink<V> {
    /// Unlinked; carries the removed value when the node was live and
    /// `take_value` was requested.
    Done(Option<V>),
    Stale,
}

/// Structural maintenance, locks taken parent before node so the
/// ordering agrees with the rotation paths.
impl<K, V> OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Splice `node` out from under `parent`. Requires at most one
    /// child. With `take_value` the live value is removed and returned
    /// (the remove fast path); without it only drained routing nodes
    /// qualify (the splay piggyback).
    fn attempt_unlink<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        take_value: bool,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> Unlink<V> {
        let pref = unsafe { parent.deref() };
        let nref = unsafe { node.deref() };
        let _pl = pref.lock.lock();
        if is_unlinked(pref.version.load(Relaxed)) {
            return Unlink::Stale;
        }
        if nref.parent.load(Acquire, guard) != parent {
            return Unlink::Stale;
        }
        let dir = if pref.left.load(Relaxed, guard) == node {
            Dir::Left
        } else if pref.right.load(Relaxed, guard) == node {
            Dir::Right
        } else {
            return Unlink::Stale;
        };
        let _nl = nref.lock.lock();
        let left = nref.left.load(Acquire, guard);
        let right = nref.right.load(Acquire, guard);
        if !left.is_null() && !right.is_null() {
            return Unlink::Stale;
        }
        let cur = nref.value.load(Acquire, guard);
        let old = if take_value {
            if cur.is_null() {
                return Unlink::Done(None);
            }
            Some(unsafe { cur.deref() }.clone())
        } else {
            if !cur.is_null() {
                return Unlink::Stale; // revived under us
            }
            None
        };
        let child = if left.is_null() { right } else { left };
        if !child.is_null() {
            unsafe { child.deref() }.parent.store(parent, Release);
        }
        pref.child(dir).store(child, Release);
        nref.version.store(UNLINKED, Release);
        if !cur.is_null() {
            nref.value.store(Shared::<V>::null(), Release);
            unsafe { guard.defer_destroy(cur) };
            self.n_count.fetch_sub(1, Relaxed);
        }
        unsafe { guard.defer_destroy(node) };
        self.n_nodes.fetch_sub(1, Relaxed);
        slot.mark(&slot.structural);
        slot.mark(&slot.unlinks);
        Unlink::Done(old)
    }

    /// After an unlink, climb while the parent chain consists of
    /// drained tombstones with at most one child.
    fn drain_routing<'g>(&self, start: Shared<'g, Node<K, V>>, slot: &OpStats, guard: &'g Guard) {
        let holder = self.holder.load(Relaxed, guard);
        let mut node = start;
        while !node.is_null() && node != holder {
            let nref = unsafe { node.deref() };
            if is_unlinked(nref.version.load(Acquire)) {
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
            match self.attempt_unlink(parent, node, false, slot, guard) {
                Unlink::Done(_) => node = parent,
                Unlink::Stale => break,
            }
        }
    }

    /// Raise `x`, the child of `p` on side `rise`, above `p` with an
    /// in-place rotation. `p` shrinks and `x` grows, both bracketed on
    /// their version words while the three locks are held.
    fn rotate<'g>(
        &self,
        g: Shared<'g, Node<K, V>>,
        p: Shared<'g, Node<K, V>>,
        x: Shared<'g, Node<K, V>>,
        rise: Dir,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> bool {
        let spin = self.config.spin_count;
        let gref = unsafe { g.deref() };
        let pref = unsafe { p.deref() };
        let xref = unsafe { x.deref() };
        let _gl = match spin_lock(&gref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        if is_unlinked(gref.version.load(Relaxed)) {
            return false;
        }
        let gdir = if gref.left.load(Relaxed, guard) == p {
            Dir::Left
        } else if gref.right.load(Relaxed, guard) == p {
            Dir::Right
        } else {
            return false;
        };
        let _pl = match spin_lock(&pref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        if pref.child(rise).load(Relaxed, guard) != x {
            return false;
        }
        let _xl = match spin_lock(&xref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };

        pref.begin_shrink();
        xref.begin_grow();
        let inner = xref.child(rise.flip()).load(Acquire, guard);
        pref.child(rise).store(inner, Release);
        if !inner.is_null() {
            unsafe { inner.deref() }.parent.store(p, Release);
        }
        xref.child(rise.flip()).store(p, Release);
        gref.child(gdir).store(x, Release);
        xref.parent.store(g, Release);
        pref.parent.store(x, Release);
        xref.end_grow(self.layout);
        pref.end_shrink(self.layout);
        slot.mark(&slot.structural);
        true
    }

    /// Raise `x` two levels over its parent `p` and grandparent `g` in
    /// one structural edit, zig-zig when `dir_x == dir_p` and zig-zag
    /// otherwise. Exactly the nodes whose subtrees lose keys are
    /// bracketed: `g` and `p` shrink, `x` grows, nothing else is
    /// marked. Four try-locks taken top-down from `gg`.
    #[allow(clippy::too_many_arguments)]
    fn rotate_double<'g>(
        &self,
        gg: Shared<'g, Node<K, V>>,
        g: Shared<'g, Node<K, V>>,
        p: Shared<'g, Node<K, V>>,
        x: Shared<'g, Node<K, V>>,
        dir_p: Dir,
        dir_x: Dir,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> bool {
        let spin = self.config.spin_count;
        let ggref = unsafe { gg.deref() };
        let gref = unsafe { g.deref() };
        let pref = unsafe { p.deref() };
        let xref = unsafe { x.deref() };
        let _ggl = match spin_lock(&ggref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        if is_unlinked(ggref.version.load(Relaxed)) {
            return false;
        }
        let ggdir = if ggref.left.load(Relaxed, guard) == g {
            Dir::Left
        } else if ggref.right.load(Relaxed, guard) == g {
            Dir::Right
        } else {
            return false;
        };
        let _gl = match spin_lock(&gref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        if gref.child(dir_p).load(Relaxed, guard) != p {
            return false;
        }
        let _pl = match spin_lock(&pref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        if pref.child(dir_x).load(Relaxed, guard) != x {
            return false;
        }
        let _xl = match spin_lock(&xref.lock, spin) {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };

        gref.begin_shrink();
        pref.begin_shrink();
        xref.begin_grow();
        if dir_x == dir_p {
            // zig-zig: x ends on top with p below it and g below p.
            let d = dir_x;
            let f = d.flip();
            let x_inner = xref.child(f).load(Acquire, guard);
            let p_inner = pref.child(f).load(Acquire, guard);
            pref.child(d).store(x_inner, Release);
            if !x_inner.is_null() {
                unsafe { x_inner.deref() }.parent.store(p, Release);
            }
            gref.child(d).store(p_inner, Release);
            if !p_inner.is_null() {
                unsafe { p_inner.deref() }.parent.store(g, Release);
            }
            pref.child(f).store(g, Release);
            gref.parent.store(p, Release);
            xref.child(f).store(p, Release);
            pref.parent.store(x, Release);
        } else {
            // zig-zag: x ends on top adopting p and g as children.
            let d = dir_p;
            let f = dir_x;
            let toward_p = xref.child(d).load(Acquire, guard);
            let toward_g = xref.child(f).load(Acquire, guard);
            pref.child(f).store(toward_p, Release);
            if !toward_p.is_null() {
                unsafe { toward_p.deref() }.parent.store(p, Release);
            }
            gref.child(d).store(toward_g, Release);
            if !toward_g.is_null() {
                unsafe { toward_g.deref() }.parent.store(g, Release);
            }
            xref.child(d).store(p, Release);
            pref.parent.store(x, Release);
            xref.child(f).store(g, Release);
            gref.parent.store(x, Release);
        }
        ggref.child(ggdir).store(x, Release);
        xref.parent.store(gg, Release);
        xref.end_grow(self.layout);
        pref.end_shrink(self.layout);
        gref.end_shrink(self.layout);
        slot.mark(&slot.structural);
        true
    }
}

/// Splay machine, the same frequency gate as the contention-friendly
/// splay variant driving version-bracketed in-place rotations.
impl<K, V> OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
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
            if is_unlinked(nref.version.load(Acquire)) {
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

    fn splay_step<'g>(
        &self,
        x: Shared<'g, Node<K, V>>,
        slot: &OpStats,
        conflicts: &mut u32,
        guard: &'g Guard,
    ) -> Step {
        let holder = self.holder.load(Relaxed, guard);
        let xref = unsafe { x.deref() };

        let p = xref.parent.load(Acquire, guard);
        if p.is_null() || p == holder {
            return Step::Stuck;
        }
        let pref = unsafe { p.deref() };
        let g = pref.parent.load(Acquire, guard);
        if g.is_null() {
            return Step::Stuck;
        }

        // piggyback garbage collection of drained routing parents.
        if pref.value.load(Acquire, guard).is_null()
            && (pref.left.load(Acquire, guard).is_null()
                || pref.right.load(Acquire, guard).is_null())
        {
            return match self.attempt_unlink(g, p, false, slot, guard) {
                Unlink::Done(_) => Step::Rose(1),
                Unlink::Stale => {
                    *conflicts += 1;
                    Step::Rose(0)
                }
            };
        }

        let dir_x = if pref.left.load(Acquire, guard) == x {
            Dir::Left
        } else if pref.right.load(Acquire, guard) == x {
            Dir::Right
        } else {
            return Step::Stuck;
        };

        if g == holder {
            // zig
            return if self.rotate(g, p, x, dir_x, slot, guard) {
                Step::Rose(1)
            } else {
                *conflicts += 1;
                Step::Rose(0)
            };
        }

        let gref = unsafe { g.deref() };
        let dir_p = if gref.left.load(Acquire, guard) == p {
            Dir::Left
        } else if gref.right.load(Acquire, guard) == p {
            Dir::Right
        } else {
            *conflicts += 1;
            return Step::Rose(0);
        };
        let gg = gref.parent.load(Acquire, guard);
        if gg.is_null() {
            return Step::Stuck;
        }

        // zig-zig and zig-zag are one bracketed edit: two shrinks on
        // the nodes moving down, one grow on x.
        if self.rotate_double(gg, g, p, x, dir_p, dir_x, slot, guard) {
            Step::Rose(2)
        } else {
            *conflicts += 1;
            Step::Rose(0)
        }
    }
}

/// Weakly-consistent iteration helper.
impl<K, V> OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn next_above(&self, lower: Option<&K>) -> Option<(K, V)> {
        let guard = epoch::pin();
        'restart: loop {
            let holder = self.holder.load(Relaxed, &guard);
            let mut node = unsafe { holder.deref() }.right.load(Acquire, &guard);
            let mut best: Option<(K, V)> = None;
            while !node.is_null() {
                let nref = unsafe { node.deref() };
                let ovl = nref.version.load(Acquire);
                if is_shrinking_or_unlinked(ovl) {
                    self.wait_until_not_changing(nref);
                    continue 'restart;
                }
                let candidate = match (&nref.key, lower) {
                    (Some(k), Some(low)) => k > low,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                let next = if candidate {
                    let value = nref.value.load(Acquire, &guard);
                    if !value.is_null() {
                        let key = nref.key.as_ref().unwrap().clone();
                        best = Some((key, unsafe { value.deref() }.clone()));
                    }
                    nref.left.load(Acquire, &guard)
                } else {
                    nref.right.load(Acquire, &guard)
                };
                if self
                    .layout
                    .has_shrunk_or_unlinked(ovl, nref.version.load(Acquire))
                {
                    continue 'restart;
                }
                node = next;
            }
            return best;
        }
    }
}

/// Deep walk validation of OvlSplay index. Assumes quiescence.
impl<K, V> OvlSplay<K, V>
where
    K: Clone + Ord + Debug,
    V: Clone,
{
    /// Validate BST order, parent agreement and that no unlinked node
    /// is reachable; return full statistics with the leaf [`Depth`]
    /// histogram.
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

    #[allow(clippy::too_many_arguments)]
    fn validate_tree(
        &self,
        node: Shared<Node<K, V>>,
        parent: Shared<Node<K, V>>,
        lo: Option<&K>,
        hi: Option<&K>,
        depth: usize,
        depths: &mut Depth,
        entries: &mut usize,
        routing: &mut usize,
        guard: &Guard,
    ) -> Result<()> {
        if node.is_null() {
            depths.sample(depth);
            return Ok(());
        }
        let nref = unsafe { node.deref() };
        let key = nref.key.as_ref().unwrap();
        if is_unlinked(nref.version.load(Relaxed)) {
            return Err(Error::UnlinkedReachable(format!("{:?}", key)));
        }
        if let Some(lo) = lo {
            if key <= lo {
                return Err(Error::SortError(format!("{:?}", lo), format!("{:?}", key)));
            }
        }
        if let Some(hi) = hi {
            if key >= hi {
                return Err(Error::SortError(format!("{:?}", key), format!("{:?}", hi)));
            }
        }
        if nref.parent.load(Relaxed, guard) != parent {
            let pref = unsafe { parent.deref() };
            let pkey = match &pref.key {
                Some(k) => format!("{:?}", k),
                None => "root-holder".to_string(),
            };
            return Err(Error::DanglingParent(pkey, format!("{:?}", key)));
        }
        if nref.value.load(Relaxed, guard).is_null() {
            *routing += 1;
        } else {
            *entries += 1;
        }
        self.validate_tree(
            nref.left.load(Relaxed, guard),
            node,
            lo,
            Some(key),
            depth + 1,
            depths,
            entries,
            routing,
            guard,
        )?;
        self.validate_tree(
            nref.right.load(Relaxed, guard),
            node,
            Some(key),
            hi,
            depth + 1,
            depths,
            entries,
            routing,
            guard,
        )
    }
}

/// Weakly-consistent ascending cursor over the live entries.
pub struct Iter<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a OvlSplay<K, V>,
    last: Option<K>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.index.next_above(self.last.as_ref());
        if let Some((key, _)) = &item {
            self.last = Some(key.clone());
        }
        item
    }
}

/// Per-thread handle into [OvlSplay] index.
pub struct OvlSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a OvlSplay<K, V>,
    slot: &'a OpStats,
    rng: SmallRng,
}

impl<'a, K, V> OvlSplayHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// This thread's statistics slot.
    pub fn to_op_stats(&self) -> &OpStats {
        self.slot
    }
}

impl<'a, K, V> Reader<K, V> for OvlSplayHandle<'a, K, V>
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

impl<'a, K, V> Writer<K, V> for OvlSplayHandle<'a, K, V>
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

impl<K, V> Reader<K, V> for OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        OvlSplay::get(self, key)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(OvlSplay::iter(self))
    }

    fn len(&self) -> usize {
        OvlSplay::len(self)
    }
}

impl<K, V> Writer<K, V> for OvlSplay<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        OvlSplay::set_if_absent(self, key, value)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        OvlSplay::remove(self, key)
    }
}

#[cfg(test)]
#[path = "ovlsplay_test.rs"]
mod ovlsplay_test;
