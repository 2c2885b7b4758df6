//! Module ``lotree`` export [LoTree] type, a concurrent ordered map
//! whose source of truth is a doubly-linked predecessor/successor
//! chain over the live nodes; the binary tree above it is only a
//! search accelerator.
//!
//! A key is present iff a `valid` node for it sits in the chain. Every
//! chain edge is guarded by the predecessor's `succ_lock`, tree edges
//! by per-node `tree_lock`s. Readers descend the tree without locks,
//! land anywhere near their key, and finish by walking the chain in
//! the needed direction; this tolerates arbitrary concurrent
//! restructuring of the tree.
//!
//! Removal marks the node invalid and splices it out of the chain at
//! its linearization point, then physically removes it from the tree
//! before returning, relocating the in-order successor into its place
//! when it has two children. The chain locks are held across the tree
//! work, so a re-insert of the same key cannot slip underneath. Tree
//! locks are acquired with try-lock-and-yield in a fixed order: the
//! node's parent, the node, the successor's parent, the successor, and
//! the successor's right child.

use std::{
    borrow::Borrow,
    cmp::{self, Ordering},
    fmt::Debug,
    mem,
    sync::atomic::{
        AtomicBool, AtomicIsize,
        Ordering::{Acquire, Relaxed, Release},
    },
    thread,
};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::trace;
use parking_lot::Mutex;

use crate::{
    config::Config,
    core::{IndexIter, Reader, Result, Writer},
    depth::Depth,
    error::Error,
    node::Dir,
    stats::{sum_slots, OpStats, Stats},
};

struct Node<K, V> {
    key: Option<K>, // None for the head and tail sentinels
    value: Atomic<V>,
    valid: AtomicBool,
    left: Atomic<Node<K, V>>,
    right: Atomic<Node<K, V>>,
    parent: Atomic<Node<K, V>>,
    pred: Atomic<Node<K, V>>,
    succ: Atomic<Node<K, V>>,
    tree_lock: Mutex<()>,
    succ_lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    fn sentinel() -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: None,
            value: Atomic::null(),
            valid: AtomicBool::new(true),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::null(),
            pred: Atomic::null(),
            succ: Atomic::null(),
            tree_lock: Mutex::new(()),
            succ_lock: Mutex::new(()),
        })
    }

    fn entry(
        key: K,
        value: Owned<V>,
        pred: Shared<'_, Node<K, V>>,
        succ: Shared<'_, Node<K, V>>,
        parent: Shared<'_, Node<K, V>>,
    ) -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: Some(key),
            value: Atomic::from(value),
            valid: AtomicBool::new(true),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::from(parent),
            pred: Atomic::from(pred),
            succ: Atomic::from(succ),
            tree_lock: Mutex::new(()),
            succ_lock: Mutex::new(()),
        })
    }

    #[inline]
    fn child(&self, dir: Dir) -> &Atomic<Node<K, V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    /// This node's key relative to the probe; the head sentinel sorts
    /// before everything. The tail sentinel is recognized by pointer
    /// identity in [LoTree::cmp_at], not here.
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
}

/// Concurrent ordered map over a logical-ordering tree.
///
/// The head sentinel doubles as the tree's root holder, the tail
/// sentinel lives only in the chain.
pub struct LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    name: String,
    config: Config,
    head: Atomic<Node<K, V>>,
    tail: Atomic<Node<K, V>>,
    n_count: AtomicIsize,
    n_nodes: AtomicIsize,
    slots: Vec<OpStats>,
}

impl<K, V> Drop for LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let head = self.head.load(Relaxed, guard);
        let tail = self.tail.load(Relaxed, guard);
        if head.is_null() {
            return;
        }
        let root = unsafe { head.deref() }.right.load(Relaxed, guard);
        self.free_subtree(root, guard);
        unsafe {
            drop(head.into_owned());
            drop(tail.into_owned());
        }
    }
}

/// Different ways to construct a LoTree index.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Create an empty index with default configuration, identified by
    /// `name`.
    pub fn new<S: AsRef<str>>(name: S) -> Box<LoTree<K, V>> {
        LoTree::with_config(name, Config::default()).unwrap()
    }

    /// Create an empty index with `config`, which is range-checked.
    pub fn with_config<S: AsRef<str>>(name: S, config: Config) -> Result<Box<LoTree<K, V>>> {
        let config = config.resolve()?;
        let slots = (0..config.thread_num).map(|_| OpStats::default()).collect();
        let index = Box::new(LoTree {
            name: name.as_ref().to_string(),
            config,
            head: Atomic::from(Node::sentinel()),
            tail: Atomic::from(Node::sentinel()),
            n_count: AtomicIsize::new(0),
            n_nodes: AtomicIsize::new(0),
            slots,
        });
        let guard = unsafe { epoch::unprotected() };
        let head = index.head.load(Relaxed, guard);
        let tail = index.tail.load(Relaxed, guard);
        unsafe {
            head.deref().succ.store(tail, Relaxed);
            tail.deref().pred.store(head, Relaxed);
        }
        Ok(index)
    }

    /// Register a cheap per-thread handle.
    pub fn to_handle(&self, thread_id: usize) -> Result<LoTreeHandle<K, V>> {
        match self.slots.get(thread_id) {
            Some(slot) => Ok(LoTreeHandle { index: self, slot }),
            None => Err(Error::InvalidThreadId(thread_id, self.slots.len())),
        }
    }
}

/// Maintenance API.
impl<K, V> LoTree<K, V>
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
        let head = self.head.load(Relaxed, guard);
        let tail = self.tail.load(Relaxed, guard);
        let href = unsafe { head.deref() };
        let root = href.right.load(Relaxed, guard);
        self.free_subtree(root, guard);
        href.right.store(Shared::<Node<K, V>>::null(), Relaxed);
        href.succ.store(tail, Relaxed);
        unsafe { tail.deref() }.pred.store(head, Relaxed);
        self.n_count.store(0, Relaxed);
        self.n_nodes.store(0, Relaxed);
    }

    /// Weakly-consistent ascending iterator over live entries, walking
    /// the chain.
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
}

/// Search plumbing.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    #[inline]
    fn cmp_at<'g, Q>(&self, node: Shared<'g, Node<K, V>>, key: &Q, guard: &'g Guard) -> Ordering
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if node == self.tail.load(Relaxed, guard) {
            Ordering::Greater
        } else {
            unsafe { node.deref() }.cmp_key(key)
        }
    }

    /// Tree descent, no locks, no validation. Lands on a near miss
    /// whenever the tree is being restructured; the chain walk in
    /// [LoTree::locate] absorbs the error.
    fn tree_search<'g, Q>(&self, key: &Q, guard: &'g Guard) -> (Shared<'g, Node<K, V>>, usize)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut cur = self.head.load(Relaxed, guard);
        let mut depth = 0;
        loop {
            let cref = unsafe { cur.deref() };
            let dir = match cref.cmp_key(key) {
                Ordering::Equal => return (cur, depth),
                Ordering::Less => Dir::Right,
                Ordering::Greater => Dir::Left,
            };
            let child = cref.child(dir).load(Acquire, guard);
            if child.is_null() {
                return (cur, depth);
            }
            cur = child;
            depth += 1;
        }
    }

    /// Tree descent followed by a chain walk. Returns either the node
    /// matching `key` (valid or not), or the chain predecessor, the
    /// node observed with the largest key below `key`.
    fn locate<'g, Q>(&self, key: &Q, guard: &'g Guard) -> (Shared<'g, Node<K, V>>, usize)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (mut cur, mut steps) = self.tree_search(key, guard);
        loop {
            match self.cmp_at(cur, key, guard) {
                Ordering::Equal => return (cur, steps),
                Ordering::Less => {
                    let next = unsafe { cur.deref() }.succ.load(Acquire, guard);
                    if self.cmp_at(next, key, guard) == Ordering::Greater {
                        return (cur, steps);
                    }
                    cur = next;
                    steps += 1;
                }
                Ordering::Greater => {
                    cur = unsafe { cur.deref() }.pred.load(Acquire, guard);
                    steps += 1;
                }
            }
        }
    }
}

/// CRUD operations on LoTree index.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Get a clone of the value for `key`, if a valid entry exists in
    /// the chain.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.do_get(key, &self.slots[0])
    }

    /// Insert `{key, value}` only if no valid entry exists for `key`,
    /// otherwise return a clone of the existing value.
    pub fn set_if_absent(&self, key: K, value: V) -> Option<V> {
        self.do_set_if_absent(key, value, &self.slots[0])
    }

    /// Remove the entry for `key` and return its value. The node
    /// leaves the chain at the linearization point and is physically
    /// removed from the tree before the call returns.
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
        let (node, steps) = self.locate(key, &guard);
        slot.mark_n(&slot.traversed, steps as u64);
        if self.cmp_at(node, key, &guard) == Ordering::Equal {
            let nref = unsafe { node.deref() };
            if nref.valid.load(Acquire) {
                let value = nref.value.load(Acquire, &guard);
                if !value.is_null() {
                    slot.mark(&slot.founds);
                    return Some(unsafe { value.deref() }.clone());
                }
            }
        }
        slot.mark(&slot.not_founds);
        None
    }

    fn do_set_if_absent(&self, key: K, value: V, slot: &OpStats) -> Option<V> {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        let head = self.head.load(Relaxed, &guard);
        let mut key = Some(key);
        let mut value = Some(Owned::new(value));
        loop {
            let kref = key.as_ref().unwrap();
            let (node, steps) = self.locate(kref, &guard);
            slot.mark_n(&slot.traversed, steps as u64);
            let pred = match self.cmp_at(node, kref, &guard) {
                Ordering::Equal => unsafe { node.deref() }.pred.load(Acquire, &guard),
                Ordering::Less => node,
                Ordering::Greater => continue,
            };
            if pred.is_null() {
                continue;
            }
            let pref = unsafe { pred.deref() };
            let _cl = pref.succ_lock.lock();
            if pred != head && !pref.valid.load(Acquire) {
                continue;
            }
            if self.cmp_at(pred, kref, &guard) != Ordering::Less {
                continue;
            }
            let succ = pref.succ.load(Acquire, &guard);
            match self.cmp_at(succ, kref, &guard) {
                Ordering::Less => continue,
                Ordering::Equal => {
                    // the lock we hold is the one a removal of succ
                    // would need, so the entry is stable and live.
                    let value = unsafe { succ.deref() }.value.load(Acquire, &guard);
                    slot.mark(&slot.founds);
                    return Some(unsafe { value.deref() }.clone());
                }
                Ordering::Greater => (),
            }
            // pick the tree parent among the chain neighbours; with
            // the interval (pred, succ) empty of tree nodes, one of
            // the two slots must be free.
            let (parent, pdir) = if pref.right.load(Acquire, &guard).is_null() {
                (pred, Dir::Right)
            } else if succ != self.tail.load(Relaxed, &guard)
                && unsafe { succ.deref() }.left.load(Acquire, &guard).is_null()
            {
                (succ, Dir::Left)
            } else {
                thread::yield_now();
                continue;
            };
            let paref = unsafe { parent.deref() };
            let _tl = paref.tree_lock.lock();
            if !paref.child(pdir).load(Acquire, &guard).is_null() {
                continue;
            }
            let fresh = Node::entry(
                key.take().unwrap(),
                value.take().unwrap(),
                pred,
                succ,
                parent,
            );
            let fresh = fresh.into_shared(&guard);
            // splice into the chain first, the list is the truth.
            pref.succ.store(fresh, Release);
            unsafe { succ.deref() }.pred.store(fresh, Release);
            // then attach as a child.
            paref.child(pdir).store(fresh, Release);
            self.n_count.fetch_add(1, Relaxed);
            self.n_nodes.fetch_add(1, Relaxed);
            slot.mark(&slot.structural);
            slot.mark(&slot.not_founds);
            return None;
        }
    }

    fn do_remove<Q>(&self, key: &Q, slot: &OpStats) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = epoch::pin();
        slot.mark(&slot.accesses);
        let head = self.head.load(Relaxed, &guard);
        loop {
            let (node, steps) = self.locate(key, &guard);
            slot.mark_n(&slot.traversed, steps as u64);
            if self.cmp_at(node, key, &guard) != Ordering::Equal {
                slot.mark(&slot.not_founds);
                return None;
            }
            let nref = unsafe { node.deref() };
            if !nref.valid.load(Acquire) {
                slot.mark(&slot.not_founds);
                return None;
            }
            let pred = nref.pred.load(Acquire, &guard);
            if pred.is_null() {
                continue;
            }
            let pref = unsafe { pred.deref() };
            let _pl = pref.succ_lock.lock();
            if pred != head && !pref.valid.load(Acquire) {
                continue;
            }
            if pref.succ.load(Acquire, &guard) != node {
                continue;
            }
            let _nl = nref.succ_lock.lock();
            if !nref.valid.load(Acquire) {
                slot.mark(&slot.not_founds);
                return None;
            }
            let succ = nref.succ.load(Acquire, &guard);
            let cur = nref.value.load(Acquire, &guard);
            let old = unsafe { cur.deref() }.clone();
            // linearization: the node leaves the chain.
            nref.valid.store(false, Release);
            pref.succ.store(succ, Release);
            unsafe { succ.deref() }.pred.store(pred, Release);
            nref.value.store(Shared::<V>::null(), Release);
            unsafe { guard.defer_destroy(cur) };
            self.n_count.fetch_sub(1, Relaxed);
            slot.mark(&slot.founds);
            // physical tree removal before the chain locks drop, so a
            // same-key insert cannot land while the node lingers.
            self.remove_from_tree(node, slot, &guard);
            return Some(old);
        }
    }
}

/// Physical tree removal.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn remove_from_tree<'g>(&self, node: Shared<'g, Node<K, V>>, slot: &OpStats, guard: &'g Guard) {
        let nref = unsafe { node.deref() };
        loop {
            let two_children = !nref.left.load(Acquire, guard).is_null()
                && !nref.right.load(Acquire, guard).is_null();
            let done = if two_children {
                self.try_relocate(node, slot, guard)
            } else {
                self.try_unlink(node, slot, guard)
            };
            if done {
                slot.mark(&slot.structural);
                slot.mark(&slot.unlinks);
                unsafe { guard.defer_destroy(node) };
                self.n_nodes.fetch_sub(1, Relaxed);
                return;
            }
            thread::yield_now();
        }
    }

    /// Splice out a node with at most one child, tree locks on parent
    /// and node.
    fn try_unlink<'g>(&self, node: Shared<'g, Node<K, V>>, slot: &OpStats, guard: &'g Guard) -> bool {
        let nref = unsafe { node.deref() };
        let parent = nref.parent.load(Acquire, guard);
        if parent.is_null() {
            return false;
        }
        let pref = unsafe { parent.deref() };
        let _pl = match pref.tree_lock.try_lock() {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        let dir = if pref.left.load(Relaxed, guard) == node {
            Dir::Left
        } else if pref.right.load(Relaxed, guard) == node {
            Dir::Right
        } else {
            return false;
        };
        let _nl = match nref.tree_lock.try_lock() {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        let left = nref.left.load(Acquire, guard);
        let right = nref.right.load(Acquire, guard);
        if !left.is_null() && !right.is_null() {
            return false;
        }
        let child = if left.is_null() { right } else { left };
        if !child.is_null() {
            unsafe { child.deref() }.parent.store(parent, Release);
        }
        pref.child(dir).store(child, Release);
        true
    }

    /// Replace a two-child node with its in-order successor, which is
    /// exactly its chain successor while our chain locks pin the
    /// interval. The successor is relocated, not copied, because
    /// concurrent readers hold direct node references.
    fn try_relocate<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> bool {
        let nref = unsafe { node.deref() };
        let parent = nref.parent.load(Acquire, guard);
        if parent.is_null() {
            return false;
        }
        let s = nref.succ.load(Acquire, guard);
        if s.is_null() || s == self.tail.load(Relaxed, guard) {
            return false;
        }
        let sref = unsafe { s.deref() };
        let sp = sref.parent.load(Acquire, guard);
        if sp.is_null() {
            return false;
        }

        let pref = unsafe { parent.deref() };
        let _pl = match pref.tree_lock.try_lock() {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        let pdir = if pref.left.load(Relaxed, guard) == node {
            Dir::Left
        } else if pref.right.load(Relaxed, guard) == node {
            Dir::Right
        } else {
            return false;
        };
        let _nl = match nref.tree_lock.try_lock() {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        let left = nref.left.load(Acquire, guard);
        let right = nref.right.load(Acquire, guard);
        if left.is_null() || right.is_null() {
            return false; // lost a child, the cheap splice applies now
        }
        let _spl = if sp != node {
            match unsafe { sp.deref() }.tree_lock.try_lock() {
                Some(l) => Some(l),
                None => {
                    slot.mark(&slot.failed_locks);
                    return false;
                }
            }
        } else {
            None
        };
        let _sl = match sref.tree_lock.try_lock() {
            Some(l) => l,
            None => {
                slot.mark(&slot.failed_locks);
                return false;
            }
        };
        // the successor must still be where we think it is.
        if sref.parent.load(Relaxed, guard) != sp {
            return false;
        }
        if !sref.left.load(Relaxed, guard).is_null() {
            return false;
        }
        if sp == node {
            if right != s {
                return false;
            }
        } else if unsafe { sp.deref() }.left.load(Relaxed, guard) != s {
            return false;
        }
        let sr = sref.right.load(Acquire, guard);
        let _srl = if !sr.is_null() {
            match unsafe { sr.deref() }.tree_lock.try_lock() {
                Some(l) => Some(l),
                None => {
                    slot.mark(&slot.failed_locks);
                    return false;
                }
            }
        } else {
            None
        };

        if sp == node {
            // successor is the node's right child, it keeps its own
            // right subtree and adopts the left one.
            sref.left.store(left, Release);
            unsafe { left.deref() }.parent.store(s, Release);
            sref.parent.store(parent, Release);
            pref.child(pdir).store(s, Release);
        } else {
            let spref = unsafe { sp.deref() };
            spref.left.store(sr, Release);
            if !sr.is_null() {
                unsafe { sr.deref() }.parent.store(sp, Release);
            }
            sref.left.store(left, Release);
            unsafe { left.deref() }.parent.store(s, Release);
            sref.right.store(right, Release);
            unsafe { right.deref() }.parent.store(s, Release);
            sref.parent.store(parent, Release);
            pref.child(pdir).store(s, Release);
        }
        trace!("{}: relocated successor during removal", self.name);
        true
    }
}

/// Weakly-consistent iteration helper, walks the chain.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn next_above(&self, lower: Option<&K>) -> Option<(K, V)> {
        let guard = epoch::pin();
        let tail = self.tail.load(Relaxed, &guard);
        let mut cur = match lower {
            None => self.head.load(Relaxed, &guard),
            Some(low) => self.locate(low, &guard).0,
        };
        loop {
            let next = unsafe { cur.deref() }.succ.load(Acquire, &guard);
            if next.is_null() || next == tail {
                return None;
            }
            let xref = unsafe { next.deref() };
            let key = xref.key.as_ref().unwrap();
            let beyond = match lower {
                None => true,
                Some(low) => key > low,
            };
            if beyond && xref.valid.load(Acquire) {
                let value = xref.value.load(Acquire, &guard);
                if !value.is_null() {
                    return Some((key.clone(), unsafe { value.deref() }.clone()));
                }
            }
            cur = next;
        }
    }
}

/// Deep walk validation of LoTree index. Assumes quiescence.
impl<K, V> LoTree<K, V>
where
    K: Clone + Ord + Debug,
    V: Clone,
{
    /// Validate the chain (strict ascending order, agreeing back
    /// links) and the tree (BST order, parent agreement), and check
    /// that both structures hold the same population. Returns full
    /// statistics with the tree's leaf [`Depth`] histogram.
    pub fn validate(&self) -> Result<Stats> {
        let guard = epoch::pin();
        let head = self.head.load(Relaxed, &guard);
        let tail = self.tail.load(Relaxed, &guard);

        // chain pass.
        let mut chain_entries = 0;
        let mut cur = head;
        loop {
            let next = unsafe { cur.deref() }.succ.load(Relaxed, &guard);
            if next == tail {
                break;
            }
            let xref = unsafe { next.deref() };
            if xref.pred.load(Relaxed, &guard) != cur {
                let a = self.render_key(cur, &guard);
                let b = self.render_key(next, &guard);
                return Err(Error::BrokenChain(a, b));
            }
            if cur != head {
                let ckey = unsafe { cur.deref() }.key.as_ref().unwrap();
                if xref.key.as_ref().unwrap() <= ckey {
                    let a = self.render_key(cur, &guard);
                    let b = self.render_key(next, &guard);
                    return Err(Error::BrokenChain(a, b));
                }
            }
            if !xref.valid.load(Relaxed) {
                return Err(Error::GhostKey(self.render_key(next, &guard)));
            }
            chain_entries += 1;
            cur = next;
        }

        // tree pass.
        let root = unsafe { head.deref() }.right.load(Relaxed, &guard);
        let mut depths: Depth = Default::default();
        let mut tree_entries = 0;
        self.validate_tree(root, head, None, None, 0, &mut depths, &mut tree_entries, &guard)?;
        if tree_entries != chain_entries {
            return Err(Error::GhostKey(format!(
                "tree holds {} nodes, chain holds {}",
                tree_entries, chain_entries
            )));
        }
        Ok(Stats::new_full(
            &self.name,
            chain_entries,
            0,
            cmp::max(self.n_nodes.load(Relaxed), 0) as usize,
            mem::size_of::<Node<K, V>>(),
            sum_slots(&self.slots),
            depths,
        ))
    }

    fn render_key(&self, node: Shared<Node<K, V>>, _guard: &Guard) -> String {
        match &unsafe { node.deref() }.key {
            Some(k) => format!("{:?}", k),
            None => "sentinel".to_string(),
        }
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
        guard: &Guard,
    ) -> Result<()> {
        if node.is_null() {
            depths.sample(depth);
            return Ok(());
        }
        let nref = unsafe { node.deref() };
        let key = nref.key.as_ref().unwrap();
        if !nref.valid.load(Relaxed) {
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
            let pkey = self.render_key(parent, guard);
            return Err(Error::DanglingParent(pkey, format!("{:?}", key)));
        }
        *entries += 1;
        self.validate_tree(
            nref.left.load(Relaxed, guard),
            node,
            lo,
            Some(key),
            depth + 1,
            depths,
            entries,
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
    index: &'a LoTree<K, V>,
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

/// Per-thread handle into [LoTree] index.
pub struct LoTreeHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a LoTree<K, V>,
    slot: &'a OpStats,
}

impl<'a, K, V> LoTreeHandle<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// This thread's statistics slot.
    pub fn to_op_stats(&self) -> &OpStats {
        self.slot
    }
}

impl<'a, K, V> Reader<K, V> for LoTreeHandle<'a, K, V>
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

impl<'a, K, V> Writer<K, V> for LoTreeHandle<'a, K, V>
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

impl<K, V> Reader<K, V> for LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        LoTree::get(self, key)
    }

    fn iter(&mut self) -> IndexIter<'_, K, V> {
        Box::new(LoTree::iter(self))
    }

    fn len(&self) -> usize {
        LoTree::len(self)
    }
}

impl<K, V> Writer<K, V> for LoTree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V> {
        LoTree::set_if_absent(self, key, value)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        LoTree::remove(self, key)
    }
}

#[cfg(test)]
#[path = "lotree_test.rs"]
mod lotree_test;
