//! Module `node` defines the tree node shared by the
//! contention-friendly variants, [CfAvl][crate::cfavl::CfAvl] and
//! [CfSplay][crate::cfsplay::CfSplay].
//!
//! Structural fields are epoch-managed atomics so that readers descend
//! without taking any lock; a writer takes the per-node mutex only for
//! the short validate-then-mutate window. A null `value` pointer is the
//! tombstone, logical deletion and physical unlinking are separate
//! steps.

use std::{
    borrow::Borrow,
    cmp::Ordering,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering::Relaxed},
};

use crossbeam_epoch::{Atomic, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Dir {
    Left,
    Right,
}

impl Dir {
    #[inline]
    pub(crate) fn flip(self) -> Dir {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

/// Node in a contention-friendly tree.
///
/// `key` is None only for the root holder sentinel, which sorts before
/// every real key and is always the grandparent of a root rotation.
/// Once `removed` flips true the node is out of the structure for
/// good; its child links keep routing concurrent readers, either into
/// the replacement subtree (rotation) or back to the former parent
/// (unlink).
pub(crate) struct Node<K, V> {
    pub(crate) key: Option<K>,
    pub(crate) value: Atomic<V>, // null encodes the tombstone
    pub(crate) left: Atomic<Node<K, V>>,
    pub(crate) right: Atomic<Node<K, V>>,
    pub(crate) parent: Atomic<Node<K, V>>,
    pub(crate) lock: Mutex<()>,
    pub(crate) removed: AtomicBool,
    pub(crate) height: AtomicI32,  // AVL variant only
    pub(crate) counter: AtomicU64, // splay variant only
}

impl<K, V> Node<K, V> {
    pub(crate) fn holder() -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: None,
            value: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::null(),
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            height: AtomicI32::new(0),
            counter: AtomicU64::new(0),
        })
    }

    pub(crate) fn leaf(key: K, value: Owned<V>, parent: Shared<'_, Node<K, V>>) -> Owned<Node<K, V>> {
        Owned::new(Node {
            key: Some(key),
            value: Atomic::from(value),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::from(parent),
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            height: AtomicI32::new(1),
            counter: AtomicU64::new(1),
        })
    }

    #[inline]
    pub(crate) fn child(&self, dir: Dir) -> &Atomic<Node<K, V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    /// This node's key relative to the probe. The root holder sorts
    /// before everything.
    #[inline]
    pub(crate) fn cmp_key<Q>(&self, key: &Q) -> Ordering
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

#[inline]
pub(crate) fn height_of<K, V>(node: Shared<'_, Node<K, V>>) -> i32 {
    if node.is_null() {
        0
    } else {
        unsafe { node.deref() }.height.load(Relaxed)
    }
}

/// Bounded try-lock used by the splay maintenance paths. Returns None
/// once the spin budget is exhausted; the caller charges it against
/// the invocation's conflict budget.
pub(crate) fn spin_lock(lock: &Mutex<()>, spins: u32) -> Option<MutexGuard<'_, ()>> {
    for _ in 0..=spins {
        if let Some(guard) = lock.try_lock() {
            return Some(guard);
        }
        std::hint::spin_loop();
    }
    None
}
