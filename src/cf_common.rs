// Shared engine for the contention-friendly variants. This file is
// textually included by cfavl.rs and cfsplay.rs, which alias their map
// type as `Tree` before the include.

/// Where a descent ended up. `node` is null when the probe fell off a
/// null child slot of `parent` on side `dir`; that slot is where an
/// insert would attach.
pub(crate) struct SearchPath<'g, K, V> {
    pub(crate) parent: Shared<'g, Node<K, V>>,
    pub(crate) node: Shared<'g, Node<K, V>>,
    pub(crate) dir: Dir,
    pub(crate) depth: usize,
}

pub(crate) enum Upsert<V> {
    Present(V),
    Revived,
    Stale,
}

pub(crate) enum Unset<V> {
    Missing,
    Done(V),
    Stale,
}

pub(crate) enum Spliced<'g, K, V> {
    Done(Shared<'g, Node<K, V>>),
    Busy,
    Stale,
}

impl<K, V> Tree<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Descend from the root holder without taking any lock.
    ///
    /// Nodes observed with `removed == true` are traversed straight
    /// through: a rotated-out clone still routes into its replacement
    /// subtree, an unlinked node's child slots lead back to its former
    /// parent, where the freshly re-read child slot makes progress. An
    /// equality match on a removed node cannot be trusted and restarts
    /// the descent.
    fn search<'g, Q>(&self, key: &Q, guard: &'g Guard) -> SearchPath<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let holder = self.holder.load(Relaxed, guard);
        'restart: loop {
            let mut parent = holder;
            let mut dir = Dir::Right;
            let mut depth = 0;
            loop {
                let pref = unsafe { parent.deref() };
                let node = pref.child(dir).load(Acquire, guard);
                if node.is_null() {
                    return SearchPath {
                        parent,
                        node,
                        dir,
                        depth,
                    };
                }
                let nref = unsafe { node.deref() };
                depth += 1;
                match nref.cmp_key(key) {
                    Ordering::Equal => {
                        if nref.removed.load(Acquire) {
                            continue 'restart;
                        }
                        return SearchPath {
                            parent,
                            node,
                            dir,
                            depth,
                        };
                    }
                    Ordering::Less => {
                        parent = node;
                        dir = Dir::Right;
                    }
                    Ordering::Greater => {
                        parent = node;
                        dir = Dir::Left;
                    }
                }
            }
        }
    }

    fn acquire<'a>(
        &self,
        lock: &'a Mutex<()>,
        spin: Option<u32>,
        slot: &OpStats,
    ) -> Option<MutexGuard<'a, ()>> {
        match spin {
            None => Some(lock.lock()),
            Some(spins) => match spin_lock(lock, spins) {
                Some(guard) => Some(guard),
                None => {
                    slot.mark(&slot.failed_locks);
                    None
                }
            },
        }
    }

    /// Attach a fresh leaf under `parent` on side `dir`. `key` and
    /// `value` are taken out of their options only on success, so the
    /// caller can retry with the same allocation intent.
    fn try_insert<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        dir: Dir,
        key: &mut Option<K>,
        value: &mut Option<Owned<V>>,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Node<K, V>>> {
        let pref = unsafe { parent.deref() };
        let _pl = pref.lock.lock();
        if pref.removed.load(Relaxed) {
            return None;
        }
        let child = pref.child(dir);
        if !child.load(Acquire, guard).is_null() {
            return None;
        }
        let node = Node::leaf(key.take().unwrap(), value.take().unwrap(), parent);
        let node = node.into_shared(guard);
        child.store(node, Release);
        self.n_count.fetch_add(1, Relaxed);
        self.n_nodes.fetch_add(1, Relaxed);
        slot.mark(&slot.structural);
        Some(node)
    }

    /// Re-arm a tombstone node with a new value, or report the live
    /// value that beat us to it.
    fn try_revive<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        value: &mut Option<Owned<V>>,
        guard: &'g Guard,
    ) -> Upsert<V> {
        let nref = unsafe { node.deref() };
        let _nl = nref.lock.lock();
        if nref.removed.load(Relaxed) {
            return Upsert::Stale;
        }
        let cur = nref.value.load(Acquire, guard);
        if !cur.is_null() {
            return Upsert::Present(unsafe { cur.deref() }.clone());
        }
        nref.value.store(value.take().unwrap(), Release);
        self.n_count.fetch_add(1, Relaxed);
        Upsert::Revived
    }

    /// Logical delete: swing the value slot to the tombstone. The node
    /// stays put as a routing node until a maintenance pass unlinks it.
    fn try_delete<'g>(&self, node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> Unset<V> {
        let nref = unsafe { node.deref() };
        let _nl = nref.lock.lock();
        if nref.removed.load(Relaxed) {
            return Unset::Stale;
        }
        let cur = nref.value.load(Acquire, guard);
        if cur.is_null() {
            return Unset::Missing;
        }
        let old = unsafe { cur.deref() }.clone();
        nref.value.store(Shared::<V>::null(), Release);
        unsafe { guard.defer_destroy(cur) };
        self.n_count.fetch_sub(1, Relaxed);
        Unset::Done(old)
    }

    /// Physically unlink `node`, which must be a tombstone with at
    /// most one child. Returns false whenever a precondition no longer
    /// holds under the locks; every failure implies the tree moved on
    /// and the caller's snapshot is due for a refresh.
    fn try_unlink<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        spin: Option<u32>,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> bool {
        let pref = unsafe { parent.deref() };
        let nref = unsafe { node.deref() };
        let _pl = match self.acquire(&pref.lock, spin, slot) {
            Some(g) => g,
            None => return false,
        };
        if pref.removed.load(Relaxed) {
            return false;
        }
        let dir = if pref.left.load(Relaxed, guard) == node {
            Dir::Left
        } else if pref.right.load(Relaxed, guard) == node {
            Dir::Right
        } else {
            return false;
        };
        let _nl = match self.acquire(&nref.lock, spin, slot) {
            Some(g) => g,
            None => return false,
        };
        if !nref.value.load(Acquire, guard).is_null() {
            return false; // revived while we were deciding
        }
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
        // strand readers still inside `node` back onto the parent,
        // whose re-read child slot no longer leads here.
        nref.left.store(parent, Release);
        nref.right.store(parent, Release);
        nref.removed.store(true, Release);
        unsafe { guard.defer_destroy(node) };
        self.n_nodes.fetch_sub(1, Relaxed);
        slot.mark(&slot.structural);
        slot.mark(&slot.unlinks);
        trace!("{}: unlinked routing node", self.name);
        true
    }

    /// Clone-and-splice rotation. The child of `n` on side `rise`
    /// moves up to take `n`'s place under `g`; `n` itself is replaced
    /// by a fresh clone spliced below the risen child, and the old
    /// allocation is retired with its links left routing into the new
    /// subtree.
    fn rotate<'g>(
        &self,
        g: Shared<'g, Node<K, V>>,
        n: Shared<'g, Node<K, V>>,
        rise: Dir,
        spin: Option<u32>,
        slot: &OpStats,
        guard: &'g Guard,
    ) -> Spliced<'g, K, V> {
        let gref = unsafe { g.deref() };
        let nref = unsafe { n.deref() };
        let _gl = match self.acquire(&gref.lock, spin, slot) {
            Some(l) => l,
            None => return Spliced::Busy,
        };
        if gref.removed.load(Relaxed) {
            return Spliced::Stale;
        }
        let gdir = if gref.left.load(Relaxed, guard) == n {
            Dir::Left
        } else if gref.right.load(Relaxed, guard) == n {
            Dir::Right
        } else {
            return Spliced::Stale;
        };
        let _nl = match self.acquire(&nref.lock, spin, slot) {
            Some(l) => l,
            None => return Spliced::Busy,
        };
        let c = nref.child(rise).load(Acquire, guard);
        if c.is_null() {
            return Spliced::Stale;
        }
        let cref = unsafe { c.deref() };
        let _cl = match self.acquire(&cref.lock, spin, slot) {
            Some(l) => l,
            None => return Spliced::Busy,
        };

        let inner = cref.child(rise.flip()).load(Acquire, guard);
        let kept = nref.child(rise.flip()).load(Acquire, guard);
        let m = Owned::new(Node {
            key: nref.key.clone(),
            value: Atomic::from(nref.value.load(Acquire, guard)),
            left: Atomic::null(),
            right: Atomic::null(),
            parent: Atomic::from(c),
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            height: AtomicI32::new(1 + cmp::max(height_of(inner), height_of(kept))),
            counter: AtomicU64::new(nref.counter.load(Relaxed)),
        });
        m.child(rise).store(inner, Relaxed);
        m.child(rise.flip()).store(kept, Relaxed);
        let m = m.into_shared(guard);

        if !inner.is_null() {
            unsafe { inner.deref() }.parent.store(m, Release);
        }
        if !kept.is_null() {
            unsafe { kept.deref() }.parent.store(m, Release);
        }
        cref.child(rise.flip()).store(m, Release);
        let c_height = {
            let outer = cref.child(rise).load(Acquire, guard);
            1 + cmp::max(height_of(outer), unsafe { m.deref() }.height.load(Relaxed))
        };
        cref.height.store(c_height, Relaxed);
        cref.parent.store(g, Release);
        gref.child(gdir).store(c, Release);
        // the old pivot keeps routing readers: `rise` side still leads
        // to the risen child, the other side into the cloned subtree.
        nref.removed.store(true, Release);
        unsafe { guard.defer_destroy(n) };
        slot.mark(&slot.structural);
        Spliced::Done(c)
    }

    /// Smallest live entry with key strictly above `lower`. Restarts
    /// on a removed node rather than risk walking a stale route while
    /// accumulating a candidate.
    fn next_above(&self, lower: Option<&K>) -> Option<(K, V)> {
        let guard = epoch::pin();
        'restart: loop {
            let holder = self.holder.load(Relaxed, &guard);
            let mut node = unsafe { holder.deref() }.right.load(Acquire, &guard);
            let mut best: Option<(K, V)> = None;
            while !node.is_null() {
                let nref = unsafe { node.deref() };
                if nref.removed.load(Acquire) {
                    continue 'restart;
                }
                let candidate = match (&nref.key, lower) {
                    (Some(k), Some(low)) => k > low,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if candidate {
                    let value = nref.value.load(Acquire, &guard);
                    if !value.is_null() {
                        let key = nref.key.as_ref().unwrap().clone();
                        best = Some((key, unsafe { value.deref() }.clone()));
                    }
                    node = nref.left.load(Acquire, &guard);
                } else {
                    node = nref.right.load(Acquire, &guard);
                }
            }
            return best;
        }
    }

    // quiescent teardown used by clear() and Drop.
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

/// Deep-walk checks shared by the contention-friendly variants.
impl<K, V> Tree<K, V>
where
    K: Clone + Ord + Debug,
    V: Clone,
{
    #[allow(clippy::too_many_arguments)]
    fn validate_tree(
        &self,
        node: Shared<Node<K, V>>,
        parent: Shared<Node<K, V>>,
        lo: Option<&K>,
        hi: Option<&K>,
        check_heights: bool,
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
        if nref.removed.load(Relaxed) {
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
        let left = nref.left.load(Relaxed, guard);
        let right = nref.right.load(Relaxed, guard);
        if check_heights {
            let computed = 1 + cmp::max(height_of(left), height_of(right));
            let stored = nref.height.load(Relaxed);
            if stored != computed {
                return Err(Error::HeightSkew(format!("{:?}", key), stored, computed));
            }
        }
        self.validate_tree(
            left,
            node,
            lo,
            Some(key),
            check_heights,
            depth + 1,
            depths,
            entries,
            routing,
            guard,
        )?;
        self.validate_tree(
            right,
            node,
            Some(key),
            hi,
            check_heights,
            depth + 1,
            depths,
            entries,
            routing,
            guard,
        )
    }
}

/// Weakly-consistent ascending cursor over the live entries.
///
/// Every key live for the cursor's whole lifetime is yielded exactly
/// once; keys inserted or removed mid-flight may or may not show up.
pub struct Iter<'a, K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    index: &'a Tree<K, V>,
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
