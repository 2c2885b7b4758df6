//! Module `stats` implements the per-thread observable counters and
//! the aggregate statistics reported by every map variant.
//!
//! Counter slots are plain atomics indexed by an explicit thread-id
//! supplied when a handle is registered, so the hot paths never touch
//! thread-local machinery. The counters are observability only, they
//! have no effect on correctness.

use std::{
    fmt, result,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

use crate::depth::Depth;

/// One thread's worth of operation counters.
///
/// A slot is owned logically (not exclusively) by the thread that
/// registered it; all fields are atomics so aggregation can run
/// concurrently with the owner.
#[derive(Default)]
pub struct OpStats {
    /// Total operations routed through this slot, drives the splay
    /// frequency gate.
    pub accesses: AtomicU64,
    /// Total `get` calls.
    pub gets: AtomicU64,
    /// Operations that located a live entry.
    pub founds: AtomicU64,
    /// Operations that located no live entry.
    pub not_founds: AtomicU64,
    /// Nodes visited while descending, tree and chain alike.
    pub traversed: AtomicU64,
    /// Structural modifications, inserts, rotations and unlinks.
    pub structural: AtomicU64,
    /// Lock acquisitions that failed within their try budget.
    pub failed_locks: AtomicU64,
    /// Physical unlinks that actually happened.
    pub unlinks: AtomicU64,
}

impl OpStats {
    #[inline]
    pub(crate) fn mark(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    #[inline]
    pub(crate) fn mark_n(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Relaxed);
    }
}

/// Aggregate of all per-thread slots at one point in time.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct OpTotals {
    pub accesses: u64,
    pub gets: u64,
    pub founds: u64,
    pub not_founds: u64,
    pub traversed: u64,
    pub structural: u64,
    pub failed_locks: u64,
    pub unlinks: u64,
}

pub(crate) fn sum_slots(slots: &[OpStats]) -> OpTotals {
    let mut totals: OpTotals = Default::default();
    for slot in slots.iter() {
        totals.accesses += slot.accesses.load(Relaxed);
        totals.gets += slot.gets.load(Relaxed);
        totals.founds += slot.founds.load(Relaxed);
        totals.not_founds += slot.not_founds.load(Relaxed);
        totals.traversed += slot.traversed.load(Relaxed);
        totals.structural += slot.structural.load(Relaxed);
        totals.failed_locks += slot.failed_locks.load(Relaxed);
        totals.unlinks += slot.unlinks.load(Relaxed);
    }
    totals
}

impl fmt::Display for OpTotals {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ accesses = {}, gets = {}, founds = {}, not_founds = {}, ",
                "traversed = {}, structural = {}, failed_locks = {}, unlinks = {} }}",
            ),
            self.accesses,
            self.gets,
            self.founds,
            self.not_founds,
            self.traversed,
            self.structural,
            self.failed_locks,
            self.unlinks,
        )
    }
}

/// Statistics for cftree map instances.
pub enum Stats {
    /// Quick statistics, no tree walk involved.
    Partial {
        name: String,
        entries: usize,
        nodes: usize,
        node_size: usize,
        ops: OpTotals,
    },
    /// Full statistics via the variant's `validate()` method.
    Full {
        name: String,
        entries: usize,
        /// Tombstone nodes retained for routing.
        routing: usize,
        nodes: usize,
        node_size: usize,
        ops: OpTotals,
        depths: Depth,
    },
}

impl Stats {
    pub(crate) fn new_partial(
        name: &str,
        entries: usize,
        nodes: usize,
        node_size: usize,
        ops: OpTotals,
    ) -> Stats {
        Stats::Partial {
            name: name.to_string(),
            entries,
            nodes,
            node_size,
            ops,
        }
    }

    pub(crate) fn new_full(
        name: &str,
        entries: usize,
        routing: usize,
        nodes: usize,
        node_size: usize,
        ops: OpTotals,
        depths: Depth,
    ) -> Stats {
        Stats::Full {
            name: name.to_string(),
            entries,
            routing,
            nodes,
            node_size,
            ops,
            depths,
        }
    }

    /// Return the instance name these statistics were gathered from.
    pub fn to_name(&self) -> String {
        match self {
            Stats::Partial { name, .. } => name.clone(),
            Stats::Full { name, .. } => name.clone(),
        }
    }

    /// Return number of live entries.
    #[inline]
    pub fn to_entries(&self) -> usize {
        match self {
            Stats::Partial { entries, .. } => *entries,
            Stats::Full { entries, .. } => *entries,
        }
    }

    /// Return number of allocated nodes, live and routing together.
    #[inline]
    pub fn to_nodes(&self) -> usize {
        match self {
            Stats::Partial { nodes, .. } => *nodes,
            Stats::Full { nodes, .. } => *nodes,
        }
    }

    /// Return number of tombstone routing nodes, full statistics only.
    #[inline]
    pub fn to_routing(&self) -> Option<usize> {
        match self {
            Stats::Partial { .. } => None,
            Stats::Full { routing, .. } => Some(*routing),
        }
    }

    /// Return node size in bytes, including overhead, for this map's
    /// key and value types.
    #[inline]
    pub fn to_node_size(&self) -> usize {
        match self {
            Stats::Partial { node_size, .. } => *node_size,
            Stats::Full { node_size, .. } => *node_size,
        }
    }

    /// Return the aggregated per-thread operation counters.
    pub fn to_ops(&self) -> OpTotals {
        match self {
            Stats::Partial { ops, .. } => ops.clone(),
            Stats::Full { ops, .. } => ops.clone(),
        }
    }

    /// Return the [`Depth`] histogram, full statistics only.
    pub fn to_depths(&self) -> Option<Depth> {
        match self {
            Stats::Partial { .. } => None,
            Stats::Full { depths, .. } => Some(depths.clone()),
        }
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;
