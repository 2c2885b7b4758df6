//! Module `config` holds the tuning knobs shared by the map variants.
//!
//! All parameters come with workable defaults; applications that care
//! can override them with the `set_*` methods before constructing a
//! map via `with_config`.

use crate::{core::Result, error::Error};

/// Default for `thread_num`, ZERO means "resolve to the number of
/// logical cpus at construction".
pub const THREAD_NUM: usize = 0;
/// Default for `inv_splay_prob`. Splay probability works out to
/// `1 / (inv_splay_prob * thread_num)`.
pub const INV_SPLAY_PROB: usize = 1;
/// Default for `k1`, the depth-to-counter threshold that lets a splay
/// begin.
pub const K1: f64 = 2.0;
/// Default for `k2`, the depth-to-counter threshold that lets a splay
/// continue.
pub const K2: f64 = 2.0;
/// Default for `max_depth`, below which splaying is suppressed.
pub const MAX_DEPTH: usize = 8;
/// Default for `conflicts`, the total lock-conflict budget of one
/// splay invocation.
pub const CONFLICTS: u32 = 16;
/// Default for `spin_count`, try-lock attempts per ancestor and spin
/// iterations while waiting on a version word.
pub const SPIN_COUNT: u32 = 64;
/// Default for `yield_count`, scheduler yields after spinning before
/// falling back to a blocking acquisition.
pub const YIELD_COUNT: u32 = 8;
/// Default field width for the grow/shrink counters inside the
/// optimistic version word. Must not exceed 30.
pub const OVL_BITS_BEFORE_OVERFLOW: u32 = 8;

/// Configuration for cftree map variants.
///
/// The AVL variant only consults `thread_num` (for statistics slots),
/// the splaying variants consult everything else as well.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of threads expected to operate on the map, also the
    /// number of per-thread statistics slots.
    ///
    /// Default: [THREAD_NUM], resolved via num_cpus.
    pub thread_num: usize,
    /// Inverse splay probability scale.
    ///
    /// Default: [INV_SPLAY_PROB]
    pub inv_splay_prob: usize,
    /// Splay entry threshold multiplier.
    ///
    /// Default: [K1]
    pub k1: f64,
    /// Splay continuation threshold multiplier.
    ///
    /// Default: [K2]
    pub k2: f64,
    /// Depth below which accessed nodes are never splayed.
    ///
    /// Default: [MAX_DEPTH]
    pub max_depth: usize,
    /// Lock-conflict budget for one splay invocation.
    ///
    /// Default: [CONFLICTS]
    pub conflicts: u32,
    /// Try-lock attempts per ancestor, spin budget on version waits.
    ///
    /// Default: [SPIN_COUNT]
    pub spin_count: u32,
    /// Yields after spinning, before blocking on the node lock.
    ///
    /// Default: [YIELD_COUNT]
    pub yield_count: u32,
    /// Field width of the grow/shrink counters in `changeOVL`.
    ///
    /// Default: [OVL_BITS_BEFORE_OVERFLOW]
    pub ovl_bits: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            thread_num: THREAD_NUM,
            inv_splay_prob: INV_SPLAY_PROB,
            k1: K1,
            k2: K2,
            max_depth: MAX_DEPTH,
            conflicts: CONFLICTS,
            spin_count: SPIN_COUNT,
            yield_count: YIELD_COUNT,
            ovl_bits: OVL_BITS_BEFORE_OVERFLOW,
        }
    }
}

impl Config {
    /// Expected number of operating threads. ZERO resolves to the
    /// number of logical cpus.
    pub fn set_thread_num(&mut self, thread_num: usize) {
        self.thread_num = thread_num;
    }

    /// Inverse splay probability, must be one or more.
    pub fn set_inv_splay_prob(&mut self, inv_splay_prob: usize) {
        self.inv_splay_prob = inv_splay_prob;
    }

    /// Splay entry/continuation thresholds, both must be positive.
    pub fn set_splay_thresholds(&mut self, k1: f64, k2: f64) {
        self.k1 = k1;
        self.k2 = k2;
    }

    /// Depth below which splaying is suppressed.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Lock-retry and version-wait budgets.
    pub fn set_budgets(&mut self, conflicts: u32, spin_count: u32, yield_count: u32) {
        self.conflicts = conflicts;
        self.spin_count = spin_count;
        self.yield_count = yield_count;
    }

    /// Counter field width for the optimistic version word, at most 30.
    pub fn set_ovl_bits(&mut self, ovl_bits: u32) {
        self.ovl_bits = ovl_bits;
    }

    /// Return a copy with `thread_num` resolved and all parameters
    /// range-checked.
    pub fn resolve(&self) -> Result<Config> {
        let mut config = self.clone();
        if config.thread_num == 0 {
            config.thread_num = num_cpus::get();
        }
        if config.inv_splay_prob < 1 {
            return Err(Error::InvalidConfig("inv_splay_prob must be >= 1".to_string()));
        }
        if config.k1 <= 0.0 || config.k2 <= 0.0 {
            return Err(Error::InvalidConfig("k1 and k2 must be positive".to_string()));
        }
        if config.ovl_bits == 0 || config.ovl_bits > 30 {
            return Err(Error::InvalidConfig("ovl_bits must be in 1..=30".to_string()));
        }
        Ok(config)
    }
}
