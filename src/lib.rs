//! Cftree provide a collection of concurrent ordered maps, all of them
//! internal binary search trees with fine-grained locking and
//! relaxed-balance self-adjustment. Operations on a single key are
//! linearizable; rebalancing is incremental, best effort, and never
//! observable through the map API.
//!
//! Four variants share one abstract design and differ in how they keep
//! the tree shallow:
//!
//! * [cfavl::CfAvl], a contention-friendly AVL tree. Per-node locks,
//!   deferred rotations that re-parent through fresh node objects, a
//!   height-repair walk after every mutation.
//! * [cfsplay::CfSplay], the same node model with probabilistic
//!   splaying driven by per-thread and per-node access counters in
//!   place of height bookkeeping.
//! * [ovlsplay::OvlSplay], a splay tree whose readers validate
//!   per-node change counters, the `changeOVL` word, instead of taking
//!   read locks; rotations happen in place between begin/end
//!   grow-shrink brackets.
//! * [lotree::LoTree], a logical-ordering tree. A doubly-linked
//!   predecessor/successor chain is the source of truth for presence
//!   and the tree above it is only a search accelerator.
//!
//! Reads take no locks in any variant. Removal everywhere splits into
//! a logical delete at the linearization point and a physical unlink
//! performed by maintenance; unlinked storage is reclaimed with
//! epoch-based reclamation (crossbeam-epoch), so readers overtaken by
//! structural changes stay on valid memory.
//!
//! Under multi-threading, register one handle per thread via the
//! `to_handle()` constructors; handles carry the thread's statistics
//! slot and, for the splaying variants, its random source.

mod config;
mod core;
mod depth;
mod error;
mod node;
mod stats;

pub mod cfavl;
pub mod cfsplay;
pub mod lotree;
pub mod ovlsplay;

pub use crate::cfavl::{CfAvl, CfAvlHandle};
pub use crate::cfsplay::{CfSplay, CfSplayHandle};
pub use crate::config::Config;
pub use crate::core::{IndexIter, Reader, Result, Writer};
pub use crate::depth::Depth;
pub use crate::error::Error;
pub use crate::lotree::{LoTree, LoTreeHandle};
pub use crate::ovlsplay::{OvlSplay, OvlSplayHandle};
pub use crate::stats::{OpStats, OpTotals, Stats};
