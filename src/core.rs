//! Module `core` defines the traits implemented by every map variant
//! and by their per-thread handles.

use std::borrow::Borrow;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed weakly-consistent ascending cursor handed out by
/// [Reader::iter]. Every key live for the cursor's whole lifetime is
/// yielded exactly once; keys inserted or removed mid-flight may or
/// may not show up.
pub type IndexIter<'a, K, V> = Box<dyn Iterator<Item = (K, V)> + 'a>;

/// Read operations over a concurrent ordered map.
///
/// Implemented by the map types themselves and by the cheap per-thread
/// handles returned from their `to_handle()` constructors. Handles are
/// the intended entry point under multi-threading, they carry the
/// thread's statistics slot and, for the splaying variants, the
/// thread's random source.
pub trait Reader<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Get a clone of the value for `key`, if a live entry exists.
    fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized;

    /// Return a weakly-consistent ascending iterator over the live
    /// entries.
    fn iter(&mut self) -> IndexIter<'_, K, V>;

    /// Number of live entries, weakly consistent under concurrency.
    fn len(&self) -> usize;

    /// Whether the map holds no live entry, weakly consistent.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write operations over a concurrent ordered map.
pub trait Writer<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    /// Insert `{key, value}` only if no live entry exists for `key`.
    /// Return a clone of the existing value otherwise, leaving the map
    /// unchanged.
    fn set_if_absent(&mut self, key: K, value: V) -> Option<V>;

    /// Logically delete the entry for `key`, returning a clone of the
    /// removed value. Physical unlinking of the node is scheduled but
    /// not required to have happened on return.
    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized;
}
