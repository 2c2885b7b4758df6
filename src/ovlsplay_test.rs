use rand::{rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;
use std::thread;

use super::*;

fn eager_config() -> Config {
    let mut config = Config::default();
    config.set_thread_num(1);
    config.set_inv_splay_prob(1);
    config.set_splay_thresholds(1.0, 1.0);
    config.set_max_depth(2);
    config
}

#[test]
fn test_ovl_layout() {
    let layout = OvlLayout::new(8);
    assert_eq!(layout.shrink_unit, 1 << 3);
    assert_eq!(layout.grow_unit, 1 << 11);

    let ovl = 0_u64;
    // a completed shrink is visible.
    let shrunk = ovl.wrapping_add(layout.shrink_unit);
    assert!(layout.has_shrunk_or_unlinked(ovl, shrunk));
    // a completed grow is ignored.
    let grown = ovl.wrapping_add(layout.grow_unit);
    assert!(!layout.has_shrunk_or_unlinked(ovl, grown));
    // an in-progress shrink is visible, an in-progress grow is not.
    assert!(layout.has_shrunk_or_unlinked(ovl, ovl | SHRINK_LOCK));
    assert!(!layout.has_shrunk_or_unlinked(ovl, ovl | GROW_LOCK));
    // the terminal sentinel is visible.
    assert!(layout.has_shrunk_or_unlinked(ovl, UNLINKED));
    assert!(is_unlinked(UNLINKED));
    assert!(is_shrinking_or_unlinked(UNLINKED));
    assert!(!is_changing(UNLINKED));
}

#[test]
fn test_version_brackets() {
    let node: Node<i64, i64> = Node {
        key: Some(1),
        version: AtomicU64::new(0),
        value: Atomic::null(),
        left: Atomic::null(),
        right: Atomic::null(),
        parent: Atomic::null(),
        lock: Mutex::new(()),
        counter: AtomicU64::new(0),
    };
    let layout = OvlLayout::new(8);

    node.begin_shrink();
    assert!(is_shrinking_or_unlinked(node.version.load(Relaxed)));
    assert!(is_changing(node.version.load(Relaxed)));
    node.end_shrink(layout);
    assert!(!is_changing(node.version.load(Relaxed)));
    assert_eq!(node.version.load(Relaxed), layout.shrink_unit);

    node.begin_grow();
    assert!(is_changing(node.version.load(Relaxed)));
    assert!(!is_shrinking_or_unlinked(node.version.load(Relaxed)));
    node.end_grow(layout);
    assert_eq!(node.version.load(Relaxed), layout.shrink_unit + layout.grow_unit);
}

#[test]
fn test_sequential() {
    let index: Box<OvlSplay<i64, i64>> = OvlSplay::new("test-ovlsplay");
    for key in [5, 3, 8, 1, 4, 7, 9] {
        assert_eq!(index.set_if_absent(key, key), None);
    }
    assert_eq!(index.get(&4), Some(4));
    assert_eq!(index.remove(&3), Some(3));
    assert_eq!(index.get(&3), None);
    assert_eq!(index.len(), 6);

    let keys: Vec<i64> = index.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1, 4, 5, 7, 8, 9]);
    assert!(index.validate().is_ok());
}

#[test]
fn test_set_if_absent() {
    let index: Box<OvlSplay<i64, char>> = OvlSplay::new("test-ovlsplay");
    assert_eq!(index.set_if_absent(10, 'a'), None);
    assert_eq!(index.set_if_absent(10, 'b'), Some('a'));
    assert_eq!(index.get(&10), Some('a'));
}

#[test]
fn test_remove_idempotent() {
    let index: Box<OvlSplay<i64, i64>> = OvlSplay::new("test-ovlsplay");
    index.set_if_absent(1, 100);
    assert_eq!(index.remove(&1), Some(100));
    assert_eq!(index.remove(&1), None);
}

#[test]
fn test_revive_routing_node() {
    let index: Box<OvlSplay<i64, i64>> = OvlSplay::new("test-ovlsplay");
    for key in [5, 2, 8, 1, 3, 7, 9] {
        index.set_if_absent(key, key * 10);
    }
    // two children, the removal leaves a routing node behind.
    assert_eq!(index.remove(&5), Some(50));
    assert_eq!(index.get(&5), None);
    assert_eq!(index.set_if_absent(5, 55), None);
    assert_eq!(index.get(&5), Some(55));
    assert!(index.validate().is_ok());
}

#[test]
fn test_random_against_btreemap() {
    let index: Box<OvlSplay<u32, u32>> =
        OvlSplay::with_config("test-ovlsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    let mut refmap: BTreeMap<u32, u32> = BTreeMap::new();
    let mut rng = SmallRng::seed_from_u64(0xFACADE);

    for i in 0..20_000 {
        let key = rng.gen_range(0..512_u32);
        match rng.gen_range(0..4) {
            0 | 1 => {
                assert_eq!(handle.get(&key), refmap.get(&key).cloned(), "get {}", key);
            }
            2 => {
                let expected = refmap.get(&key).cloned();
                assert_eq!(handle.set_if_absent(key, i), expected, "set {}", key);
                refmap.entry(key).or_insert(i);
            }
            _ => {
                assert_eq!(handle.remove(&key), refmap.remove(&key), "remove {}", key);
            }
        }
    }
    assert_eq!(index.len(), refmap.len());
    let collected: Vec<(u32, u32)> = index.iter().collect();
    let expected: Vec<(u32, u32)> = refmap.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(collected, expected);
    assert!(index.validate().is_ok());
}

#[test]
fn test_splay_flattens_monotone_input() {
    let index: Box<OvlSplay<i64, i64>> =
        OvlSplay::with_config("test-ovlsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    for key in 1..=1000 {
        assert_eq!(handle.set_if_absent(key, key), None);
    }
    let mut rng = SmallRng::seed_from_u64(29);
    for _ in 0..20_000 {
        let key = rng.gen_range(1..=1000);
        assert_eq!(handle.get(&key), Some(key));
    }
    let stats = index.validate().unwrap();
    assert_eq!(stats.to_entries(), 1000);
    assert!(
        stats.to_depths().unwrap().to_max() < 100,
        "deepest path {} after splaying",
        stats.to_depths().unwrap().to_max()
    );
}

fn bit_reverse(mut x: usize, bits: u32) -> usize {
    let mut r = 0;
    for _ in 0..bits {
        r = (r << 1) | (x & 1);
        x >>= 1;
    }
    r
}

#[test]
fn test_bit_reversal_teardown() {
    let index: Box<OvlSplay<usize, usize>> =
        OvlSplay::with_config("test-ovlsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    let n = 256;
    for key in 0..n {
        handle.set_if_absent(key, key);
    }
    for i in 0..n {
        let key = bit_reverse(i, 8);
        assert_eq!(handle.remove(&key), Some(key));
    }
    assert_eq!(index.len(), 0);
    let stats = index.validate().unwrap();
    assert_eq!(stats.to_entries(), 0);
    assert_eq!(stats.to_routing(), Some(0));
    assert_eq!(stats.to_nodes(), 0);
}

#[test]
fn test_concurrent_disjoint_ranges() {
    let mut config = Config::default();
    config.set_thread_num(4);
    let index: Box<OvlSplay<u32, u32>> = OvlSplay::with_config("test-ovlsplay", config).unwrap();

    thread::scope(|s| {
        for t in 0..4_u32 {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(t as usize).unwrap();
                let base = t * 1000;
                for key in base..base + 1000 {
                    assert_eq!(handle.set_if_absent(key, key), None);
                }
                for key in (base..base + 1000).step_by(2) {
                    assert_eq!(handle.remove(&key), Some(key));
                }
            });
        }
    });

    assert_eq!(index.len(), 2000);
    let stats = index.validate().unwrap();
    assert_eq!(stats.to_entries(), 2000);
}

#[test]
fn test_concurrent_mixed_small_domain() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::default();
    config.set_thread_num(4);
    config.set_max_depth(4);
    let index: Box<OvlSplay<u32, u32>> = OvlSplay::with_config("test-ovlsplay", config).unwrap();

    thread::scope(|s| {
        for t in 0..4_u64 {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(t as usize).unwrap();
                let mut rng = SmallRng::seed_from_u64(t + 211);
                for i in 0..25_000_u32 {
                    let key = rng.gen_range(0..64);
                    match rng.gen_range(0..4) {
                        0 | 1 => {
                            handle.get(&key);
                        }
                        2 => {
                            handle.set_if_absent(key, i);
                        }
                        _ => {
                            handle.remove(&key);
                        }
                    }
                }
            });
        }
    });

    let stats = index.validate().unwrap();
    assert_eq!(stats.to_entries(), index.len());
    assert_eq!(index.iter().count(), index.len());
}

#[test]
fn test_handle_iter() {
    let index: Box<OvlSplay<i64, i64>> = OvlSplay::new("test-ovlsplay");
    for key in [2, 1, 3] {
        index.set_if_absent(key, key * 10);
    }
    let mut handle = index.to_handle(0).unwrap();
    let entries: Vec<(i64, i64)> = handle.iter().collect();
    assert_eq!(entries, vec![(1, 10), (2, 20), (3, 30)]);
}

#[test]
fn test_clear() {
    let mut index: Box<OvlSplay<i64, i64>> = OvlSplay::new("test-ovlsplay");
    for key in 0..100 {
        index.set_if_absent(key, key);
    }
    index.clear();
    assert_eq!(index.len(), 0);
    assert_eq!(index.set_if_absent(1, 1), None);
    assert_eq!(index.get(&1), Some(1));
}
