use rand::{rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;
use std::thread;

use super::*;

// splay on every access, no depth suppression to speak of.
fn eager_config() -> Config {
    let mut config = Config::default();
    config.set_thread_num(1);
    config.set_inv_splay_prob(1);
    config.set_splay_thresholds(1.0, 1.0);
    config.set_max_depth(2);
    config
}

#[test]
fn test_name() {
    let index: Box<CfSplay<i64, i64>> = CfSplay::new("test-cfsplay");
    assert_eq!(index.to_name(), "test-cfsplay".to_string());
    assert!(index.validate().is_ok());
}

#[test]
fn test_sequential() {
    let index: Box<CfSplay<i64, i64>> = CfSplay::new("test-cfsplay");
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
    let index: Box<CfSplay<i64, char>> = CfSplay::new("test-cfsplay");
    assert_eq!(index.set_if_absent(10, 'a'), None);
    assert_eq!(index.set_if_absent(10, 'b'), Some('a'));
    assert_eq!(index.get(&10), Some('a'));
}

#[test]
fn test_remove_idempotent() {
    let index: Box<CfSplay<i64, i64>> = CfSplay::new("test-cfsplay");
    index.set_if_absent(1, 100);
    assert_eq!(index.remove(&1), Some(100));
    assert_eq!(index.remove(&1), None);
}

#[test]
fn test_splay_flattens_monotone_input() {
    let index: Box<CfSplay<i64, i64>> =
        CfSplay::with_config("test-cfsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    for key in 1..=1000 {
        assert_eq!(handle.set_if_absent(key, key), None);
    }
    // random accesses drag hot nodes up; the pathological chain
    // collapses well below the input length.
    let mut rng = SmallRng::seed_from_u64(13);
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

#[test]
fn test_order_preserved_under_splay() {
    let index: Box<CfSplay<u32, u32>> =
        CfSplay::with_config("test-cfsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    let mut rng = SmallRng::seed_from_u64(17);
    for _ in 0..5000 {
        let key = rng.gen_range(0..256);
        handle.set_if_absent(key, key);
    }
    for _ in 0..20_000 {
        let key = rng.gen_range(0..256);
        handle.get(&key);
    }
    let stats = index.validate().unwrap();
    let keys: Vec<u32> = index.iter().map(|(k, _)| k).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(keys, sorted);
    assert_eq!(keys.len(), stats.to_entries());
}

#[test]
fn test_random_against_btreemap() {
    let index: Box<CfSplay<u32, u32>> =
        CfSplay::with_config("test-cfsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    let mut refmap: BTreeMap<u32, u32> = BTreeMap::new();
    let mut rng = SmallRng::seed_from_u64(0xBADCAB);

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
    let index: Box<CfSplay<usize, usize>> =
        CfSplay::with_config("test-cfsplay", eager_config()).unwrap();
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
fn test_tombstones_stay_bounded() {
    let index: Box<CfSplay<u32, u32>> =
        CfSplay::with_config("test-cfsplay", eager_config()).unwrap();
    let mut handle = index.to_handle(0).unwrap();
    let mut rng = SmallRng::seed_from_u64(23);
    for i in 0..10_000_u32 {
        let key = rng.gen_range(0..100);
        if rng.gen_bool(0.5) {
            handle.set_if_absent(key, i);
        } else {
            handle.remove(&key);
        }
    }
    let stats = index.validate().unwrap();
    // steady mixed load must not accumulate routing nodes.
    assert!(
        stats.to_routing().unwrap() < 500,
        "{} routing nodes left behind",
        stats.to_routing().unwrap()
    );
}

#[test]
fn test_concurrent_disjoint_ranges() {
    let mut config = Config::default();
    config.set_thread_num(4);
    let index: Box<CfSplay<u32, u32>> = CfSplay::with_config("test-cfsplay", config).unwrap();

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
    config.set_inv_splay_prob(2);
    config.set_max_depth(4);
    let index: Box<CfSplay<u32, u32>> = CfSplay::with_config("test-cfsplay", config).unwrap();

    thread::scope(|s| {
        for t in 0..4_u64 {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(t as usize).unwrap();
                let mut rng = SmallRng::seed_from_u64(t + 101);
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
    let index: Box<CfSplay<i64, i64>> = CfSplay::new("test-cfsplay");
    for key in [2, 1, 3] {
        index.set_if_absent(key, key * 10);
    }
    let mut handle = index.to_handle(0).unwrap();
    let entries: Vec<(i64, i64)> = handle.iter().collect();
    assert_eq!(entries, vec![(1, 10), (2, 20), (3, 30)]);
}

#[test]
fn test_clear() {
    let mut index: Box<CfSplay<i64, i64>> = CfSplay::new("test-cfsplay");
    for key in 0..100 {
        index.set_if_absent(key, key);
    }
    index.clear();
    assert_eq!(index.len(), 0);
    assert_eq!(index.set_if_absent(1, 1), None);
    assert_eq!(index.get(&1), Some(1));
}
