use rand::{rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;
use std::thread;

use super::*;

#[test]
fn test_name() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    assert_eq!(index.to_name(), "test-lotree".to_string());
    assert!(index.validate().is_ok());
}

#[test]
fn test_sequential() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
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
    let index: Box<LoTree<i64, char>> = LoTree::new("test-lotree");
    assert_eq!(index.set_if_absent(10, 'a'), None);
    assert_eq!(index.set_if_absent(10, 'b'), Some('a'));
    assert_eq!(index.get(&10), Some('a'));
}

#[test]
fn test_remove_idempotent() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    index.set_if_absent(1, 100);
    assert_eq!(index.remove(&1), Some(100));
    assert_eq!(index.remove(&1), None);
}

#[test]
fn test_reinsert_after_remove() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in [5, 2, 8, 1, 3, 7, 9] {
        index.set_if_absent(key, key * 10);
    }
    // two children, exercises successor relocation.
    assert_eq!(index.remove(&5), Some(50));
    assert_eq!(index.get(&5), None);
    assert_eq!(index.set_if_absent(5, 55), None);
    assert_eq!(index.get(&5), Some(55));
    assert_eq!(index.len(), 7);
    assert!(index.validate().is_ok());
}

#[test]
fn test_removal_is_physical() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in 0..100 {
        index.set_if_absent(key, key);
    }
    for key in 0..100 {
        assert_eq!(index.remove(&key), Some(key));
        // the tree never retains routing nodes for removed keys.
        let stats = index.validate().unwrap();
        assert_eq!(stats.to_nodes(), stats.to_entries());
    }
    assert_eq!(index.len(), 0);
    assert_eq!(index.validate().unwrap().to_nodes(), 0);
}

#[test]
fn test_remove_root_with_two_children() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in [50, 25, 75, 10, 30, 60, 90] {
        index.set_if_absent(key, key);
    }
    assert_eq!(index.remove(&50), Some(50));
    let keys: Vec<i64> = index.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![10, 25, 30, 60, 75, 90]);
    assert!(index.validate().is_ok());
}

#[test]
fn test_random_against_btreemap() {
    let index: Box<LoTree<u32, u32>> = LoTree::new("test-lotree");
    let mut refmap: BTreeMap<u32, u32> = BTreeMap::new();
    let mut rng = SmallRng::seed_from_u64(0x10CA1);

    for i in 0..20_000 {
        let key = rng.gen_range(0..512_u32);
        match rng.gen_range(0..4) {
            0 | 1 => {
                assert_eq!(index.get(&key), refmap.get(&key).cloned(), "get {}", key);
            }
            2 => {
                let expected = refmap.get(&key).cloned();
                assert_eq!(index.set_if_absent(key, i), expected, "set {}", key);
                refmap.entry(key).or_insert(i);
            }
            _ => {
                assert_eq!(index.remove(&key), refmap.remove(&key), "remove {}", key);
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
fn test_monotone_then_reverse_teardown() {
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in 1..=500 {
        assert_eq!(index.set_if_absent(key, key), None);
    }
    for key in (1..=500).rev() {
        assert_eq!(index.remove(&key), Some(key));
    }
    assert_eq!(index.len(), 0);
    assert_eq!(index.validate().unwrap().to_nodes(), 0);
}

#[test]
fn test_concurrent_disjoint_ranges() {
    let mut config = Config::default();
    config.set_thread_num(4);
    let index: Box<LoTree<u32, u32>> = LoTree::with_config("test-lotree", config).unwrap();

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
    assert_eq!(stats.to_nodes(), 2000);
}

#[test]
fn test_concurrent_insert_remove_duel() {
    let mut config = Config::default();
    config.set_thread_num(2);
    let index: Box<LoTree<u32, u32>> = LoTree::with_config("test-lotree", config).unwrap();

    thread::scope(|s| {
        {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(0).unwrap();
                for i in 0..10_000 {
                    handle.set_if_absent(7, i);
                }
            });
        }
        {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(1).unwrap();
                for _ in 0..10_000 {
                    handle.remove(&7);
                }
            });
        }
    });

    let stats = index.validate().unwrap();
    let present = index.get(&7).is_some();
    assert_eq!(stats.to_entries(), if present { 1 } else { 0 });
}

#[test]
fn test_concurrent_mixed_small_domain() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::default();
    config.set_thread_num(4);
    let index: Box<LoTree<u32, u32>> = LoTree::with_config("test-lotree", config).unwrap();

    thread::scope(|s| {
        for t in 0..4_u64 {
            let index = &index;
            s.spawn(move || {
                let mut handle = index.to_handle(t as usize).unwrap();
                let mut rng = SmallRng::seed_from_u64(t + 307);
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
    let index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in [2, 1, 3] {
        index.set_if_absent(key, key * 10);
    }
    let mut handle = index.to_handle(0).unwrap();
    handle.remove(&2);
    let entries: Vec<(i64, i64)> = handle.iter().collect();
    assert_eq!(entries, vec![(1, 10), (3, 30)]);
}

#[test]
fn test_clear() {
    let mut index: Box<LoTree<i64, i64>> = LoTree::new("test-lotree");
    for key in 0..100 {
        index.set_if_absent(key, key);
    }
    index.clear();
    assert_eq!(index.len(), 0);
    assert_eq!(index.get(&10), None);
    assert_eq!(index.set_if_absent(1, 1), None);
    assert_eq!(index.get(&1), Some(1));
    assert!(index.validate().is_ok());
}
