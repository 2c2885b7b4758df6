use std::sync::atomic::Ordering::Relaxed;

use super::*;

#[test]
fn test_depth_histogram() {
    let mut depths: Depth = Default::default();
    for d in [3, 5, 5, 7, 9, 9, 9, 11] {
        depths.sample(d);
    }
    assert_eq!(depths.to_samples(), 8);
    assert_eq!(depths.to_min(), 3);
    assert_eq!(depths.to_max(), 11);
    assert_eq!(depths.to_mean(), 7);
    let percentiles = depths.to_percentiles();
    assert_eq!(percentiles.last().unwrap().1, 11);
    assert!(!depths.to_json_text().is_empty());
}

#[test]
fn test_empty_depth() {
    let depths: Depth = Default::default();
    assert_eq!(depths.to_samples(), 0);
    assert_eq!(depths.to_mean(), 0);
}

#[test]
fn test_sum_slots() {
    let slots: Vec<OpStats> = (0..3).map(|_| OpStats::default()).collect();
    slots[0].mark(&slots[0].gets);
    slots[1].mark(&slots[1].gets);
    slots[1].mark_n(&slots[1].traversed, 10);
    slots[2].mark(&slots[2].unlinks);
    slots[2].mark(&slots[2].failed_locks);

    let totals = sum_slots(&slots);
    assert_eq!(totals.gets, 2);
    assert_eq!(totals.traversed, 10);
    assert_eq!(totals.unlinks, 1);
    assert_eq!(totals.failed_locks, 1);
    assert_eq!(totals.accesses, 0);
    assert!(!format!("{}", totals).is_empty());
}

#[test]
fn test_stats_accessors() {
    let totals: OpTotals = Default::default();
    let stats = Stats::new_partial("an-index", 10, 12, 64, totals.clone());
    assert_eq!(stats.to_name(), "an-index".to_string());
    assert_eq!(stats.to_entries(), 10);
    assert_eq!(stats.to_nodes(), 12);
    assert_eq!(stats.to_node_size(), 64);
    assert_eq!(stats.to_routing(), None);
    assert!(stats.to_depths().is_none());
    assert_eq!(stats.to_ops(), totals);

    let mut depths: Depth = Default::default();
    depths.sample(4);
    let stats = Stats::new_full("an-index", 10, 2, 12, 64, Default::default(), depths);
    assert_eq!(stats.to_routing(), Some(2));
    assert_eq!(stats.to_depths().unwrap().to_max(), 4);
}

#[test]
fn test_slot_marks_are_relaxed_counters() {
    let slot: OpStats = Default::default();
    for _ in 0..100 {
        slot.mark(&slot.accesses);
    }
    assert_eq!(slot.accesses.load(Relaxed), 100);
}
