// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use proptest::prelude::*;
use reflow_state::{KeyedMultiset, OrderedIndex, StateId, StateStore, ValueState};

fn join_state() -> StateId {
    StateId::new("n3", "left")
}
fn window_state() -> StateId {
    StateId::new("n4", "windows")
}
fn watermark_state() -> StateId {
    StateId::new("n4", "watermark")
}

#[test]
fn streaming_state_restore_test() {
    let mut store = StateStore::new();
    store
        .register::<KeyedMultiset<u64, String>>(join_state())
        .unwrap();
    store
        .register::<OrderedIndex<(i64, i64), u64>>(window_state())
        .unwrap();
    store.register::<ValueState<i64>>(watermark_state()).unwrap();

    {
        let left = store
            .get_mut::<KeyedMultiset<u64, String>>(&join_state())
            .unwrap();
        left.update(1, "a".to_string(), 1);
        left.update(1, "b".to_string(), 2);
        left.update(2, "c".to_string(), 1);
    }
    store
        .get_mut::<OrderedIndex<(i64, i64), u64>>(&window_state())
        .unwrap()
        .put((10, 0), 5);
    store
        .get_mut::<ValueState<i64>>(&watermark_state())
        .unwrap()
        .put(100);

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.len(), 3);

    let mut restored = StateStore::restore(snapshot);
    assert_eq!(restored.unclaimed().len(), 3);
    restored
        .register::<KeyedMultiset<u64, String>>(join_state())
        .unwrap();
    restored
        .register::<OrderedIndex<(i64, i64), u64>>(window_state())
        .unwrap();
    restored
        .register::<ValueState<i64>>(watermark_state())
        .unwrap();
    assert!(restored.unclaimed().is_empty());

    let left = restored
        .get::<KeyedMultiset<u64, String>>(&join_state())
        .unwrap();
    assert_eq!(left.count(&1), 3);
    assert_eq!(left.multiplicity(&2, &"c".to_string()), 1);
    assert_eq!(
        restored
            .get::<ValueState<i64>>(&watermark_state())
            .unwrap()
            .get(),
        Some(&100)
    );
    assert_eq!(restored.entries(), store.entries());
}

#[test]
fn restore_kind_mismatch_test() {
    let mut store = StateStore::new();
    store.register::<ValueState<i64>>(watermark_state()).unwrap();
    let snapshot = store.snapshot().unwrap();

    let mut restored = StateStore::restore(snapshot);
    assert!(restored
        .register::<KeyedMultiset<u64, u64>>(watermark_state())
        .is_err());
}

proptest! {
    #[test]
    fn multiset_cancellation(updates in prop::collection::vec((0u8..4, 0u8..4, -3i64..4), 0..64)) {
        let mut set: KeyedMultiset<u8, u8> = KeyedMultiset::new();
        for (k, v, d) in &updates {
            set.update(*k, *v, *d);
        }
        for (k, v, d) in &updates {
            set.update(*k, *v, -*d);
        }
        prop_assert!(set.is_empty());
        prop_assert_eq!(set.values(), 0);
    }
}
