// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use reflow::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn row(values: Vec<Value>) -> Row {
    Row::from_values(values)
}

fn purchases() -> Vec<Change> {
    let mut changes = Vec::new();
    for t in 1..=8u64 {
        for customer in 0..4i64 {
            changes.push(Change::insert(row(values![customer, (t as i64) * 10 + customer]), t));
        }
        if t % 3 == 0 {
            changes.push(Change::retract(row(values![1, (t as i64 - 1) * 10 + 1]), t));
        }
    }
    changes
}

/// Total spent per customer
fn describe(pipeline: &mut Pipeline, sink: impl Sink) {
    pipeline
        .collection("purchases", purchases())
        .reduce(vec![0], vec![Reducer::Sum(1), Reducer::Count])
        .sink(sink);
}

fn net(changes: Vec<Change>) -> Vec<(Vec<Value>, Diff)> {
    let mut totals = BTreeMap::new();
    for change in changes {
        *totals.entry(change.row.values().to_vec()).or_insert(0) += change.diff;
    }
    totals.into_iter().filter(|(_, diff)| *diff != 0).collect()
}

fn conf(workers: usize) -> ReflowConf {
    ReflowConf {
        workers,
        poll_interval: 1,
        checkpoint_interval: 0,
        ..Default::default()
    }
}

#[test]
fn checkpoint_transparency_test() {
    let (sink, uninterrupted) = MemorySink::new("totals");
    let mut reference = Pipeline::with_conf(conf(2)).with_logger(ReflowConf::quiet_logger());
    describe(&mut reference, sink);
    let mut reference = reference.build().unwrap();
    reference.run().unwrap();

    let storage = MemoryStorage::new();
    let (sink, before) = MemorySink::new("totals");
    let mut first = Pipeline::with_conf(conf(2))
        .with_storage(storage.clone())
        .with_logger(ReflowConf::quiet_logger());
    describe(&mut first, sink);
    let mut first = first.build().unwrap();
    let summary = first.run_until(Timestamp(4)).unwrap();
    assert_eq!(summary.closed, Frontier::at(Timestamp(5)));
    assert_eq!(summary.checkpoints, 1);
    drop(first);

    let (sink, after) = MemorySink::new("totals");
    let mut second = Pipeline::with_conf(conf(2))
        .with_storage(storage)
        .with_logger(ReflowConf::quiet_logger());
    describe(&mut second, sink);
    let mut second = second.build().unwrap();
    assert_eq!(second.closed(), Frontier::at(Timestamp(5)));
    second.run().unwrap();

    // restored and continued state matches the state of the uninterrupted run
    let state = second.state_summary();
    assert!(state.values().any(|entries| *entries > 0));
    assert_eq!(state, reference.state_summary());
    assert_eq!(second.state_entries(), reference.state_entries());

    assert!(after.batches().iter().all(|(time, _)| *time > Timestamp(4)));
    let mut resumed = before.changes();
    resumed.extend(after.changes());
    assert_eq!(net(resumed), net(uninterrupted.changes()));
    for t in 1..=8 {
        let expected: Vec<Change> = uninterrupted
            .batches()
            .into_iter()
            .filter(|(time, _)| *time == Timestamp(t))
            .flat_map(|(_, changes)| changes)
            .collect();
        let delivered: Vec<Change> = before
            .batches()
            .into_iter()
            .chain(after.batches())
            .filter(|(time, _)| *time == Timestamp(t))
            .flat_map(|(_, changes)| changes)
            .collect();
        assert_eq!(net(expected), net(delivered), "output at {} differs", t);
    }
}

#[test]
fn worker_count_mismatch_test() {
    let storage = MemoryStorage::new();
    let (sink, _) = MemorySink::new("totals");
    let mut first = Pipeline::with_conf(conf(2))
        .with_storage(storage.clone())
        .with_logger(ReflowConf::quiet_logger());
    describe(&mut first, sink);
    first.build().unwrap().run_until(Timestamp(2)).unwrap();

    let (sink, _) = MemorySink::new("totals");
    let mut second = Pipeline::with_conf(conf(3))
        .with_storage(storage)
        .with_logger(ReflowConf::quiet_logger());
    describe(&mut second, sink);
    assert!(matches!(second.build(), Err(Error::CheckpointMismatch { .. })));
}

#[test]
fn file_recovery_fallback_test() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("totals.tsv");
    let conf = ReflowConf {
        persistence: PersistenceMode::File,
        checkpoint_dir: dir.path().join("checkpoints"),
        checkpoint_change_threshold: 1,
        checkpoints_retained: 4,
        ..conf(1)
    };

    let mut first = Pipeline::with_conf(conf.clone()).with_logger(ReflowConf::quiet_logger());
    describe(&mut first, LocalFileSink::new(&output).unwrap());
    let summary = first.build().unwrap().run().unwrap();
    assert!(summary.checkpoints >= 2);
    let written = std::fs::read_to_string(&output).unwrap();
    assert!(!written.is_empty());

    // tear the newest checkpoint
    let storage = FileStorage::new(dir.path().join("checkpoints")).unwrap();
    let ids = storage.list().unwrap();
    assert_eq!(ids.len(), 4);
    let newest = *ids.last().unwrap();
    let path = storage.dir().join(format!("checkpoint-{:020}.ckpt", newest));
    std::fs::write(&path, b"torn").unwrap();

    let mut second = Pipeline::with_conf(conf).with_logger(ReflowConf::quiet_logger());
    describe(&mut second, LocalFileSink::new(&output).unwrap());
    let mut second = second.build().unwrap();
    assert!(!second.closed().is_closed());
    let summary = second.run().unwrap();
    assert!(summary.steps > 0);
    assert!(summary.closed.is_closed());
    // times replayed from the older checkpoint are not written twice
    assert_eq!(std::fs::read_to_string(&output).unwrap(), written);
}

#[test]
fn no_valid_checkpoint_test() {
    let dir = TempDir::new().unwrap();
    let mut storage = FileStorage::new(dir.path()).unwrap();
    storage.write(1, b"garbage").unwrap();

    let conf = ReflowConf {
        persistence: PersistenceMode::File,
        checkpoint_dir: dir.path().to_path_buf(),
        ..conf(1)
    };
    let mut pipeline = Pipeline::with_conf(conf).with_logger(ReflowConf::quiet_logger());
    let (sink, _) = MemorySink::new("totals");
    describe(&mut pipeline, sink);
    assert!(matches!(pipeline.build(), Err(Error::Corruption { .. })));
}
