// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use criterion::{black_box, criterion_group, criterion_main, Bencher, Criterion};
use reflow::{
    data::consolidate,
    prelude::*,
};

const ROWS: i64 = 10_000;
const TIMES: u64 = 10;

fn rows() -> Vec<Change> {
    (0..ROWS)
        .map(|i| {
            let row = Row::from_values(values![i % 100, i]);
            Change::insert(row, (i as u64 % TIMES) + 1)
        })
        .collect()
}

fn reflow_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("reflow_operators");
    group.sample_size(10);
    group.bench_function("consolidate 10k changes", consolidate_changes);
    group.bench_function("grouped sum 1 worker", |b| grouped_sum(b, 1));
    group.bench_function("grouped sum 4 workers", |b| grouped_sum(b, 4));
    group.bench_function("self join 1 worker", |b| self_join(b, 1));
    group.bench_function("self join 4 workers", |b| self_join(b, 4));
    group.finish()
}

fn consolidate_changes(b: &mut Bencher) {
    let mut changes = rows();
    changes.extend(rows().into_iter().map(Change::negate));
    b.iter(|| {
        let mut changes = changes.clone();
        consolidate(&mut changes);
        black_box(changes)
    });
}

fn run(pipeline: Pipeline) {
    let mut pipeline = pipeline.build().unwrap();
    black_box(pipeline.run().unwrap());
}

fn pipeline(workers: usize) -> Pipeline {
    let conf = ReflowConf {
        workers,
        poll_interval: 1,
        ..Default::default()
    };
    Pipeline::with_conf(conf).with_logger(ReflowConf::quiet_logger())
}

fn grouped_sum(b: &mut Bencher, workers: usize) {
    b.iter(|| {
        let mut pipeline = pipeline(workers);
        let (sink, _) = MemorySink::new("sums");
        pipeline
            .collection("rows", rows())
            .reduce(vec![0], vec![Reducer::Sum(1), Reducer::Count])
            .sink(sink);
        run(pipeline);
    });
}

fn self_join(b: &mut Bencher, workers: usize) {
    b.iter(|| {
        let mut pipeline = pipeline(workers);
        let (sink, _) = MemorySink::new("pairs");
        let source = pipeline.collection("rows", rows());
        source
            .filter(|r: &Row| r.values()[1] < Value::from(2_000i64))
            .join(&source, JoinSpec::inner(vec![0], vec![0]))
            .count(vec![0])
            .sink(sink);
        run(pipeline);
    });
}

criterion_group!(benches, reflow_operators);
criterion_main!(benches);
