// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use proptest::prelude::*;
use reflow::prelude::*;
use std::collections::BTreeMap;

type Net = BTreeMap<Vec<Value>, Diff>;

fn changes(rows: &[(i64, i64, u64, bool)]) -> Vec<Change> {
    let mut changes = Vec::new();
    for (key, value, time, retract) in rows {
        let row = Row::from_values(values![*key, *value]);
        changes.push(Change::insert(row.clone(), *time));
        if *retract {
            changes.push(Change::retract(row, *time + 1));
        }
    }
    changes
}

fn net(changes: &[Change]) -> Net {
    let mut net = Net::new();
    for change in changes {
        *net.entry(change.row.values().to_vec()).or_insert(0) += change.diff;
    }
    net.retain(|_, diff| *diff != 0);
    net
}

fn rows() -> impl Strategy<Value = Vec<(i64, i64, u64, bool)>> {
    prop::collection::vec((0..4i64, 0..6i64, 1..6u64, any::<bool>()), 0..24)
}

fn pipeline(workers: usize) -> Pipeline {
    let conf = ReflowConf {
        workers,
        poll_interval: 1,
        ..Default::default()
    };
    Pipeline::with_conf(conf).with_logger(ReflowConf::quiet_logger())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn join_matches_nested_loops(left in rows(), right in rows(), workers in 1..4usize) {
        let left = changes(&left);
        let right = changes(&right);

        let mut expected = Net::new();
        for (l, dl) in net(&left) {
            for (r, dr) in net(&right) {
                if l[0] == r[0] {
                    let mut joined = l.clone();
                    joined.extend(r.iter().cloned());
                    *expected.entry(joined).or_insert(0) += dl * dr;
                }
            }
        }
        expected.retain(|_, diff| *diff != 0);

        let mut pipeline = pipeline(workers);
        let (sink, reader) = MemorySink::new("joined");
        let l = pipeline.collection("left", left);
        let r = pipeline.collection("right", right);
        l.join(&r, JoinSpec::inner(vec![0], vec![0])).sink(sink);
        pipeline.build().unwrap().run().unwrap();

        let actual: Net = reader.values().into_iter().collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn retracted_inputs_leave_nothing(rows in rows(), workers in 1..4usize) {
        let mut input = Vec::new();
        for (key, value, time, _) in &rows {
            let row = Row::from_values(values![*key, *value]);
            input.push(Change::insert(row.clone(), *time));
            input.push(Change::retract(row, *time + 3));
        }

        let mut pipeline = pipeline(workers);
        let source = pipeline.collection("rows", input);
        let (counts, count_reader) = MemorySink::new("counts");
        source.count(vec![0]).sink(counts);
        let (distinct, distinct_reader) = MemorySink::new("distinct");
        source.distinct().sink(distinct);
        let (joined, join_reader) = MemorySink::new("joined");
        source
            .join(&source, JoinSpec::inner(vec![0], vec![0]))
            .sink(joined);
        pipeline.build().unwrap().run().unwrap();

        prop_assert!(count_reader.values().is_empty());
        prop_assert!(distinct_reader.values().is_empty());
        prop_assert!(join_reader.values().is_empty());
    }
}
