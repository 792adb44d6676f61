// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

mod reducer;

pub use reducer::{Combiner, Reducer};

pub(crate) use reducer::GroupState;

use crate::{
    data::{Change, Key, Row, Value},
    error::{EvalError, ReflowResult, StateResult},
    stream::{
        operator::{Operator, OperatorContext},
        time::Frontier,
    },
};
use reflow_state::{StateId, StateStore, ValueIndex};
use std::collections::BTreeSet;

type Groups = ValueIndex<Vec<Value>, GroupState>;
type Emitted = ValueIndex<Vec<Value>, Row>;
/// Error rows a group reported with its current aggregate, with their messages
type Failed = ValueIndex<Vec<Value>, Vec<(Row, String)>>;

/// Grouped aggregation.
///
/// Changes update the accumulators of their group right away, while the
/// aggregate rows are emitted once per step for every group that changed.
/// A group first retracts the row it emitted before and then inserts its
/// new aggregate, so consumers never observe intermediate values of a step.
/// Aggregates that fail to evaluate follow the same rule on the error
/// output, where they are withdrawn once the group recovers or changes.
pub struct Reduce {
    group_by: Vec<usize>,
    reducers: Vec<Reducer>,
    groups: StateId,
    emitted: StateId,
    failed: StateId,
    dirty: BTreeSet<Vec<Value>>,
}

impl Reduce {
    pub fn new(path: &str, group_by: Vec<usize>, reducers: Vec<Reducer>) -> Self {
        Reduce {
            group_by,
            reducers,
            groups: StateId::new(path, "groups"),
            emitted: StateId::new(path, "emitted"),
            failed: StateId::new(path, "failed"),
            dirty: BTreeSet::new(),
        }
    }

    fn flush(&mut self, group: Vec<Value>, ctx: &mut OperatorContext) -> ReflowResult<()> {
        let time = ctx.timestamp();
        let (next, errors) = {
            let groups = ctx.state().get_mut::<Groups>(&self.groups)?;
            match groups.get(&group) {
                Some(state) if state.count > 0 => {
                    let (aggregates, errors) = state.outputs(&self.reducers);
                    let mut values = group.clone();
                    values.extend(aggregates);
                    (Some(Row::new(Key::for_values(&group), values)), errors)
                }
                Some(state) => {
                    if state.is_empty(&self.reducers) {
                        groups.remove(&group);
                    }
                    (None, Vec::new())
                }
                None => (None, Vec::new()),
            }
        };

        let failures: Vec<(Row, String)> = match &next {
            Some(row) => errors
                .into_iter()
                .map(|e| (row.clone(), e.message().to_string()))
                .collect(),
            None => Vec::new(),
        };
        let withdrawn = {
            let failed = ctx.state().get_mut::<Failed>(&self.failed)?;
            if failures.is_empty() {
                failed.remove(&group)
            } else {
                failed.put(group.clone(), failures.clone())
            }
        };
        let withdrawn = withdrawn.unwrap_or_default();
        if withdrawn != failures {
            for (row, message) in withdrawn {
                ctx.report_row_error(row, EvalError::new(message), -1);
            }
            for (row, message) in failures {
                ctx.report_row_error(row, EvalError::new(message), 1);
            }
        }

        let emitted = ctx.state().get_mut::<Emitted>(&self.emitted)?;
        let previous = match &next {
            Some(row) => emitted.put(group, row.clone()),
            None => emitted.remove(&group),
        };
        if previous == next {
            return Ok(());
        }
        if let Some(row) = previous {
            ctx.output(Change::new(row, time, -1));
        }
        if let Some(row) = next {
            ctx.output(Change::new(row, time, 1));
        }
        Ok(())
    }
}

impl Operator for Reduce {
    fn register_states(&self, state: &mut StateStore) -> StateResult<()> {
        state.register::<Groups>(self.groups.clone())?;
        state.register::<Emitted>(self.emitted.clone())?;
        state.register::<Failed>(self.failed.clone())?;
        Ok(())
    }

    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let group = match change.row.project(&self.group_by) {
            Ok(group) => group,
            Err(err) => {
                ctx.report_error(change, err);
                return Ok(());
            }
        };

        let groups = ctx.state().get_mut::<Groups>(&self.groups)?;
        let prepared = match groups.get(&group) {
            Some(state) => state.prepare(&self.reducers, &change.row, change.diff),
            None => GroupState::new(&self.reducers).prepare(&self.reducers, &change.row, change.diff),
        };
        match prepared {
            Ok(updates) => {
                let reducers = &self.reducers;
                groups.rmw(
                    group.clone(),
                    || GroupState::new(reducers),
                    |state| state.apply(updates, change.diff),
                );
                self.dirty.insert(group);
            }
            Err(err) => ctx.report_error(change, err),
        }
        Ok(())
    }

    fn on_frontier_advance(
        &mut self,
        _frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        for group in std::mem::take(&mut self.dirty) {
            self.flush(group, ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Diff, Timestamp},
        stream::operator::test_utils::Harness,
        values,
    };

    fn at(time: u64) -> Frontier {
        Frontier::at(Timestamp(time + 1))
    }

    #[test]
    fn sum_revision_test() {
        // group-by sum over all rows
        let mut reduce = Reduce::new("n2", vec![], vec![Reducer::Sum(1)]);
        let mut harness = Harness::new(&reduce);
        let five = Row::from_values(values![1, 5]);
        let seven = Row::from_values(values![1, 7]);

        let out = harness.step(
            &mut reduce,
            1,
            vec![(0, Change::insert(five.clone(), 1))],
            at(1),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row.values(), values![5].as_slice());
        assert_eq!(out[0].diff, 1);

        let out = harness.step(
            &mut reduce,
            2,
            vec![
                (0, Change::retract(five, 2)),
                (0, Change::insert(seven, 2)),
            ],
            at(2),
        );
        let mut summary: Vec<(Value, Diff)> = out
            .iter()
            .map(|c| (c.row.values()[0].clone(), c.diff))
            .collect();
        summary.sort();
        assert_eq!(summary, vec![(Value::Int(5), -1), (Value::Int(7), 1)]);
    }

    #[test]
    fn group_disappears_test() {
        let mut reduce = Reduce::new("n2", vec![0], vec![Reducer::Count]);
        let mut harness = Harness::new(&reduce);
        let row = Row::from_values(values!["a", 1]);

        let out = harness.step(&mut reduce, 1, vec![(0, Change::insert(row.clone(), 1))], at(1));
        assert_eq!(out[0].row.values(), values!["a", 1].as_slice());

        let out = harness.step(&mut reduce, 2, vec![(0, Change::retract(row, 2))], at(2));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, -1);
        assert_eq!(harness.state.entries(), 0);
    }

    #[test]
    fn unchanged_aggregate_test() {
        let mut reduce = Reduce::new("n2", vec![0], vec![Reducer::Max(1)]);
        let mut harness = Harness::new(&reduce);
        let high = Row::from_values(values!["a", 9]);
        let low = Row::from_values(values!["a", 1]);
        let _ = harness.step(&mut reduce, 1, vec![(0, Change::insert(high, 1))], at(1));
        // a smaller value does not change the maximum
        let out = harness.step(&mut reduce, 2, vec![(0, Change::insert(low, 2))], at(2));
        assert!(out.is_empty());
    }

    #[test]
    fn failed_aggregate_withdrawn_test() {
        let mut reduce = Reduce::new("n2", vec![0], vec![Reducer::Sum(1)]);
        let mut harness = Harness::new(&reduce);
        let max = Row::from_values(values!["a", i64::MAX]);
        let one = Row::from_values(values!["a", 1]);

        let out = harness.step(
            &mut reduce,
            1,
            vec![(0, Change::insert(max, 1)), (0, Change::insert(one.clone(), 1))],
            at(1),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row.values(), &[Value::from("a"), Value::None][..]);
        let errors = std::mem::take(&mut harness.diagnostics.errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].change.diff, 1);
        assert_eq!(errors[0].change.time, Timestamp(1));

        let out = harness.step(&mut reduce, 2, vec![(0, Change::retract(one, 2))], at(2));
        let mut summary: Vec<(Value, Diff)> = out
            .iter()
            .map(|c| (c.row.values()[1].clone(), c.diff))
            .collect();
        summary.sort();
        assert_eq!(summary, vec![(Value::None, -1), (Value::Int(i64::MAX), 1)]);
        let errors = std::mem::take(&mut harness.diagnostics.errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].change.diff, -1);
        assert_eq!(errors[0].change.time, Timestamp(2));
        assert_eq!(errors[0].message, "sum overflow on column 1");
    }
}
