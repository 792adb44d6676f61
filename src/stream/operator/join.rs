// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::{Change, Diff, Key, Row, Value},
    error::{ReflowResult, StateResult},
    stream::{
        operator::{Operator, OperatorContext},
        time::Frontier,
    },
};
use reflow_state::{KeyedMultiset, StateId, StateStore};
use std::collections::{BTreeMap, BTreeSet};

/// Which unmatched rows a join keeps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    /// Unmatched left rows are padded with `None` on the right side
    Left,
    /// Unmatched right rows are padded with `None` on the left side
    Right,
    /// Both sides are padded
    Outer,
}

impl JoinKind {
    #[inline]
    fn pads_left(self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Outer)
    }
    #[inline]
    fn pads_right(self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Outer)
    }
}

/// Description of an equi-join.
///
/// Output rows are the left values followed by the right values.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinSpec {
    pub kind: JoinKind,
    /// Key columns of the left input
    pub left_on: Vec<usize>,
    /// Key columns of the right input
    pub right_on: Vec<usize>,
    /// Width of left rows, required to pad unmatched right rows
    pub left_width: Option<usize>,
    /// Width of right rows, required to pad unmatched left rows
    pub right_width: Option<usize>,
}

impl JoinSpec {
    pub fn inner(left_on: Vec<usize>, right_on: Vec<usize>) -> Self {
        JoinSpec {
            kind: JoinKind::Inner,
            left_on,
            right_on,
            left_width: None,
            right_width: None,
        }
    }

    pub fn left(left_on: Vec<usize>, right_on: Vec<usize>, right_width: usize) -> Self {
        JoinSpec {
            kind: JoinKind::Left,
            right_width: Some(right_width),
            ..JoinSpec::inner(left_on, right_on)
        }
    }

    pub fn right(left_on: Vec<usize>, right_on: Vec<usize>, left_width: usize) -> Self {
        JoinSpec {
            kind: JoinKind::Right,
            left_width: Some(left_width),
            ..JoinSpec::inner(left_on, right_on)
        }
    }

    pub fn outer(
        left_on: Vec<usize>,
        right_on: Vec<usize>,
        left_width: usize,
        right_width: usize,
    ) -> Self {
        JoinSpec {
            kind: JoinKind::Outer,
            left_width: Some(left_width),
            right_width: Some(right_width),
            ..JoinSpec::inner(left_on, right_on)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.left_on.len() != self.right_on.len() {
            return Err(format!(
                "join key arity differs: {} left columns and {} right columns",
                self.left_on.len(),
                self.right_on.len()
            ));
        }
        if self.kind.pads_left() && self.right_width.is_none() {
            return Err("left and outer joins need the width of right rows".to_string());
        }
        if self.kind.pads_right() && self.left_width.is_none() {
            return Err("right and outer joins need the width of left rows".to_string());
        }
        Ok(())
    }
}

type Side = KeyedMultiset<Vec<Value>, Row>;

/// Incremental equi-join.
///
/// Each input is kept as a multiset of rows per join key. A change on one side
/// is joined against the current contents of the other side with the product
/// of the multiplicities and then added to its own side. Padded rows of outer
/// joins are reconciled per dirty key once the step's changes are applied.
pub struct Join {
    spec: JoinSpec,
    left: StateId,
    right: StateId,
    padded: StateId,
    dirty: BTreeSet<Vec<Value>>,
}

impl Join {
    pub fn new(path: &str, spec: JoinSpec) -> Self {
        Join {
            spec,
            left: StateId::new(path, "left"),
            right: StateId::new(path, "right"),
            padded: StateId::new(path, "padded"),
            dirty: BTreeSet::new(),
        }
    }

    fn pad_left(&self, left: &Row) -> Row {
        let width = self.spec.right_width.unwrap_or(0);
        let mut values = left.values().to_vec();
        values.extend(std::iter::repeat(Value::None).take(width));
        Row::new(left.key().combine(Key::NULL), values)
    }

    fn pad_right(&self, right: &Row) -> Row {
        let width = self.spec.left_width.unwrap_or(0);
        let mut values: Vec<Value> = std::iter::repeat(Value::None).take(width).collect();
        values.extend_from_slice(right.values());
        Row::new(Key::NULL.combine(right.key()), values)
    }

    /// Brings the padded rows of `key` in line with the current contents of both sides
    fn reconcile(&self, key: Vec<Value>, ctx: &mut OperatorContext) -> ReflowResult<()> {
        let time = ctx.timestamp();
        let mut desired: BTreeMap<Row, Diff> = BTreeMap::new();
        {
            let state = ctx.state();
            let left = state.get::<Side>(&self.left)?;
            let right = state.get::<Side>(&self.right)?;
            if self.spec.kind.pads_left() && !right.contains_key(&key) {
                for (row, m) in left.get(&key) {
                    *desired.entry(self.pad_left(row)).or_insert(0) += m;
                }
            }
            if self.spec.kind.pads_right() && !left.contains_key(&key) {
                for (row, m) in right.get(&key) {
                    *desired.entry(self.pad_right(row)).or_insert(0) += m;
                }
            }
        }

        let padded = ctx.state().get_mut::<Side>(&self.padded)?;
        let mut delta: BTreeMap<Row, Diff> = desired.clone();
        for (row, m) in padded.get(&key) {
            *delta.entry(row.clone()).or_insert(0) -= m;
        }
        padded.replace(key, desired);

        for (row, diff) in delta {
            ctx.output(Change::new(row, time, diff));
        }
        Ok(())
    }
}

impl Operator for Join {
    fn register_states(&self, state: &mut StateStore) -> StateResult<()> {
        state.register::<Side>(self.left.clone())?;
        state.register::<Side>(self.right.clone())?;
        if self.spec.kind != JoinKind::Inner {
            state.register::<Side>(self.padded.clone())?;
        }
        Ok(())
    }

    fn on_change(
        &mut self,
        port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let is_left = port == 0;
        let (on, own, other) = if is_left {
            (&self.spec.left_on, &self.left, &self.right)
        } else {
            (&self.spec.right_on, &self.right, &self.left)
        };

        let key = match change.row.project(on) {
            Ok(key) => key,
            Err(err) => {
                ctx.report_error(change, err);
                return Ok(());
            }
        };

        let matches: Vec<(Row, Diff)> = ctx
            .state()
            .get::<Side>(other)?
            .get(&key)
            .map(|(row, m)| (row.clone(), m))
            .collect();

        for (other_row, m) in matches {
            let (l, r) = if is_left {
                (&change.row, &other_row)
            } else {
                (&other_row, &change.row)
            };
            let mut values = l.values().to_vec();
            values.extend_from_slice(r.values());
            let row = Row::new(l.key().combine(r.key()), values);
            ctx.output(Change::new(row, change.time, change.diff * m));
        }

        let own = own.clone();
        ctx.state()
            .get_mut::<Side>(&own)?
            .update(key.clone(), change.row, change.diff);

        if self.spec.kind != JoinKind::Inner {
            self.dirty.insert(key);
        }
        Ok(())
    }

    fn on_frontier_advance(
        &mut self,
        _frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        for key in std::mem::take(&mut self.dirty) {
            self.reconcile(key, ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Timestamp, stream::operator::test_utils::Harness, values};

    fn row(values: Vec<Value>) -> Row {
        Row::from_values(values)
    }

    fn step(
        join: &mut Join,
        harness: &mut Harness,
        time: u64,
        changes: Vec<(usize, Change)>,
    ) -> Vec<Change> {
        harness.step(join, time, changes, Frontier::at(Timestamp(time + 1)))
    }

    #[test]
    fn bilinear_join_test() {
        let mut join = Join::new("n2", JoinSpec::inner(vec![0], vec![0]));
        let mut harness = Harness::new(&join);

        let b = row(values!["k", "b"]);
        let a = row(values!["k", "a"]);
        assert!(step(&mut join, &mut harness, 0, vec![(1, Change::insert(b.clone(), 0))]).is_empty());

        let out = step(&mut join, &mut harness, 1, vec![(0, Change::insert(a.clone(), 1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row.values(), values!["k", "a", "k", "b"].as_slice());
        assert_eq!(out[0].diff, 1);
        assert_eq!(out[0].time, Timestamp(1));

        // a second copy of b doubles the match, a retraction of a removes both
        let out = step(
            &mut join,
            &mut harness,
            2,
            vec![(1, Change::insert(b.clone(), 2)), (0, Change::retract(a, 2))],
        );
        let net: Diff = out.iter().map(|c| c.diff).sum();
        assert_eq!(net, -1 + -1 + 1);
    }

    #[test]
    fn left_join_padding_test() {
        let mut join = Join::new("n2", JoinSpec::left(vec![0], vec![0], 2));
        let mut harness = Harness::new(&join);

        let a = row(values![1, "a"]);
        let out = step(&mut join, &mut harness, 1, vec![(0, Change::insert(a.clone(), 1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].row.values(),
            values![1, "a", Value::None, Value::None].as_slice()
        );

        // the first match retracts the padded row
        let b = row(values![1, "b"]);
        let out = step(&mut join, &mut harness, 2, vec![(1, Change::insert(b.clone(), 2))]);
        assert_eq!(out.len(), 2);
        let padded: Vec<_> = out.iter().filter(|c| c.row.values()[2].is_none()).collect();
        assert_eq!(padded.len(), 1);
        assert_eq!(padded[0].diff, -1);

        // and removing it brings the padded row back
        let out = step(&mut join, &mut harness, 3, vec![(1, Change::retract(b, 3))]);
        let net: Diff = out
            .iter()
            .filter(|c| c.row.values()[2].is_none())
            .map(|c| c.diff)
            .sum();
        assert_eq!(net, 1);
    }

    #[test]
    fn missing_key_column_test() {
        let mut join = Join::new("n2", JoinSpec::inner(vec![3], vec![0]));
        let mut harness = Harness::new(&join);
        let out = step(
            &mut join,
            &mut harness,
            1,
            vec![(0, Change::insert(row(values![1]), 1))],
        );
        assert!(out.is_empty());
        assert_eq!(harness.diagnostics.errors.len(), 1);
    }

    #[test]
    fn spec_validation_test() {
        assert!(JoinSpec::inner(vec![0], vec![0, 1]).validate().is_err());
        let mut outer = JoinSpec::outer(vec![0], vec![0], 2, 2);
        assert!(outer.validate().is_ok());
        outer.left_width = None;
        assert!(outer.validate().is_err());
    }
}
