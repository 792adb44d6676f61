// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::{Diff, Row, Value},
    error::EvalError,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::TryFrom, fmt, sync::Arc};

/// A user-defined aggregate.
///
/// Invertible combiners fold retractions directly into the accumulator
/// (`combine` with a negative diff must undo the positive one). For
/// non-invertible combiners every group retains the multiset of its input
/// values and the aggregate is recomputed from it whenever the group changes.
pub trait Combiner: Send + Sync {
    /// The accumulator of an empty group
    fn zero(&self) -> Value;
    /// Folds `diff` copies of `value` into `acc`
    fn combine(&self, acc: &Value, value: &Value, diff: Diff) -> Result<Value, EvalError>;
    /// Whether retractions can be folded into the accumulator
    fn invertible(&self) -> bool;
}

/// Aggregates available to reduce and window operators.
///
/// Column arguments index into the input row. `None` values are ignored by
/// every reducer except `Count`, which counts rows.
#[derive(Clone)]
pub enum Reducer {
    Count,
    Sum(usize),
    Avg(usize),
    Min(usize),
    Max(usize),
    /// Value of `arg` in the row with the smallest `value`
    ArgMin { value: usize, arg: usize },
    /// Value of `arg` in the row with the largest `value`
    ArgMax { value: usize, arg: usize },
    /// Some value of the group, the smallest one to stay deterministic
    Any(usize),
    /// All values of the group as a sorted tuple
    SortedTuple(usize),
    Custom {
        column: usize,
        combiner: Arc<dyn Combiner>,
    },
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Count => write!(f, "Count"),
            Reducer::Sum(c) => write!(f, "Sum({})", c),
            Reducer::Avg(c) => write!(f, "Avg({})", c),
            Reducer::Min(c) => write!(f, "Min({})", c),
            Reducer::Max(c) => write!(f, "Max({})", c),
            Reducer::ArgMin { value, arg } => write!(f, "ArgMin({}, {})", value, arg),
            Reducer::ArgMax { value, arg } => write!(f, "ArgMax({}, {})", value, arg),
            Reducer::Any(c) => write!(f, "Any({})", c),
            Reducer::SortedTuple(c) => write!(f, "SortedTuple({})", c),
            Reducer::Custom { column, combiner } => {
                write!(f, "Custom({}, invertible={})", column, combiner.invertible())
            }
        }
    }
}

/// Per-reducer state of a group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Accumulator {
    /// Count reads the group's row count
    Count,
    /// Integers are summed wide so that intermediate totals may leave the
    /// `i64` range, only the emitted sum has to fit
    Sum { int: i128, float: f64, floats: Diff },
    Avg { sum: f64, count: Diff },
    Multiset(BTreeMap<Value, Diff>),
    Pairs(BTreeMap<(Value, Value), Diff>),
    Folded(Value),
}

/// A validated update of one accumulator
pub(crate) enum Update {
    Nothing,
    Int(i128),
    Float(f64, Diff),
    Avg(f64, Diff),
    Value(Value, Diff),
    Pair(Value, Value, Diff),
    Replace(Value),
}

fn numeric<'a>(row: &'a Row, column: usize) -> Result<Option<&'a Value>, EvalError> {
    let v = row.column(column)?;
    match v {
        Value::None => Ok(None),
        Value::Int(_) | Value::Float(_) => Ok(Some(v)),
        other => Err(EvalError::new(format!(
            "column {} must be numeric, got {}",
            column, other
        ))),
    }
}

impl Reducer {
    pub(crate) fn init(&self) -> Accumulator {
        match self {
            Reducer::Count => Accumulator::Count,
            Reducer::Sum(_) => Accumulator::Sum {
                int: 0,
                float: 0.0,
                floats: 0,
            },
            Reducer::Avg(_) => Accumulator::Avg { sum: 0.0, count: 0 },
            Reducer::Min(_) | Reducer::Max(_) | Reducer::Any(_) | Reducer::SortedTuple(_) => {
                Accumulator::Multiset(BTreeMap::new())
            }
            Reducer::ArgMin { .. } | Reducer::ArgMax { .. } => Accumulator::Pairs(BTreeMap::new()),
            Reducer::Custom { combiner, .. } => {
                if combiner.invertible() {
                    Accumulator::Folded(combiner.zero())
                } else {
                    Accumulator::Multiset(BTreeMap::new())
                }
            }
        }
    }

    /// Validates `row` and computes the update it makes to `acc`, without applying it
    pub(crate) fn prepare(
        &self,
        acc: &Accumulator,
        row: &Row,
        diff: Diff,
    ) -> Result<Update, EvalError> {
        let update = match self {
            Reducer::Count => Update::Nothing,
            Reducer::Sum(c) => match numeric(row, *c)? {
                Some(Value::Int(i)) => {
                    let delta = i128::from(*i) * i128::from(diff);
                    if let Accumulator::Sum { int, .. } = acc {
                        int.checked_add(delta).ok_or_else(|| {
                            EvalError::new(format!("sum overflow on column {}", c))
                        })?;
                    }
                    Update::Int(delta)
                }
                Some(Value::Float(f)) => Update::Float(*f * diff as f64, diff),
                _ => Update::Nothing,
            },
            Reducer::Avg(c) => match numeric(row, *c)?.and_then(Value::as_float) {
                Some(f) => Update::Avg(f * diff as f64, diff),
                None => Update::Nothing,
            },
            Reducer::Min(c) | Reducer::Max(c) | Reducer::Any(c) | Reducer::SortedTuple(c) => {
                match row.column(*c)? {
                    Value::None => Update::Nothing,
                    v => Update::Value(v.clone(), diff),
                }
            }
            Reducer::ArgMin { value, arg } | Reducer::ArgMax { value, arg } => {
                match row.column(*value)? {
                    Value::None => Update::Nothing,
                    v => Update::Pair(v.clone(), row.column(*arg)?.clone(), diff),
                }
            }
            Reducer::Custom { column, combiner } => {
                let v = row.column(*column)?;
                if v.is_none() {
                    Update::Nothing
                } else if combiner.invertible() {
                    match acc {
                        Accumulator::Folded(current) => {
                            Update::Replace(combiner.combine(current, v, diff)?)
                        }
                        _ => Update::Replace(combiner.combine(&combiner.zero(), v, diff)?),
                    }
                } else {
                    Update::Value(v.clone(), diff)
                }
            }
        };
        Ok(update)
    }

    /// The aggregate of a group with `count` rows
    pub(crate) fn output(&self, acc: &Accumulator, count: Diff) -> Result<Value, EvalError> {
        let positive = |m: &BTreeMap<Value, Diff>| -> Vec<(Value, Diff)> {
            m.iter()
                .filter(|(_, d)| **d > 0)
                .map(|(v, d)| (v.clone(), *d))
                .collect()
        };
        let value = match (self, acc) {
            (Reducer::Count, _) => Value::Int(count),
            (Reducer::Sum(c), Accumulator::Sum { int, float, floats }) => {
                if *floats != 0 {
                    Value::Float(*int as f64 + *float)
                } else {
                    Value::Int(i64::try_from(*int).map_err(|_| {
                        EvalError::new(format!("sum overflow on column {}", c))
                    })?)
                }
            }
            (Reducer::Avg(_), Accumulator::Avg { sum, count }) => {
                if *count > 0 {
                    Value::Float(*sum / *count as f64)
                } else {
                    Value::None
                }
            }
            (Reducer::Min(_), Accumulator::Multiset(m))
            | (Reducer::Any(_), Accumulator::Multiset(m)) => m
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(v, _)| v.clone())
                .unwrap_or(Value::None),
            (Reducer::Max(_), Accumulator::Multiset(m)) => m
                .iter()
                .rev()
                .find(|(_, d)| **d > 0)
                .map(|(v, _)| v.clone())
                .unwrap_or(Value::None),
            (Reducer::SortedTuple(_), Accumulator::Multiset(m)) => {
                let mut values = Vec::new();
                for (v, d) in positive(m) {
                    values.extend(std::iter::repeat(v).take(d as usize));
                }
                Value::tuple(values)
            }
            (Reducer::ArgMin { .. }, Accumulator::Pairs(m)) => m
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|((_, arg), _)| arg.clone())
                .unwrap_or(Value::None),
            (Reducer::ArgMax { .. }, Accumulator::Pairs(m)) => m
                .iter()
                .rev()
                .find(|(_, d)| **d > 0)
                .map(|((_, arg), _)| arg.clone())
                .unwrap_or(Value::None),
            (Reducer::Custom { .. }, Accumulator::Folded(v)) => v.clone(),
            (Reducer::Custom { combiner, .. }, Accumulator::Multiset(m)) => {
                let mut acc = combiner.zero();
                for (v, d) in positive(m) {
                    acc = combiner.combine(&acc, &v, d)?;
                }
                acc
            }
            (reducer, acc) => {
                return Err(EvalError::new(format!(
                    "accumulator {:?} does not belong to {:?}",
                    acc, reducer
                )))
            }
        };
        Ok(value)
    }
}

impl Accumulator {
    pub(crate) fn apply(&mut self, update: Update) {
        match (self, update) {
            (_, Update::Nothing) => {}
            // overflow was ruled out in prepare
            (Accumulator::Sum { int, .. }, Update::Int(i)) => *int = int.wrapping_add(i),
            (Accumulator::Sum { float, floats, .. }, Update::Float(f, d)) => {
                *floats += d;
                if *floats == 0 {
                    // drop rounding residue once no float is left
                    *float = 0.0;
                } else {
                    *float += f;
                }
            }
            (Accumulator::Avg { sum, count }, Update::Avg(f, d)) => {
                *count += d;
                if *count == 0 {
                    *sum = 0.0;
                } else {
                    *sum += f;
                }
            }
            (Accumulator::Multiset(m), Update::Value(v, d)) => add(m, v, d),
            (Accumulator::Pairs(m), Update::Pair(v, a, d)) => add(m, (v, a), d),
            (Accumulator::Folded(current), Update::Replace(v)) => *current = v,
            _ => {}
        }
    }

    /// True if the accumulator holds no contribution at all
    pub(crate) fn is_empty(&self, reducer: &Reducer) -> bool {
        match self {
            Accumulator::Count => true,
            Accumulator::Sum { int, floats, .. } => *int == 0 && *floats == 0,
            Accumulator::Avg { count, .. } => *count == 0,
            Accumulator::Multiset(m) => m.is_empty(),
            Accumulator::Pairs(m) => m.is_empty(),
            Accumulator::Folded(v) => match reducer {
                Reducer::Custom { combiner, .. } => *v == combiner.zero(),
                _ => false,
            },
        }
    }
}

fn add<K: Ord>(m: &mut BTreeMap<K, Diff>, key: K, diff: Diff) {
    let entry = m.entry(key);
    match entry {
        std::collections::btree_map::Entry::Vacant(v) => {
            if diff != 0 {
                v.insert(diff);
            }
        }
        std::collections::btree_map::Entry::Occupied(mut o) => {
            *o.get_mut() += diff;
            if *o.get() == 0 {
                o.remove();
            }
        }
    }
}

/// Count and accumulators of one group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct GroupState {
    pub(crate) count: Diff,
    pub(crate) accs: Vec<Accumulator>,
}

impl GroupState {
    pub(crate) fn new(reducers: &[Reducer]) -> Self {
        GroupState {
            count: 0,
            accs: reducers.iter().map(Reducer::init).collect(),
        }
    }

    /// Validates `row` against all reducers and returns the updates to apply
    pub(crate) fn prepare(
        &self,
        reducers: &[Reducer],
        row: &Row,
        diff: Diff,
    ) -> Result<Vec<Update>, EvalError> {
        reducers
            .iter()
            .zip(self.accs.iter())
            .map(|(r, acc)| r.prepare(acc, row, diff))
            .collect()
    }

    pub(crate) fn apply(&mut self, updates: Vec<Update>, diff: Diff) {
        self.count += diff;
        for (acc, update) in self.accs.iter_mut().zip(updates) {
            acc.apply(update);
        }
    }

    pub(crate) fn is_empty(&self, reducers: &[Reducer]) -> bool {
        self.count == 0
            && self
                .accs
                .iter()
                .zip(reducers)
                .all(|(acc, r)| acc.is_empty(r))
    }

    /// Aggregates of the group, failed ones are reported and yield `None`
    pub(crate) fn outputs(&self, reducers: &[Reducer]) -> (Vec<Value>, Vec<EvalError>) {
        let mut values = Vec::with_capacity(reducers.len());
        let mut errors = Vec::new();
        for (r, acc) in reducers.iter().zip(self.accs.iter()) {
            match r.output(acc, self.count) {
                Ok(v) => values.push(v),
                Err(e) => {
                    errors.push(e);
                    values.push(Value::None);
                }
            }
        }
        (values, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    fn fold(reducer: &Reducer, updates: &[(Vec<Value>, Diff)]) -> Value {
        let reducers = vec![reducer.clone()];
        let mut state = GroupState::new(&reducers);
        for (values, diff) in updates {
            let row = Row::from_values(values.clone());
            let prepared = state.prepare(&reducers, &row, *diff).unwrap();
            state.apply(prepared, *diff);
        }
        let (mut out, errors) = state.outputs(&reducers);
        assert!(errors.is_empty());
        out.remove(0)
    }

    struct Product;

    impl Combiner for Product {
        fn zero(&self) -> Value {
            Value::Int(1)
        }
        fn combine(&self, acc: &Value, value: &Value, diff: Diff) -> Result<Value, EvalError> {
            let acc = acc.expect_int("accumulator")?;
            let v = value.expect_int("value")?;
            Ok(Value::Int(acc * v.pow(diff as u32)))
        }
        fn invertible(&self) -> bool {
            false
        }
    }

    #[test]
    fn sum_test() {
        let sum = Reducer::Sum(0);
        assert_eq!(fold(&sum, &[(values![5], 1), (values![7], 1)]), Value::Int(12));
        assert_eq!(
            fold(&sum, &[(values![5], 1), (values![2.5], 1)]),
            Value::Float(7.5)
        );
        assert_eq!(
            fold(&sum, &[(values![5], 1), (values![2.5], 1), (values![2.5], -1)]),
            Value::Int(5)
        );
    }

    #[test]
    fn extremes_after_retraction_test() {
        let updates = vec![
            (values![3], 1),
            (values![9], 1),
            (values![1], 1),
            (values![1], -1),
            (values![9], -1),
        ];
        assert_eq!(fold(&Reducer::Min(0), &updates), Value::Int(3));
        assert_eq!(fold(&Reducer::Max(0), &updates), Value::Int(3));
        assert_eq!(
            fold(&Reducer::SortedTuple(0), &updates),
            Value::tuple(values![3])
        );
    }

    #[test]
    fn arg_extremes_test() {
        let updates = vec![(values![3, "c"], 1), (values![9, "n"], 1), (values![1, "o"], 1)];
        assert_eq!(
            fold(&Reducer::ArgMin { value: 0, arg: 1 }, &updates),
            Value::from("o")
        );
        assert_eq!(
            fold(&Reducer::ArgMax { value: 0, arg: 1 }, &updates),
            Value::from("n")
        );
    }

    #[test]
    fn avg_ignores_none_test() {
        let updates = vec![(values![4], 1), (vec![Value::None], 1), (values![2], 1)];
        assert_eq!(fold(&Reducer::Avg(0), &updates), Value::Float(3.0));
        assert_eq!(fold(&Reducer::Count, &updates), Value::Int(3));
    }

    #[test]
    fn non_invertible_custom_test() {
        let product = Reducer::Custom {
            column: 0,
            combiner: Arc::new(Product),
        };
        let updates = vec![(values![2], 1), (values![3], 2), (values![2], -1)];
        assert_eq!(fold(&product, &updates), Value::Int(9));
    }

    #[test]
    fn invalid_input_test() {
        let reducers = vec![Reducer::Count, Reducer::Sum(0)];
        let state = GroupState::new(&reducers);
        let row = Row::from_values(values!["five"]);
        assert!(state.prepare(&reducers, &row, 1).is_err());
    }

    #[test]
    fn sum_overflow_test() {
        let reducers = vec![Reducer::Sum(0)];
        let mut state = GroupState::new(&reducers);
        for (v, diff) in &[(i64::MAX, 1), (1, 1)] {
            let row = Row::from_values(values![*v]);
            let prepared = state.prepare(&reducers, &row, *diff).unwrap();
            state.apply(prepared, *diff);
        }
        let (out, errors) = state.outputs(&reducers);
        assert_eq!(out, vec![Value::None]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("overflow"));

        // back in range once the row that overflowed is retracted
        let row = Row::from_values(values![1]);
        let prepared = state.prepare(&reducers, &row, -1).unwrap();
        state.apply(prepared, -1);
        let (out, errors) = state.outputs(&reducers);
        assert_eq!(out, vec![Value::Int(i64::MAX)]);
        assert!(errors.is_empty());
    }
}
