// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::MapFn;
use crate::{
    data::Change,
    error::ReflowResult,
    stream::operator::{Operator, OperatorContext},
};

/// Replaces the values of every row, keeping its key, timestamp and multiplicity
pub struct Map {
    udf: MapFn,
}

impl Map {
    pub fn new(udf: MapFn) -> Self {
        Map { udf }
    }
}

impl Operator for Map {
    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        match (self.udf)(&change.row) {
            Ok(values) => ctx.output(Change::new(
                change.row.with_values(values),
                change.time,
                change.diff,
            )),
            Err(err) => ctx.report_error(change, err),
        }
        Ok(())
    }

    crate::ignore_frontier!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Row, Value},
        error::EvalError,
        stream::{operator::test_utils::Harness, time::Frontier},
    };
    use std::sync::Arc;

    #[test]
    fn map_test() {
        let mut map = Map::new(Arc::new(|row: &Row| -> Result<Vec<Value>, EvalError> {
            let v = row.column(0)?.expect_int("value")?;
            Ok(vec![Value::Int(v * 2)])
        }));
        let mut harness = Harness::new(&map);
        let good = Row::from_values(vec![Value::Int(3)]);
        let bad = Row::from_values(vec![Value::from("three")]);
        let out = harness.step(
            &mut map,
            1,
            vec![
                (0, Change::insert(good.clone(), 1)),
                (0, Change::insert(bad.clone(), 1)),
            ],
            Frontier::at(2.into()),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row.values(), &[Value::Int(6)]);
        assert_eq!(out[0].row.key(), good.key());
        assert_eq!(harness.diagnostics.errors.len(), 1);
        assert_eq!(harness.diagnostics.errors[0].change.row, bad);

        // a failing retraction mirrors the failing insertion
        let _ = harness.step(
            &mut map,
            2,
            vec![(0, Change::retract(bad, 2))],
            Frontier::at(3.into()),
        );
        let errors: Vec<_> = harness
            .diagnostics
            .errors
            .drain(..)
            .map(|e| e.into_change())
            .collect();
        assert_eq!(errors.iter().map(|c| c.diff).sum::<i64>(), 0);
    }
}
