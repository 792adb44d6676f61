// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::FilterFn;
use crate::{
    data::Change,
    error::ReflowResult,
    stream::operator::{Operator, OperatorContext},
};

/// Forwards the changes whose row satisfies a predicate
pub struct Filter {
    udf: FilterFn,
}

impl Filter {
    pub fn new(udf: FilterFn) -> Self {
        Filter { udf }
    }
}

impl Operator for Filter {
    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        match (self.udf)(&change.row) {
            Ok(true) => ctx.output(change),
            Ok(false) => {}
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
    fn filter_test() {
        let mut filter = Filter::new(Arc::new(|row: &Row| -> Result<bool, EvalError> {
            Ok(row.column(0)?.as_int().map_or(false, |v| v > 10))
        }));
        let mut harness = Harness::new(&filter);
        let changes = (5..15)
            .map(|v| (0, Change::insert(Row::from_values(vec![Value::Int(v)]), 1)))
            .collect();
        let out = harness.step(&mut filter, 1, changes, Frontier::at(2.into()));
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|c| c.row.values()[0] > Value::Int(10)));
    }
}
