// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::FlatMapFn;
use crate::{
    data::{Change, Key, Row},
    error::ReflowResult,
    stream::operator::{Operator, OperatorContext},
};

/// Expands every row into zero or more rows.
///
/// The n-th produced row is keyed by the input key combined with n, so a
/// retraction of the input row retracts exactly the rows its insertion produced.
pub struct FlatMap {
    udf: FlatMapFn,
}

impl FlatMap {
    pub fn new(udf: FlatMapFn) -> Self {
        FlatMap { udf }
    }
}

impl Operator for FlatMap {
    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        match (self.udf)(&change.row) {
            Ok(rows) => {
                for (i, values) in rows.into_iter().enumerate() {
                    let key = change.row.key().combine(Key(i as u64));
                    ctx.output(Change::new(Row::new(key, values), change.time, change.diff));
                }
            }
            Err(err) => ctx.report_error(change, err),
        }
        Ok(())
    }

    crate::ignore_frontier!();
}
