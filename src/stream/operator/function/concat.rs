// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::Change,
    error::ReflowResult,
    stream::operator::{Operator, OperatorContext},
};

/// Union of any number of inputs
#[derive(Default)]
pub struct Concat;

impl Operator for Concat {
    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        ctx.output(change);
        Ok(())
    }

    crate::ignore_frontier!();
}

/// Flips the sign of every multiplicity
#[derive(Default)]
pub struct Negate;

impl Operator for Negate {
    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        ctx.output(change.negate());
        Ok(())
    }

    crate::ignore_frontier!();
}
