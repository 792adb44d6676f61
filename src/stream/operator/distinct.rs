// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::{Change, Diff, Row},
    error::{ReflowResult, StateResult},
    stream::{
        operator::{Operator, OperatorContext},
        time::Frontier,
    },
};
use reflow_state::{StateId, StateStore, ValueIndex};
use std::collections::BTreeSet;

type Counts = ValueIndex<Row, Diff>;
type Present = ValueIndex<Row, ()>;

/// Collapses every row with a positive multiplicity to multiplicity one.
///
/// Rows are compared by their values, whatever key they were derived with,
/// and leave the operator keyed by those values. Output is decided per step, so a row that is inserted and retracted
/// within the same step never shows up downstream.
pub struct Distinct {
    counts: StateId,
    present: StateId,
    dirty: BTreeSet<Row>,
}

impl Distinct {
    pub fn new(path: &str) -> Self {
        Distinct {
            counts: StateId::new(path, "counts"),
            present: StateId::new(path, "present"),
            dirty: BTreeSet::new(),
        }
    }
}

impl Operator for Distinct {
    fn register_states(&self, state: &mut StateStore) -> StateResult<()> {
        state.register::<Counts>(self.counts.clone())?;
        state.register::<Present>(self.present.clone())?;
        Ok(())
    }

    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let row = change.row.normalized();
        let counts = ctx.state().get_mut::<Counts>(&self.counts)?;
        let count = *counts.rmw(row.clone(), || 0, |c| *c += change.diff);
        if count == 0 {
            counts.remove(&row);
        }
        self.dirty.insert(row);
        Ok(())
    }

    fn on_frontier_advance(
        &mut self,
        _frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let time = ctx.timestamp();
        for row in std::mem::take(&mut self.dirty) {
            let visible = {
                let counts = ctx.state().get::<Counts>(&self.counts)?;
                counts.get(&row).map_or(false, |c| *c > 0)
            };
            let present = ctx.state().get_mut::<Present>(&self.present)?;
            match (visible, present.contains(&row)) {
                (true, false) => {
                    present.put(row.clone(), ());
                    ctx.output(Change::new(row, time, 1));
                }
                (false, true) => {
                    present.remove(&row);
                    ctx.output(Change::new(row, time, -1));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
