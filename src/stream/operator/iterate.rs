// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::data::{consolidate_updates, Diff, Row};
use reflow_state::{Result, StateId, StateStore, ValueIndex};
use std::collections::BTreeSet;

type Collection = ValueIndex<Row, Diff>;

fn add(collection: &mut Collection, row: &Row, diff: Diff) {
    let count = *collection.rmw(row.clone(), || 0, |c| *c += diff);
    if count == 0 {
        collection.remove(row);
    }
}

/// Collections an iterative scope keeps on every shard.
///
/// `input` is the collection the loop variable starts from, `variable` its
/// current value and `result` the latest output of the loop body. Rows are
/// kept in their normalized form and partitioned by their values, so a row
/// the body derives again along another path meets its earlier copy and
/// each shard decides the deltas of its own rows.
///
/// At every outer time with changes the variable restarts from the input
/// (`input - variable`) and then follows the body (`result - variable`) round
/// by round until no shard has a delta left. The sum of all variable deltas of
/// an outer time is the change of the loop's output at that time. The reset
/// keeps retractions inside the loop correct but re-derives the whole
/// fixpoint at every outer time that touches the loop.
pub(crate) struct LoopState {
    input: StateId,
    variable: StateId,
    result: StateId,
    candidates: BTreeSet<Row>,
    accumulated: Vec<(Row, Diff)>,
}

impl LoopState {
    pub(crate) fn new(path: &str) -> Self {
        LoopState {
            input: StateId::new(path, "input"),
            variable: StateId::new(path, "variable"),
            result: StateId::new(path, "result"),
            candidates: BTreeSet::new(),
            accumulated: Vec::new(),
        }
    }

    pub(crate) fn register_states(&self, state: &mut StateStore) -> Result<()> {
        state.register::<Collection>(self.input.clone())?;
        state.register::<Collection>(self.variable.clone())?;
        state.register::<Collection>(self.result.clone())?;
        Ok(())
    }

    pub(crate) fn absorb_input(&self, state: &mut StateStore, row: &Row, diff: Diff) -> Result<()> {
        add(state.get_mut::<Collection>(&self.input)?, &row.normalized(), diff);
        Ok(())
    }

    pub(crate) fn absorb_result(
        &mut self,
        state: &mut StateStore,
        row: Row,
        diff: Diff,
    ) -> Result<()> {
        let row = row.normalized();
        add(state.get_mut::<Collection>(&self.result)?, &row, diff);
        self.candidates.insert(row);
        Ok(())
    }

    /// Delta that resets the variable to the input, applied to the variable
    pub(crate) fn initial_delta(&mut self, state: &mut StateStore) -> Result<Vec<(Row, Diff)>> {
        let mut delta: Vec<(Row, Diff)> = Vec::new();
        {
            let input = state.get::<Collection>(&self.input)?;
            let variable = state.get::<Collection>(&self.variable)?;
            delta.extend(input.iter().map(|(row, c)| (row.clone(), *c)));
            delta.extend(variable.iter().map(|(row, c)| (row.clone(), -*c)));
        }
        consolidate_updates(&mut delta);
        // reset rows must converge back to the body's output
        self.candidates.extend(delta.iter().map(|(row, _)| row.clone()));
        self.apply_delta(state, &delta)?;
        Ok(delta)
    }

    /// Delta that moves the variable to the body's output for every row the
    /// body changed since the last round, applied to the variable
    pub(crate) fn next_delta(&mut self, state: &mut StateStore) -> Result<Vec<(Row, Diff)>> {
        let mut delta: Vec<(Row, Diff)> = Vec::new();
        {
            let result = state.get::<Collection>(&self.result)?;
            let variable = state.get::<Collection>(&self.variable)?;
            for row in std::mem::take(&mut self.candidates) {
                let wanted = result.get(&row).copied().unwrap_or(0);
                let current = variable.get(&row).copied().unwrap_or(0);
                if wanted != current {
                    delta.push((row, wanted - current));
                }
            }
        }
        self.apply_delta(state, &delta)?;
        Ok(delta)
    }

    fn apply_delta(&mut self, state: &mut StateStore, delta: &[(Row, Diff)]) -> Result<()> {
        let variable = state.get_mut::<Collection>(&self.variable)?;
        for (row, diff) in delta {
            add(variable, row, *diff);
        }
        self.accumulated.extend_from_slice(delta);
        Ok(())
    }

    /// Net change of the variable since the last call
    pub(crate) fn take_output(&mut self) -> Vec<(Row, Diff)> {
        let mut out = std::mem::take(&mut self.accumulated);
        consolidate_updates(&mut out);
        out
    }
}
