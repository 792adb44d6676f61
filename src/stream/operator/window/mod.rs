// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

mod assigner;

pub use assigner::WindowAssigner;

use crate::{
    data::{Change, Key, Row, Value},
    error::{EvalError, ReflowResult, StateResult},
    stream::{
        operator::{
            reduce::{GroupState, Reducer},
            Operator, OperatorContext,
        },
        time::Frontier,
    },
};
use reflow_state::{OrderedIndex, StateId, StateStore, ValueState};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Where the window time of a row comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowTime {
    /// The logical timestamp of the change
    Logical,
    /// An integer event-time column.
    ///
    /// Windows close once the largest event time seen on any shard minus
    /// `lateness` has passed their end.
    Column { column: usize, lateness: i64 },
}

/// What happens to changes that fall into windows that already closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatePolicy {
    Drop,
    /// Route them to the late-data output
    Emit,
}

#[derive(Clone, Debug)]
pub struct WindowSpec {
    pub assigner: WindowAssigner,
    pub time: WindowTime,
    pub group_by: Vec<usize>,
    pub reducers: Vec<Reducer>,
    pub late: LatePolicy,
}

impl WindowSpec {
    /// Tumbling windows over logical time
    pub fn tumbling(length: i64, group_by: Vec<usize>, reducers: Vec<Reducer>) -> Self {
        WindowSpec {
            assigner: WindowAssigner::tumbling(length),
            time: WindowTime::Logical,
            group_by,
            reducers,
            late: LatePolicy::Drop,
        }
    }

    /// Sliding windows over logical time
    pub fn sliding(length: i64, slide: i64, group_by: Vec<usize>, reducers: Vec<Reducer>) -> Self {
        WindowSpec {
            assigner: WindowAssigner::sliding(length, slide),
            ..WindowSpec::tumbling(length, group_by, reducers)
        }
    }

    pub fn event_time(mut self, column: usize, lateness: i64) -> Self {
        self.time = WindowTime::Column { column, lateness };
        self
    }

    pub fn late_policy(mut self, late: LatePolicy) -> Self {
        self.late = late;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        self.assigner.validate()?;
        if let WindowTime::Column { lateness, .. } = self.time {
            if lateness < 0 {
                return Err(format!("window lateness must not be negative, got {}", lateness));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct WindowProgress {
    /// Largest event time observed by any shard
    max_event: i64,
    /// Windows ending at or before this bound are closed
    closed_until: i64,
}

impl Default for WindowProgress {
    fn default() -> Self {
        WindowProgress {
            max_event: i64::MIN,
            closed_until: i64::MIN,
        }
    }
}

/// Open windows keyed by `(end, group, start)` so they close in end order
type Windows = OrderedIndex<(i64, Vec<Value>, i64), GroupState>;
type Progress = ValueState<WindowProgress>;

/// Grouped aggregation over time windows.
///
/// A window emits its aggregate exactly once, when it closes.
pub struct Window {
    spec: WindowSpec,
    windows: StateId,
    progress: StateId,
}

impl Window {
    pub fn new(path: &str, spec: WindowSpec) -> Self {
        Window {
            spec,
            windows: StateId::new(path, "windows"),
            progress: StateId::new(path, "progress"),
        }
    }

    fn window_time(&self, change: &Change) -> Result<i64, EvalError> {
        match self.spec.time {
            WindowTime::Logical => i64::try_from(change.time.0).map_err(|_| {
                EvalError::new(format!("timestamp {} is out of window range", change.time))
            }),
            WindowTime::Column { column, .. } => {
                change.row.column(column)?.expect_int("event time")
            }
        }
    }

    fn progress(&self, ctx: &mut OperatorContext) -> ReflowResult<WindowProgress> {
        let progress = ctx.state().get::<Progress>(&self.progress)?;
        Ok(progress.get().copied().unwrap_or_default())
    }

    /// Upper bound of window ends that can be closed at `frontier`
    fn close_bound(&self, frontier: Frontier, max_event: i64) -> i64 {
        if frontier.is_closed() {
            return i64::MAX;
        }
        match self.spec.time {
            WindowTime::Logical => frontier
                .time()
                .and_then(|t| i64::try_from(t.0).ok())
                .unwrap_or(i64::MAX),
            WindowTime::Column { lateness, .. } => max_event.saturating_sub(lateness),
        }
    }

    fn emit(
        &self,
        end: i64,
        group: Vec<Value>,
        start: i64,
        state: GroupState,
        ctx: &mut OperatorContext,
    ) {
        if state.count <= 0 {
            return;
        }
        let (aggregates, errors) = state.outputs(&self.spec.reducers);
        let mut values = group;
        values.push(Value::Int(start));
        values.push(Value::Int(end));
        let key = Key::for_values(&values);
        values.extend(aggregates);
        let row = Row::new(key, values);
        // closed windows are never revised, neither are their errors
        for error in errors {
            ctx.report_row_error(row.clone(), error, 1);
        }
        let time = ctx.timestamp();
        ctx.output(Change::new(row, time, 1));
    }
}

impl Operator for Window {
    fn register_states(&self, state: &mut StateStore) -> StateResult<()> {
        state.register::<Windows>(self.windows.clone())?;
        state.register::<Progress>(self.progress.clone())?;
        Ok(())
    }

    fn on_change(
        &mut self,
        _port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let validated = self.window_time(&change).and_then(|t| {
            let group = change.row.project(&self.spec.group_by)?;
            GroupState::new(&self.spec.reducers).prepare(
                &self.spec.reducers,
                &change.row,
                change.diff,
            )?;
            Ok((t, group))
        });
        let (t, group) = match validated {
            Ok(validated) => validated,
            Err(err) => {
                ctx.report_error(change, err);
                return Ok(());
            }
        };

        let mut progress = self.progress(ctx)?;
        let mut late = false;
        let mut failure = None;
        {
            let reducers = &self.spec.reducers;
            let windows = ctx.state().get_mut::<Windows>(&self.windows)?;
            for (start, end) in self.spec.assigner.windows(t) {
                if end <= progress.closed_until {
                    late = true;
                    continue;
                }
                let key = (end, group.clone(), start);
                let prepared = match windows.get(&key) {
                    Some(state) => state.prepare(reducers, &change.row, change.diff),
                    None => GroupState::new(reducers).prepare(reducers, &change.row, change.diff),
                };
                match prepared {
                    Ok(updates) => {
                        windows.rmw(
                            key,
                            || GroupState::new(reducers),
                            |state| state.apply(updates, change.diff),
                        );
                    }
                    Err(err) => failure = Some(err),
                }
            }
        }
        if let Some(err) = failure {
            ctx.report_error(change.clone(), err);
        }

        if t > progress.max_event {
            progress.max_event = t;
            ctx.state()
                .get_mut::<Progress>(&self.progress)?
                .put(progress);
        }

        if late {
            slog::trace!(ctx.log(), "Late change"; "operator" => ctx.operator(), "event_time" => t);
            if self.spec.late == LatePolicy::Emit {
                ctx.report_late(change);
            }
        }
        Ok(())
    }

    fn on_frontier_advance(
        &mut self,
        frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        let mut progress = self.progress(ctx)?;
        if let WindowTime::Column { .. } = self.spec.time {
            progress.max_event = ctx.global_max(progress.max_event)?;
        }
        let bound = self
            .close_bound(frontier, progress.max_event)
            .max(progress.closed_until);

        let closed = {
            let windows = ctx.state().get_mut::<Windows>(&self.windows)?;
            // every key with an end at or below `bound` sorts before this one
            windows.drain_below(&(bound.saturating_add(1), Vec::new(), i64::MIN))
        };
        for ((end, group, start), state) in closed {
            self.emit(end, group, start, state, ctx);
        }

        progress.closed_until = bound;
        ctx.state().get_mut::<Progress>(&self.progress)?.put(progress);
        Ok(())
    }
}
