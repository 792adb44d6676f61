// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Set-semantics operator
pub mod distinct;
/// Available function operators
pub mod function;
/// Loop state of iterative scopes
pub mod iterate;
/// Incremental equi-joins
pub mod join;
/// Grouped aggregation
pub mod reduce;
/// Available window operators
pub mod window;

use crate::{
    conf::logger::ReflowLogger,
    data::{Change, Diff, Row, Timestamp, Value},
    error::{EvalError, ReflowResult, StateResult},
    stream::{
        channel::{Exchanger, Reduction},
        time::{Frontier, LoopTime},
    },
};
use reflow_state::StateStore;

use self::{
    distinct::Distinct,
    function::{Concat, Filter, FlatMap, Map, Negate},
    join::Join,
    reduce::Reduce,
    window::Window,
};

/// Defines the methods an `Operator` must implement
pub trait Operator: Send {
    /// Registers the state the operator keeps in the shard's [StateStore]
    fn register_states(&self, _state: &mut StateStore) -> StateResult<()> {
        Ok(())
    }

    /// Determines how the `Operator` processes an incoming change on input `port`
    fn on_change(
        &mut self,
        port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()>;

    /// Called once per step after all changes of the step were handled.
    ///
    /// Operators that can only finalise output once a time is closed emit it here.
    fn on_frontier_advance(
        &mut self,
        frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()>;
}

/// Helper macro to implement an empty `on_frontier_advance` function
#[macro_export]
macro_rules! ignore_frontier {
    () => {
        fn on_frontier_advance(
            &mut self,
            _frontier: $crate::stream::time::Frontier,
            _ctx: &mut $crate::stream::operator::OperatorContext,
        ) -> $crate::error::ReflowResult<()> {
            Ok(())
        }
    };
}

/// A change that user logic failed to evaluate
#[derive(Clone, Debug, PartialEq)]
pub struct RowError {
    /// Path of the operator that failed
    pub operator: String,
    pub message: String,
    /// The offending change
    pub change: Change,
}

impl RowError {
    /// Representation used on the error output.
    ///
    /// The row is `[operator, message, (offending values...)]` and keeps the
    /// multiplicity of the offending change, so a failing insertion and the
    /// matching failing retraction cancel out.
    pub fn into_change(self) -> Change {
        let values = vec![
            Value::from(self.operator),
            Value::from(self.message),
            Value::tuple(self.change.row.values().to_vec()),
        ];
        Change::new(
            self.change.row.with_values(values),
            self.change.time,
            self.change.diff,
        )
    }
}

/// Side outputs collected while running a step
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub(crate) errors: Vec<RowError>,
    pub(crate) late: Vec<Change>,
}

/// Context available to an Operator
pub struct OperatorContext<'a> {
    /// Path of the operator in the dataflow graph
    pub(crate) operator: &'a str,
    pub(crate) shard: usize,
    pub(crate) time: &'a LoopTime,
    /// State of the shard
    pub(crate) state: &'a mut StateStore,
    pub(crate) exchange: &'a mut Exchanger,
    /// Reference to logger
    pub(crate) logger: &'a ReflowLogger,
    pub(crate) diagnostics: &'a mut Diagnostics,
    pub(crate) output: Vec<Change>,
}

impl<'a> OperatorContext<'a> {
    #[inline]
    pub fn output(&mut self, change: Change) {
        if change.diff != 0 {
            self.output.push(change);
        }
    }

    #[inline]
    pub fn state(&mut self) -> &mut StateStore {
        self.state
    }

    /// Enable operators to log
    ///
    /// `error!(ctx.log(), "Something bad happened!");`
    #[inline]
    pub fn log(&self) -> &ReflowLogger {
        self.logger
    }

    #[inline]
    pub fn operator(&self) -> &str {
        self.operator
    }

    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Time of the step, including loop rounds
    #[inline]
    pub fn time(&self) -> &LoopTime {
        self.time
    }

    /// Outer timestamp of the step
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.time.outer()
    }

    /// Routes a change that failed evaluation to the error output
    pub fn report_error(&mut self, change: Change, error: EvalError) {
        slog::debug!(
            self.logger,
            "Evaluation failed";
            "operator" => self.operator,
            "error" => error.message(),
            "time" => %change.time
        );
        self.diagnostics.errors.push(RowError {
            operator: self.operator.to_string(),
            message: error.message().to_string(),
            change,
        });
    }

    /// Reports a failure that is not tied to a single input change.
    ///
    /// A negative `diff` withdraws an error reported at an earlier time.
    pub fn report_row_error(&mut self, row: Row, error: EvalError, diff: Diff) {
        let change = Change::new(row, self.timestamp(), diff);
        self.report_error(change, error);
    }

    /// Routes a change that arrived after its window closed to the late-data output
    pub fn report_late(&mut self, change: Change) {
        self.diagnostics.late.push(change);
    }

    /// Maximum of `value` across all shards.
    ///
    /// Every shard must call this at the same point of the step.
    pub fn global_max(&mut self, value: i64) -> ReflowResult<i64> {
        self.exchange.all_reduce(value, Reduction::Max)
    }

    pub(crate) fn take_output(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.output)
    }
}

/// The closed set of operators a graph node can run
pub enum OperatorNode {
    Map(Map),
    Filter(Filter),
    FlatMap(FlatMap),
    Concat(Concat),
    Negate(Negate),
    Join(Join),
    Reduce(Reduce),
    Distinct(Distinct),
    Window(Window),
}

impl Operator for OperatorNode {
    fn register_states(&self, state: &mut StateStore) -> StateResult<()> {
        match self {
            OperatorNode::Map(op) => op.register_states(state),
            OperatorNode::Filter(op) => op.register_states(state),
            OperatorNode::FlatMap(op) => op.register_states(state),
            OperatorNode::Concat(op) => op.register_states(state),
            OperatorNode::Negate(op) => op.register_states(state),
            OperatorNode::Join(op) => op.register_states(state),
            OperatorNode::Reduce(op) => op.register_states(state),
            OperatorNode::Distinct(op) => op.register_states(state),
            OperatorNode::Window(op) => op.register_states(state),
        }
    }

    fn on_change(
        &mut self,
        port: usize,
        change: Change,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        match self {
            OperatorNode::Map(op) => op.on_change(port, change, ctx),
            OperatorNode::Filter(op) => op.on_change(port, change, ctx),
            OperatorNode::FlatMap(op) => op.on_change(port, change, ctx),
            OperatorNode::Concat(op) => op.on_change(port, change, ctx),
            OperatorNode::Negate(op) => op.on_change(port, change, ctx),
            OperatorNode::Join(op) => op.on_change(port, change, ctx),
            OperatorNode::Reduce(op) => op.on_change(port, change, ctx),
            OperatorNode::Distinct(op) => op.on_change(port, change, ctx),
            OperatorNode::Window(op) => op.on_change(port, change, ctx),
        }
    }

    fn on_frontier_advance(
        &mut self,
        frontier: Frontier,
        ctx: &mut OperatorContext,
    ) -> ReflowResult<()> {
        match self {
            OperatorNode::Map(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Filter(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::FlatMap(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Concat(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Negate(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Join(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Reduce(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Distinct(op) => op.on_frontier_advance(frontier, ctx),
            OperatorNode::Window(op) => op.on_frontier_advance(frontier, ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::conf::logger::discard_logger;

    /// Runs operators outside of a worker, as a single shard
    pub(crate) struct Harness {
        pub(crate) state: StateStore,
        pub(crate) exchange: Exchanger,
        pub(crate) logger: ReflowLogger,
        pub(crate) diagnostics: Diagnostics,
    }

    impl Harness {
        pub(crate) fn new(op: &dyn Operator) -> Harness {
            let mut state = StateStore::new();
            op.register_states(&mut state).unwrap();
            Harness {
                state,
                exchange: Exchanger::local(),
                logger: discard_logger(),
                diagnostics: Diagnostics::default(),
            }
        }

        /// Feeds `changes` at `time` and advances the frontier past it
        pub(crate) fn step<O: Operator>(
            &mut self,
            op: &mut O,
            time: u64,
            changes: Vec<(usize, Change)>,
            frontier: Frontier,
        ) -> Vec<Change> {
            let time = LoopTime::root(Timestamp(time));
            let mut ctx = OperatorContext {
                operator: "test",
                shard: 0,
                time: &time,
                state: &mut self.state,
                exchange: &mut self.exchange,
                logger: &self.logger,
                diagnostics: &mut self.diagnostics,
                output: Vec::new(),
            };
            for (port, change) in changes {
                op.on_change(port, change, &mut ctx).unwrap();
            }
            op.on_frontier_advance(frontier, &mut ctx).unwrap();
            let mut out = ctx.take_output();
            crate::data::consolidate(&mut out);
            out
        }
    }
}
