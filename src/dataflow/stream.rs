// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::{Row, Value},
    dataflow::dfg::{DFGNode, DFGNodeID, DFGNodeKind, DFG, ROOT_SCOPE},
    error::EvalError,
    stream::{
        operator::{
            function::ReflowFnBounds,
            join::JoinSpec,
            reduce::Reducer,
            window::WindowSpec,
        },
        sink::Sink,
        source::Source,
    },
};
use std::{cell::RefCell, rc::Rc, sync::Arc};

/// Everything a [Pipeline](crate::pipeline::Pipeline) collects before it is built
pub(crate) struct Context {
    pub(crate) dfg: DFG,
    pub(crate) sources: Vec<Box<dyn Source>>,
    /// Sinks of output nodes, then the error and late sinks
    pub(crate) sinks: Vec<Box<dyn Sink>>,
    pub(crate) error_sink: Option<usize>,
    pub(crate) late_sink: Option<usize>,
    /// Problems found while the graph was described
    pub(crate) errors: Vec<String>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            dfg: DFG::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
            error_sink: None,
            late_sink: None,
            errors: Vec::new(),
        }
    }
}

impl Context {
    pub(crate) fn add_source(&mut self, source: Box<dyn Source>) -> DFGNodeID {
        let index = self.sources.len();
        self.sources.push(source);
        self.dfg.insert(DFGNode::new(
            DFGNodeKind::Input { source: index },
            vec![],
            ROOT_SCOPE,
        ))
    }

    pub(crate) fn add_sink(&mut self, sink: Box<dyn Sink>) -> usize {
        self.sinks.push(sink);
        self.sinks.len() - 1
    }
}

/// High-level handle on a collection produced by a node of the dataflow graph.
///
/// Streams are cheap to clone, every transformation adds a node and returns
/// a handle on its output.
#[derive(Clone)]
pub struct Stream {
    /// ID of the node which outputs this stream.
    id: DFGNodeID,
    scope: usize,
    ctx: Rc<RefCell<Context>>,
}

impl Stream {
    pub(crate) fn new(id: DFGNodeID, scope: usize, ctx: Rc<RefCell<Context>>) -> Self {
        Stream { id, scope, ctx }
    }

    pub fn id(&self) -> DFGNodeID {
        self.id
    }

    /// Replaces the values of every row
    pub fn map<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> Vec<Value> + ReflowFnBounds,
    {
        self.try_map(move |row: &Row| -> Result<Vec<Value>, EvalError> { Ok(f(row)) })
    }

    /// Replaces the values of every row, rows that fail go to the error output
    pub fn try_map<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> Result<Vec<Value>, EvalError> + ReflowFnBounds,
    {
        self.unary(DFGNodeKind::Map(Arc::new(f)))
    }

    pub fn filter<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> bool + ReflowFnBounds,
    {
        self.try_filter(move |row: &Row| -> Result<bool, EvalError> { Ok(f(row)) })
    }

    pub fn try_filter<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> Result<bool, EvalError> + ReflowFnBounds,
    {
        self.unary(DFGNodeKind::Filter(Arc::new(f)))
    }

    /// Replaces every row with any number of rows
    pub fn flat_map<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> Vec<Vec<Value>> + ReflowFnBounds,
    {
        self.try_flat_map(move |row: &Row| -> Result<Vec<Vec<Value>>, EvalError> { Ok(f(row)) })
    }

    pub fn try_flat_map<F>(&self, f: F) -> Stream
    where
        F: Fn(&Row) -> Result<Vec<Vec<Value>>, EvalError> + ReflowFnBounds,
    {
        self.unary(DFGNodeKind::FlatMap(Arc::new(f)))
    }

    /// Union of this stream and `others`, multiplicities add up
    pub fn concat(&self, others: &[&Stream]) -> Stream {
        let mut inputs = vec![self];
        inputs.extend_from_slice(others);
        self.node(DFGNodeKind::Concat, &inputs)
    }

    /// Flips the multiplicity of every change
    pub fn negate(&self) -> Stream {
        self.unary(DFGNodeKind::Negate)
    }

    /// Rows of this stream that are not in `other`, counting multiplicities
    pub fn difference(&self, other: &Stream) -> Stream {
        self.concat(&[&other.negate()])
    }

    /// Equi-join with `other`, this stream is the left side
    pub fn join(&self, other: &Stream, spec: JoinSpec) -> Stream {
        if let Err(msg) = spec.validate() {
            self.ctx.borrow_mut().errors.push(msg);
        }
        self.node(DFGNodeKind::Join(spec), &[self, other])
    }

    /// One row per group holding the group's values followed by one value per reducer
    pub fn reduce(&self, group_by: Vec<usize>, reducers: Vec<Reducer>) -> Stream {
        if reducers.is_empty() {
            self.ctx
                .borrow_mut()
                .errors
                .push("reduce needs at least one reducer".to_string());
        }
        self.unary(DFGNodeKind::Reduce { group_by, reducers })
    }

    /// Number of rows per group
    pub fn count(&self, group_by: Vec<usize>) -> Stream {
        self.reduce(group_by, vec![Reducer::Count])
    }

    /// Every row with a positive multiplicity, exactly once.
    ///
    /// Rows count as equal when their values are, the output rows are keyed
    /// by their values.
    pub fn distinct(&self) -> Stream {
        self.unary(DFGNodeKind::Distinct)
    }

    /// Grouped aggregation per time window
    pub fn window(&self, spec: WindowSpec) -> Stream {
        if let Err(msg) = spec.validate() {
            self.ctx.borrow_mut().errors.push(msg);
        }
        self.unary(DFGNodeKind::Window(spec))
    }

    /// Repeats `body` on a loop variable until it stops changing.
    ///
    /// The variable starts out as this stream at every timestamp. `body`
    /// receives the scope of the loop, used to bring in other streams, and the
    /// variable, and returns the next value of the variable. The result is the
    /// variable once it reached its fixpoint. Rows of the variable are compared
    /// by their values.
    ///
    /// Restarting from the input means every timestamp that changes the loop
    /// retracts and derives again the rows the body derived before. Operators
    /// in the body keep their state, so each round only costs the changes it
    /// carries, but a timestamp costs work in proportion to the whole fixpoint
    /// rather than to its own input changes. Only the net change of the
    /// variable leaves the loop.
    pub fn iterate<F>(&self, body: F) -> Stream
    where
        F: FnOnce(&IterationScope, Stream) -> Stream,
    {
        let parent = self.scope;
        let (scope, variable) = {
            let mut ctx = self.ctx.borrow_mut();
            let scope = ctx.dfg.new_scope(parent);
            let variable = ctx
                .dfg
                .insert(DFGNode::new(DFGNodeKind::Variable { scope }, vec![], scope));
            (scope, variable)
        };
        let iteration = IterationScope {
            scope,
            parent,
            ctx: self.ctx.clone(),
        };
        let result = body(&iteration, Stream::new(variable, scope, self.ctx.clone()));
        if !Rc::ptr_eq(&result.ctx, &self.ctx) {
            self.ctx
                .borrow_mut()
                .errors
                .push("iterate returned a stream of another pipeline".to_string());
        }

        let mut ctx = self.ctx.borrow_mut();
        if result.scope != scope {
            ctx.errors
                .push("iterate must return a stream computed inside its loop".to_string());
        }
        ctx.dfg.insert(DFGNode::new(
            DFGNodeKind::LoopResult { scope },
            vec![result.id],
            scope,
        ));
        let id = ctx
            .dfg
            .insert(DFGNode::new(DFGNodeKind::Iterate { scope }, vec![self.id], parent));
        Stream::new(id, parent, self.ctx.clone())
    }

    /// Delivers the changes of this stream to `sink` once their time is closed
    pub fn sink(&self, sink: impl Sink) {
        let mut ctx = self.ctx.borrow_mut();
        let index = ctx.add_sink(Box::new(sink));
        if self.scope != ROOT_SCOPE {
            ctx.errors
                .push("sinks can only be attached outside of iterations".to_string());
        }
        ctx.dfg.insert(DFGNode::new(
            DFGNodeKind::Output { sink: index },
            vec![self.id],
            self.scope,
        ));
    }

    fn unary(&self, kind: DFGNodeKind) -> Stream {
        self.node(kind, &[self])
    }

    fn node(&self, kind: DFGNodeKind, inputs: &[&Stream]) -> Stream {
        let mut ctx = self.ctx.borrow_mut();
        if inputs.iter().any(|s| !Rc::ptr_eq(&s.ctx, &self.ctx)) {
            ctx.errors.push(format!(
                "{} combines streams of different pipelines",
                kind.descriptor()
            ));
        }
        if inputs.iter().any(|s| s.scope != self.scope) {
            ctx.errors.push(format!(
                "{} combines streams of different iteration scopes, use IterationScope::enter",
                kind.descriptor()
            ));
        }
        let ingoing = inputs.iter().map(|s| s.id).collect();
        let id = ctx.dfg.insert(DFGNode::new(kind, ingoing, self.scope));
        Stream::new(id, self.scope, self.ctx.clone())
    }
}

/// The loop of an [Stream::iterate] call
pub struct IterationScope {
    scope: usize,
    parent: usize,
    ctx: Rc<RefCell<Context>>,
}

impl IterationScope {
    /// Makes a stream of the enclosing scope available inside the loop.
    ///
    /// The stream keeps its contents in every round of the loop.
    pub fn enter(&self, stream: &Stream) -> Stream {
        let mut ctx = self.ctx.borrow_mut();
        if stream.scope != self.parent {
            ctx.errors.push(
                "only streams of the directly enclosing scope can enter an iteration".to_string(),
            );
        }
        let id = ctx.dfg.insert(DFGNode::new(
            DFGNodeKind::Enter { scope: self.scope },
            vec![stream.id],
            self.scope,
        ));
        Stream::new(id, self.scope, self.ctx.clone())
    }

    pub fn depth(&self) -> usize {
        let ctx = self.ctx.borrow();
        let mut depth = 1;
        let mut scope = self.parent;
        while let Some(parent) = ctx.dfg.parent_scope(scope) {
            depth += 1;
            scope = parent;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::source::CollectionSource;

    fn context() -> Rc<RefCell<Context>> {
        Rc::new(RefCell::new(Context::default()))
    }

    #[test]
    fn stream_graph_test() {
        let ctx = context();
        let id = ctx
            .borrow_mut()
            .add_source(Box::new(CollectionSource::new("numbers", vec![])));
        let numbers = Stream::new(id, ROOT_SCOPE, ctx.clone());
        let doubled = numbers.map(|row: &Row| vec![Value::Int(row.values().len() as i64 * 2)]);
        let both = numbers.concat(&[&doubled]);
        let _ = both.distinct();

        let ctx = ctx.borrow();
        assert_eq!(ctx.dfg.len(), 4);
        assert!(ctx.errors.is_empty());
        assert!(ctx.dfg.validate().is_ok());
    }

    #[test]
    fn iterate_graph_test() {
        let ctx = context();
        let id = ctx
            .borrow_mut()
            .add_source(Box::new(CollectionSource::new("edges", vec![])));
        let edges = Stream::new(id, ROOT_SCOPE, ctx.clone());
        let closure = edges.iterate(|scope: &IterationScope, paths: Stream| {
            assert_eq!(scope.depth(), 1);
            let edges = scope.enter(&edges);
            paths
                .join(&edges, JoinSpec::inner(vec![1], vec![0]))
                .map(|row: &Row| vec![row.values()[0].clone(), row.values()[3].clone()])
                .concat(&[&edges])
                .distinct()
        });

        let ctx = ctx.borrow();
        assert!(ctx.errors.is_empty(), "{:?}", ctx.errors);
        assert!(ctx.dfg.validate().is_ok());
        // the iterate node comes last and lives in the root scope
        let node = ctx.dfg.get(&closure.id()).unwrap();
        assert_eq!(node.scope(), ROOT_SCOPE);
        assert_eq!(closure.id().index(), ctx.dfg.len() - 1);
    }

    #[test]
    fn scope_mismatch_test() {
        let ctx = context();
        let id = ctx
            .borrow_mut()
            .add_source(Box::new(CollectionSource::new("edges", vec![])));
        let edges = Stream::new(id, ROOT_SCOPE, ctx.clone());
        let _ = edges.iterate(|_scope: &IterationScope, paths: Stream| paths.concat(&[&edges]));
        assert_eq!(ctx.borrow().errors.len(), 1);
    }
}
