// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    dataflow::dfg::{DFGNodeKind, DFG},
    error::{Error, ReflowResult},
    stream::time::Frontier,
};
use std::collections::BTreeSet;

/// Tracks the frontier of every node of the graph and the closed frontier.
///
/// A node has passed a time once every source it transitively reads from
/// has. The graph has closed a time once every node has, and that closed
/// frontier never moves back.
pub(crate) struct ProgressTracker {
    /// Sources each node reads from
    upstream: Vec<BTreeSet<usize>>,
    frontiers: Vec<Frontier>,
    closed: Frontier,
}

impl ProgressTracker {
    pub(crate) fn new(dfg: &DFG) -> Self {
        let mut upstream: Vec<BTreeSet<usize>> = Vec::with_capacity(dfg.len());
        for (_, node) in dfg.nodes() {
            let mut sources = BTreeSet::new();
            if let DFGNodeKind::Input { source } = node.kind() {
                sources.insert(*source);
            }
            for input in node.ingoing() {
                if let Some(inherited) = upstream.get(input.index()) {
                    sources.extend(inherited.iter().copied());
                }
            }
            upstream.push(sources);
        }
        // loop variables follow the inputs of their iterate node
        let mut loop_sources = Vec::new();
        for (_, node) in dfg.nodes() {
            if let DFGNodeKind::Iterate { scope } = node.kind() {
                loop_sources.push((*scope, upstream_of(&upstream, node.ingoing().iter().map(|i| i.index()))));
            }
        }
        for (id, node) in dfg.nodes() {
            let scope = node.scope();
            for (loop_scope, sources) in &loop_sources {
                if scope == *loop_scope || is_nested(dfg, scope, *loop_scope) {
                    upstream[id.index()].extend(sources.iter().copied());
                }
            }
        }
        let frontiers = vec![Frontier::MIN; upstream.len()];
        ProgressTracker {
            upstream,
            frontiers,
            closed: Frontier::MIN,
        }
    }

    /// Recomputes node frontiers from the source frontiers and closes every
    /// time below both the sources and `limit`
    pub(crate) fn advance(&mut self, sources: &[Frontier], limit: Frontier) -> ReflowResult<Frontier> {
        for (frontier, upstream) in self.frontiers.iter_mut().zip(&self.upstream) {
            *frontier = upstream
                .iter()
                .filter_map(|s| sources.get(*s).copied())
                .min()
                .unwrap_or_else(Frontier::closed);
        }
        let closed = sources
            .iter()
            .copied()
            .min()
            .unwrap_or_else(Frontier::closed)
            .meet(limit);
        self.close(closed)?;
        Ok(self.closed)
    }

    /// Records that every time below `frontier` is closed
    pub(crate) fn close(&mut self, frontier: Frontier) -> ReflowResult<()> {
        if frontier < self.closed {
            return Err(Error::InvariantViolation {
                msg: format!(
                    "closed frontier moved back from {} to {}",
                    self.closed, frontier
                ),
            });
        }
        self.closed = frontier;
        Ok(())
    }

    /// Starts from a restored frontier
    pub(crate) fn restore(&mut self, closed: Frontier) {
        self.closed = closed;
        for frontier in self.frontiers.iter_mut() {
            *frontier = closed;
        }
    }

    pub(crate) fn closed(&self) -> Frontier {
        self.closed
    }

    pub(crate) fn node_frontier(&self, node: usize) -> Option<Frontier> {
        self.frontiers.get(node).copied()
    }
}

fn upstream_of(upstream: &[BTreeSet<usize>], nodes: impl Iterator<Item = usize>) -> BTreeSet<usize> {
    nodes
        .filter_map(|n| upstream.get(n))
        .flat_map(|s| s.iter().copied())
        .collect()
}

fn is_nested(dfg: &DFG, mut scope: usize, ancestor: usize) -> bool {
    while let Some(parent) = dfg.parent_scope(scope) {
        if parent == ancestor {
            return true;
        }
        scope = parent;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::Timestamp,
        dataflow::dfg::{DFGNode, ROOT_SCOPE},
    };

    #[test]
    fn progress_tracker_test() {
        let mut dfg = DFG::new();
        let a = dfg.insert(DFGNode::new(DFGNodeKind::Input { source: 0 }, vec![], ROOT_SCOPE));
        let b = dfg.insert(DFGNode::new(DFGNodeKind::Input { source: 1 }, vec![], ROOT_SCOPE));
        let only_a = dfg.insert(DFGNode::new(DFGNodeKind::Negate, vec![a], ROOT_SCOPE));
        let both = dfg.insert(DFGNode::new(DFGNodeKind::Concat, vec![a, b], ROOT_SCOPE));

        let mut tracker = ProgressTracker::new(&dfg);
        let closed = tracker
            .advance(&[Frontier::at(Timestamp(5)), Frontier::at(Timestamp(3))], Frontier::closed())
            .unwrap();
        assert_eq!(closed, Frontier::at(Timestamp(3)));
        assert_eq!(tracker.node_frontier(only_a.index()), Some(Frontier::at(Timestamp(5))));
        assert_eq!(tracker.node_frontier(both.index()), Some(Frontier::at(Timestamp(3))));

        let closed = tracker
            .advance(&[Frontier::closed(), Frontier::at(Timestamp(4))], Frontier::closed())
            .unwrap();
        assert_eq!(closed, Frontier::at(Timestamp(4)));
        let closed = tracker
            .advance(&[Frontier::closed(), Frontier::closed()], Frontier::at(Timestamp(6)))
            .unwrap();
        assert_eq!(closed, Frontier::at(Timestamp(6)));
        assert!(tracker.close(Frontier::at(Timestamp(2))).is_err());
    }

    #[test]
    fn loop_progress_test() {
        let mut dfg = DFG::new();
        let input = dfg.insert(DFGNode::new(DFGNodeKind::Input { source: 0 }, vec![], ROOT_SCOPE));
        let scope = dfg.new_scope(ROOT_SCOPE);
        let var = dfg.insert(DFGNode::new(DFGNodeKind::Variable { scope }, vec![], scope));
        dfg.insert(DFGNode::new(DFGNodeKind::LoopResult { scope }, vec![var], scope));
        dfg.insert(DFGNode::new(DFGNodeKind::Iterate { scope }, vec![input], ROOT_SCOPE));

        let mut tracker = ProgressTracker::new(&dfg);
        tracker.advance(&[Frontier::at(Timestamp(7))], Frontier::closed()).unwrap();
        assert_eq!(tracker.node_frontier(var.index()), Some(Frontier::at(Timestamp(7))));
    }
}
