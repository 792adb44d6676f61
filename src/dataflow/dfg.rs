// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::stream::{
    channel::strategy::{ChannelStrategy, KeyBy},
    operator::{
        distinct::Distinct,
        function::{Concat, Filter, FilterFn, FlatMap, FlatMapFn, Map, MapFn, Negate},
        join::{Join, JoinSpec},
        reduce::{Reduce, Reducer},
        window::{Window, WindowSpec},
        OperatorNode,
    },
};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Scope of the nodes outside of any iteration
pub const ROOT_SCOPE: usize = 0;

/// A logical dataflow-graph.
#[derive(Default)]
pub struct DFG {
    /// The graph is represented as a Vec for maximum space-efficiency.
    /// This works since nodes are never deleted from the graph.
    graph: Vec<DFGNode>,
    /// Parent of every scope, the root scope has none
    scopes: Vec<Option<usize>>,
}

impl DFG {
    pub fn new() -> Self {
        DFG {
            graph: Vec::new(),
            scopes: vec![None],
        }
    }

    /// Inserts a [`DFGNode`] into the dataflow graph and returns a unique
    /// identifier of it.
    pub fn insert(&mut self, node: DFGNode) -> DFGNodeID {
        let id = DFGNodeID(self.graph.len());
        self.graph.push(node);
        id
    }

    /// Opens a new iteration scope nested in `parent`
    pub fn new_scope(&mut self, parent: usize) -> usize {
        if self.scopes.is_empty() {
            self.scopes.push(None);
        }
        self.scopes.push(Some(parent));
        self.scopes.len() - 1
    }

    /// Returns a reference to the [`DFGNode`] associated to a [`DFGNodeID`].
    pub fn get(&self, id: &DFGNodeID) -> Option<&DFGNode> {
        self.graph.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn scopes(&self) -> usize {
        self.scopes.len().max(1)
    }

    pub fn parent_scope(&self, scope: usize) -> Option<usize> {
        self.scopes.get(scope).copied().flatten()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (DFGNodeID, &DFGNode)> {
        self.graph
            .iter()
            .enumerate()
            .map(|(i, node)| (DFGNodeID(i), node))
    }

    /// Nodes that consume the output of `id`
    pub fn successors(&self, id: DFGNodeID) -> Vec<DFGNodeID> {
        self.nodes()
            .filter(|(_, node)| node.ingoing.contains(&id))
            .map(|(succ, _)| succ)
            .collect()
    }

    /// Whether some window operator needs frontier progress without new input
    pub(crate) fn has_windows(&self) -> bool {
        self.graph
            .iter()
            .any(|node| matches!(node.kind, DFGNodeKind::Window(_)))
    }

    /// Stable hash of the graph's shape and operator descriptors.
    ///
    /// User functions cannot be hashed, so two graphs that only differ in the
    /// closures they run share a fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for (id, node) in self.nodes() {
            hasher.write(
                format!(
                    "{}|{}|{}|{:?};",
                    id.0,
                    node.scope,
                    node.kind.descriptor(),
                    node.ingoing.iter().map(|i| i.0).collect::<Vec<_>>()
                )
                .as_bytes(),
            );
        }
        hasher.finish()
    }

    /// Checks that every edge stays within a scope or enters it explicitly
    pub(crate) fn validate(&self) -> Result<(), String> {
        for (id, node) in self.nodes() {
            for input in &node.ingoing {
                let upstream = match self.get(input) {
                    Some(upstream) if input.0 < id.0 => upstream,
                    _ => return Err(format!("node {} has an invalid input {}", id, input)),
                };
                let expected = match &node.kind {
                    DFGNodeKind::Enter { scope } => self.parent_scope(*scope),
                    _ => Some(node.scope),
                };
                if expected != Some(upstream.scope) {
                    return Err(format!(
                        "{} ({}) uses a stream of another iteration scope, enter it first",
                        node.name, id
                    ));
                }
            }
            if let DFGNodeKind::Output { .. } = node.kind {
                if node.scope != ROOT_SCOPE {
                    return Err(format!(
                        "{} ({}) writes to a sink from inside an iteration",
                        node.name, id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// The ID of a [`DFGNode`] in the dataflow graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DFGNodeID(pub(crate) usize);

impl DFGNodeID {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }

    /// Name under which the node's state is registered
    pub(crate) fn path(&self) -> String {
        format!("n{}", self.0)
    }
}

impl std::fmt::Display for DFGNodeID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A logical node in the dataflow graph.
pub struct DFGNode {
    pub(crate) kind: DFGNodeKind,
    /// Ingoing edges to a node, in port order.
    pub(crate) ingoing: Vec<DFGNodeID>,
    /// Iteration scope the node runs in
    pub(crate) scope: usize,
    pub(crate) name: String,
}

impl DFGNode {
    pub fn new(kind: DFGNodeKind, ingoing: Vec<DFGNodeID>, scope: usize) -> Self {
        let name = kind.descriptor();
        Self {
            kind,
            ingoing,
            scope,
            name,
        }
    }

    pub fn kind(&self) -> &DFGNodeKind {
        &self.kind
    }

    pub fn ingoing(&self) -> &[DFGNodeID] {
        &self.ingoing
    }

    pub fn scope(&self) -> usize {
        self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How the changes of input `port` reach this node
    pub(crate) fn strategy(&self, port: usize) -> ChannelStrategy {
        match &self.kind {
            DFGNodeKind::Join(spec) if port == 0 => {
                ChannelStrategy::KeyBy(KeyBy::Columns(spec.left_on.clone()))
            }
            DFGNodeKind::Join(spec) => ChannelStrategy::KeyBy(KeyBy::Columns(spec.right_on.clone())),
            DFGNodeKind::Reduce { group_by, .. } => {
                ChannelStrategy::KeyBy(KeyBy::Columns(group_by.clone()))
            }
            DFGNodeKind::Window(spec) => {
                ChannelStrategy::KeyBy(KeyBy::Columns(spec.group_by.clone()))
            }
            DFGNodeKind::Distinct | DFGNodeKind::Iterate { .. } | DFGNodeKind::LoopResult { .. } => {
                ChannelStrategy::KeyBy(KeyBy::Values)
            }
            _ => ChannelStrategy::Forward,
        }
    }
}

/// What a node of the dataflow graph does
pub enum DFGNodeKind {
    /// Changes polled from the source with index `source`
    Input { source: usize },
    Map(MapFn),
    Filter(FilterFn),
    FlatMap(FlatMapFn),
    Concat,
    Negate,
    Join(JoinSpec),
    Reduce {
        group_by: Vec<usize>,
        reducers: Vec<Reducer>,
    },
    Distinct,
    Window(WindowSpec),
    /// The loop variable of `scope`
    Variable { scope: usize },
    /// Brings a collection of the parent scope into `scope`
    Enter { scope: usize },
    /// The next value of the loop variable of `scope`
    LoopResult { scope: usize },
    /// Runs `scope` to a fixpoint, starting from its input
    Iterate { scope: usize },
    /// Changes delivered to the sink with index `sink`
    Output { sink: usize },
}

impl DFGNodeKind {
    pub fn descriptor(&self) -> String {
        match self {
            DFGNodeKind::Input { source } => format!("input({})", source),
            DFGNodeKind::Map(_) => "map".to_string(),
            DFGNodeKind::Filter(_) => "filter".to_string(),
            DFGNodeKind::FlatMap(_) => "flat_map".to_string(),
            DFGNodeKind::Concat => "concat".to_string(),
            DFGNodeKind::Negate => "negate".to_string(),
            DFGNodeKind::Join(spec) => format!(
                "join({:?},{:?},{:?})",
                spec.kind, spec.left_on, spec.right_on
            ),
            DFGNodeKind::Reduce { group_by, reducers } => {
                format!("reduce({:?},{:?})", group_by, reducers)
            }
            DFGNodeKind::Distinct => "distinct".to_string(),
            DFGNodeKind::Window(spec) => format!(
                "window({:?},{:?},{:?},{:?})",
                spec.assigner, spec.time, spec.group_by, spec.reducers
            ),
            DFGNodeKind::Variable { scope } => format!("variable({})", scope),
            DFGNodeKind::Enter { scope } => format!("enter({})", scope),
            DFGNodeKind::LoopResult { scope } => format!("loop_result({})", scope),
            DFGNodeKind::Iterate { scope } => format!("iterate({})", scope),
            DFGNodeKind::Output { sink } => format!("output({})", sink),
        }
    }

    /// Creates the operator a shard runs for this node, if it is one
    pub(crate) fn operator(&self, path: &str) -> Option<OperatorNode> {
        let op = match self {
            DFGNodeKind::Map(f) => OperatorNode::Map(Map::new(f.clone())),
            DFGNodeKind::Filter(f) => OperatorNode::Filter(Filter::new(f.clone())),
            DFGNodeKind::FlatMap(f) => OperatorNode::FlatMap(FlatMap::new(f.clone())),
            DFGNodeKind::Concat => OperatorNode::Concat(Concat),
            DFGNodeKind::Negate => OperatorNode::Negate(Negate),
            DFGNodeKind::Join(spec) => OperatorNode::Join(Join::new(path, spec.clone())),
            DFGNodeKind::Reduce { group_by, reducers } => {
                OperatorNode::Reduce(Reduce::new(path, group_by.clone(), reducers.clone()))
            }
            DFGNodeKind::Distinct => OperatorNode::Distinct(Distinct::new(path)),
            DFGNodeKind::Window(spec) => OperatorNode::Window(Window::new(path, spec.clone())),
            _ => return None,
        };
        Some(op)
    }
}
