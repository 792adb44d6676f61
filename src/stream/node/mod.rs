// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    conf::logger::ReflowLogger,
    data::{partition::PartitionGroup, Change, Timestamp},
    dataflow::dfg::{DFGNodeKind, DFG, ROOT_SCOPE},
    error::{Error, ReflowResult},
    reportable_error,
    stream::{
        channel::{strategy::ChannelStrategy, Exchanger, PortedChanges, Reduction},
        operator::{iterate::LoopState, Diagnostics, Operator, OperatorContext, OperatorNode, RowError},
        time::{Frontier, LoopTime},
    },
};
use crossbeam_channel::{Receiver, Sender};
use reflow_state::{StateId, StateSnapshot, StateStore};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Work the coordinator hands to every shard
pub(crate) enum WorkerCommand {
    Step(StepCommand),
    Snapshot,
    Shutdown,
}

/// Runs the graph for one closed timestamp
pub(crate) struct StepCommand {
    pub(crate) time: Timestamp,
    /// Frontier of the inputs once this step is done
    pub(crate) frontier: Frontier,
    /// Changes of this shard's partition, per source
    pub(crate) inputs: Vec<Vec<Change>>,
}

/// What a shard produced during a step
#[derive(Debug, Default)]
pub(crate) struct StepOutput {
    /// Changes per sink
    pub(crate) sinks: Vec<Vec<Change>>,
    pub(crate) errors: Vec<Change>,
    pub(crate) late: Vec<Change>,
}

pub(crate) enum WorkerReport {
    Stepped { shard: usize, output: StepOutput },
    Snapshotted { shard: usize, snapshot: StateSnapshot },
    Failed { shard: usize, error: Error },
}

enum NodeInstance {
    Input { source: usize },
    Operator(OperatorNode),
    Variable { scope: usize },
    Enter,
    LoopResult { scope: usize },
    Iterate { scope: usize },
    Output { sink: usize },
}

struct NodeSlot {
    path: String,
    /// Upstream node and channel strategy per input port
    ingoing: Vec<(usize, ChannelStrategy)>,
    /// Whether some input needs changes from other shards
    exchanges: bool,
    instance: NodeInstance,
}

struct LoopInstance {
    state: LoopState,
    /// Variable delta of the current round
    delta: Vec<Change>,
    /// Upstream nodes of the scope's enter nodes
    enters: Vec<usize>,
}

/// Executes the whole dataflow graph for the key partition of one shard.
///
/// Shards run the same sequence of nodes for every step. Whenever a node
/// needs changes partitioned by key, all shards meet in an exchange, so the
/// order of exchanges and reductions is identical across shards.
pub struct Worker {
    shard: usize,
    nodes: Vec<NodeSlot>,
    /// Node indexes of every scope in topological order
    scopes: Vec<Vec<usize>>,
    loops: BTreeMap<usize, LoopInstance>,
    sinks: usize,
    state: StateStore,
    exchanger: Exchanger,
    partitions: PartitionGroup,
    diagnostics: Diagnostics,
    iteration_limit: u32,
    logger: ReflowLogger,
}

impl Worker {
    /// Instantiates `dfg` for one shard, restoring its state from `snapshot`
    pub(crate) fn new(
        dfg: &DFG,
        sinks: usize,
        snapshot: Option<StateSnapshot>,
        exchanger: Exchanger,
        iteration_limit: u32,
        logger: &ReflowLogger,
    ) -> ReflowResult<Worker> {
        let shard = exchanger.shard();
        let mut state = match snapshot {
            Some(snapshot) => StateStore::restore(snapshot),
            None => StateStore::new(),
        };
        let mut nodes = Vec::with_capacity(dfg.len());
        let mut scopes = vec![Vec::new(); dfg.scopes()];
        let mut loops = BTreeMap::new();
        let mut enters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for (id, node) in dfg.nodes() {
            let path = id.path();
            let instance = match node.kind() {
                DFGNodeKind::Input { source } => NodeInstance::Input { source: *source },
                DFGNodeKind::Output { sink } => NodeInstance::Output { sink: *sink },
                DFGNodeKind::Variable { scope } => NodeInstance::Variable { scope: *scope },
                DFGNodeKind::Enter { scope } => {
                    if let Some(upstream) = node.ingoing().first() {
                        enters.entry(*scope).or_default().push(upstream.index());
                    }
                    NodeInstance::Enter
                }
                DFGNodeKind::LoopResult { scope } => NodeInstance::LoopResult { scope: *scope },
                DFGNodeKind::Iterate { scope } => {
                    let loop_state = LoopState::new(&path);
                    loop_state.register_states(&mut state)?;
                    loops.insert(
                        *scope,
                        LoopInstance {
                            state: loop_state,
                            delta: Vec::new(),
                            enters: Vec::new(),
                        },
                    );
                    NodeInstance::Iterate { scope: *scope }
                }
                kind => match kind.operator(&path) {
                    Some(op) => {
                        op.register_states(&mut state)?;
                        NodeInstance::Operator(op)
                    }
                    None => return reportable_error!("node {} has no operator", id),
                },
            };

            let ingoing: Vec<(usize, ChannelStrategy)> = node
                .ingoing()
                .iter()
                .enumerate()
                .map(|(port, upstream)| (upstream.index(), node.strategy(port)))
                .collect();
            let exchanges = ingoing.iter().any(|(_, s)| !s.is_forward());
            match scopes.get_mut(node.scope()) {
                Some(scope) => scope.push(id.index()),
                None => return reportable_error!("node {} is in unknown scope {}", id, node.scope()),
            }
            nodes.push(NodeSlot {
                path,
                ingoing,
                exchanges,
                instance,
            });
        }

        for (scope, upstreams) in enters {
            if let Some(lp) = loops.get_mut(&scope) {
                lp.enters = upstreams;
            }
        }

        let unclaimed = state.unclaimed();
        if !unclaimed.is_empty() {
            let ids: Vec<String> = unclaimed.iter().map(|id| id.to_string()).collect();
            return Err(Error::CheckpointMismatch {
                msg: format!("restored state {} has no operator", ids.join(", ")),
            });
        }

        let partitions = PartitionGroup::new(exchanger.shards());
        Ok(Worker {
            shard,
            nodes,
            scopes,
            loops,
            sinks,
            state,
            exchanger,
            partitions,
            diagnostics: Diagnostics::default(),
            iteration_limit,
            logger: logger.new(slog::o!("shard" => shard)),
        })
    }

    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Total number of entries in the shard's state
    pub fn state_entries(&self) -> usize {
        self.state.entries()
    }

    /// Entries of every state the shard keeps, by state id
    pub fn state_summary(&self) -> BTreeMap<StateId, usize> {
        self.state.entries_by_state()
    }

    /// Serves commands until a shutdown, a failure or a closed channel.
    ///
    /// Returns the worker so that a later run can continue with its state.
    pub(crate) fn run(
        mut self,
        commands: Receiver<WorkerCommand>,
        reports: Sender<WorkerReport>,
    ) -> Worker {
        let _guard = PanicGuard {
            shard: self.shard,
            abort: self.exchanger.abort_flag(),
            reports: reports.clone(),
        };
        slog::debug!(self.logger, "Worker started"; "nodes" => self.nodes.len());

        while let Ok(command) = commands.recv() {
            let report = match command {
                WorkerCommand::Step(step) => match self.step(step) {
                    Ok(output) => WorkerReport::Stepped {
                        shard: self.shard,
                        output,
                    },
                    Err(error) => self.fail(error),
                },
                WorkerCommand::Snapshot => match self.state.snapshot() {
                    Ok(snapshot) => WorkerReport::Snapshotted {
                        shard: self.shard,
                        snapshot,
                    },
                    Err(error) => self.fail(error.into()),
                },
                WorkerCommand::Shutdown => break,
            };
            let failed = matches!(report, WorkerReport::Failed { .. });
            if reports.send(report).is_err() || failed {
                break;
            }
        }
        slog::debug!(self.logger, "Worker stopped");
        self
    }

    fn fail(&mut self, error: Error) -> WorkerReport {
        if error.is_abort() {
            slog::debug!(self.logger, "Worker aborted"; "reason" => %error);
        } else {
            slog::error!(self.logger, "Worker failed"; "error" => %error);
            self.exchanger.abort();
        }
        WorkerReport::Failed {
            shard: self.shard,
            error,
        }
    }

    pub(crate) fn step(&mut self, step: StepCommand) -> ReflowResult<StepOutput> {
        let StepCommand {
            time,
            frontier,
            mut inputs,
        } = step;
        let mut outputs: Vec<Vec<Change>> = vec![Vec::new(); self.nodes.len()];
        let mut sinks: Vec<Vec<Change>> = vec![Vec::new(); self.sinks];
        let root = LoopTime::root(time);
        {
            let mut io = StepIo {
                outputs: &mut outputs,
                inputs: &mut inputs,
                sinks: &mut sinks,
            };
            self.run_scope(ROOT_SCOPE, &root, frontier, &mut io)?;
        }
        slog::trace!(self.logger, "Step done"; "time" => %time, "frontier" => %frontier);

        let diagnostics = std::mem::take(&mut self.diagnostics);
        Ok(StepOutput {
            sinks,
            errors: diagnostics
                .errors
                .into_iter()
                .map(RowError::into_change)
                .collect(),
            late: diagnostics.late,
        })
    }

    fn run_scope(
        &mut self,
        scope: usize,
        time: &LoopTime,
        frontier: Frontier,
        io: &mut StepIo,
    ) -> ReflowResult<()> {
        let ids = match self.scopes.get(scope) {
            Some(ids) => ids.clone(),
            None => return reportable_error!("unknown scope {}", scope),
        };
        for id in ids {
            let produced = match &self.nodes[id].instance {
                NodeInstance::Input { source } => {
                    let source = *source;
                    io.inputs.get_mut(source).map(std::mem::take).unwrap_or_default()
                }
                NodeInstance::Variable { scope } => {
                    let scope = *scope;
                    self.loops
                        .get_mut(&scope)
                        .map(|lp| std::mem::take(&mut lp.delta))
                        .unwrap_or_default()
                }
                NodeInstance::Enter => {
                    // outer changes enter a loop once, in its first round
                    match self.nodes[id].ingoing.first() {
                        Some((upstream, _)) if time.round() == Some(0) => {
                            io.outputs[*upstream].clone()
                        }
                        _ => Vec::new(),
                    }
                }
                NodeInstance::Output { sink } => {
                    let sink = *sink;
                    let changes = self.gather(id, io.outputs.as_slice())?;
                    if let Some(buffer) = io.sinks.get_mut(sink) {
                        buffer.extend(changes.into_iter().map(|(_, c)| c));
                    }
                    Vec::new()
                }
                NodeInstance::LoopResult { scope } => {
                    let scope = *scope;
                    let changes = self.gather(id, io.outputs.as_slice())?;
                    self.absorb_result(scope, changes)?;
                    Vec::new()
                }
                NodeInstance::Iterate { scope } => {
                    let scope = *scope;
                    self.run_loop(id, scope, time, frontier, io)?
                }
                NodeInstance::Operator(_) => {
                    let changes = self.gather(id, io.outputs.as_slice())?;
                    self.run_operator(id, changes, time, frontier)?
                }
            };
            io.outputs[id] = produced;
        }
        Ok(())
    }

    /// Collects the input changes of node `id`, exchanging them between shards where needed
    fn gather(&mut self, id: usize, outputs: &[Vec<Change>]) -> ReflowResult<PortedChanges> {
        let slot = &self.nodes[id];
        let mut local: PortedChanges = Vec::new();
        let mut outgoing: Vec<PortedChanges> = vec![Vec::new(); self.partitions.shards()];
        for (port, (upstream, strategy)) in slot.ingoing.iter().enumerate() {
            for change in &outputs[*upstream] {
                if strategy.is_forward() {
                    local.push((port, change.clone()));
                } else {
                    let target = strategy.target(change, self.shard, &self.partitions);
                    outgoing[target].push((port, change.clone()));
                }
            }
        }
        if slot.exchanges {
            let received = self.exchanger.exchange(outgoing)?;
            local.extend(received);
        }
        Ok(local)
    }

    fn run_operator(
        &mut self,
        id: usize,
        changes: PortedChanges,
        time: &LoopTime,
        frontier: Frontier,
    ) -> ReflowResult<Vec<Change>> {
        let NodeSlot { path, instance, .. } = &mut self.nodes[id];
        let op = match instance {
            NodeInstance::Operator(op) => op,
            _ => return reportable_error!("node {} is not an operator", path),
        };
        let mut ctx = OperatorContext {
            operator: path.as_str(),
            shard: self.shard,
            time,
            state: &mut self.state,
            exchange: &mut self.exchanger,
            logger: &self.logger,
            diagnostics: &mut self.diagnostics,
            output: Vec::new(),
        };
        for (port, change) in changes {
            op.on_change(port, change, &mut ctx)?;
        }
        op.on_frontier_advance(frontier, &mut ctx)?;
        Ok(ctx.take_output())
    }

    fn absorb_result(&mut self, scope: usize, changes: PortedChanges) -> ReflowResult<()> {
        let lp = match self.loops.get_mut(&scope) {
            Some(lp) => lp,
            None => return reportable_error!("iteration scope {} is missing", scope),
        };
        for (_, change) in changes {
            lp.state.absorb_result(&mut self.state, change.row, change.diff)?;
        }
        Ok(())
    }

    /// Runs the loop body of `scope` round by round until no shard changes the variable
    fn run_loop(
        &mut self,
        id: usize,
        scope: usize,
        time: &LoopTime,
        frontier: Frontier,
        io: &mut StepIo,
    ) -> ReflowResult<Vec<Change>> {
        let initial = self.gather(id, io.outputs.as_slice())?;
        let outer = time.outer();
        let lp = match self.loops.get_mut(&scope) {
            Some(lp) => lp,
            None => return reportable_error!("iteration scope {} is missing", scope),
        };
        let mut activity = initial.len() as i64;
        activity += lp
            .enters
            .iter()
            .map(|upstream| io.outputs[*upstream].len() as i64)
            .sum::<i64>();
        for (_, change) in &initial {
            lp.state.absorb_input(&mut self.state, &change.row, change.diff)?;
        }
        if self.exchanger.all_reduce(activity, Reduction::Sum)? == 0 {
            return Ok(Vec::new());
        }

        let mut round_time = time.enter();
        self.prepare_round(scope, outer, true)?;
        loop {
            self.run_scope(scope, &round_time, frontier, io)?;
            let pending = self.prepare_round(scope, outer, false)?;
            if self.exchanger.all_reduce(pending, Reduction::Sum)? == 0 {
                break;
            }
            let round = round_time.round().unwrap_or(0) + 1;
            if round > self.iteration_limit {
                return Err(Error::IterationLimit {
                    operator: self.nodes[id].path.clone(),
                    limit: self.iteration_limit,
                    time: outer,
                });
            }
            round_time.advance();
        }
        slog::trace!(
            self.logger,
            "Fixpoint reached";
            "loop" => &self.nodes[id].path,
            "time" => %outer,
            "rounds" => round_time.round().unwrap_or(0) + 1
        );

        match self.loops.get_mut(&scope) {
            Some(lp) => Ok(lp
                .state
                .take_output()
                .into_iter()
                .map(|(row, diff)| Change::new(row, outer, diff))
                .collect()),
            None => reportable_error!("iteration scope {} is missing", scope),
        }
    }

    /// Computes the variable delta of the next round and returns its size on this shard
    fn prepare_round(&mut self, scope: usize, outer: Timestamp, first: bool) -> ReflowResult<i64> {
        let lp = match self.loops.get_mut(&scope) {
            Some(lp) => lp,
            None => return reportable_error!("iteration scope {} is missing", scope),
        };
        let delta = if first {
            lp.state.initial_delta(&mut self.state)?
        } else {
            lp.state.next_delta(&mut self.state)?
        };
        let size = delta.len() as i64;
        lp.delta = delta
            .into_iter()
            .map(|(row, diff)| Change::new(row, outer, diff))
            .collect();
        Ok(size)
    }
}

/// Buffers shared by all scopes of a step
struct StepIo<'a> {
    outputs: &'a mut Vec<Vec<Change>>,
    inputs: &'a mut Vec<Vec<Change>>,
    sinks: &'a mut Vec<Vec<Change>>,
}

/// Reports a panicking worker and stops its peers
struct PanicGuard {
    shard: usize,
    abort: Arc<AtomicBool>,
    reports: Sender<WorkerReport>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort.store(true, Ordering::SeqCst);
            let _ = self.reports.send(WorkerReport::Failed {
                shard: self.shard,
                error: Error::ReportableBug {
                    msg: format!("shard {} panicked", self.shard),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::logger::discard_logger,
        data::Row,
        dataflow::dfg::DFGNode,
        stream::operator::reduce::Reducer,
        values,
    };

    fn sum_graph() -> DFG {
        let mut dfg = DFG::new();
        let input = dfg.insert(DFGNode::new(DFGNodeKind::Input { source: 0 }, vec![], ROOT_SCOPE));
        let reduce = dfg.insert(DFGNode::new(
            DFGNodeKind::Reduce {
                group_by: vec![],
                reducers: vec![Reducer::Sum(1)],
            },
            vec![input],
            ROOT_SCOPE,
        ));
        dfg.insert(DFGNode::new(DFGNodeKind::Output { sink: 0 }, vec![reduce], ROOT_SCOPE));
        dfg
    }

    #[test]
    fn single_shard_step_test() {
        let dfg = sum_graph();
        let mut worker =
            Worker::new(&dfg, 1, None, Exchanger::local(), 10, &discard_logger()).unwrap();
        let row = Row::from_values(values![1, 5]);
        let output = worker
            .step(StepCommand {
                time: Timestamp(1),
                frontier: Frontier::at(Timestamp(2)),
                inputs: vec![vec![Change::insert(row, 1)]],
            })
            .unwrap();
        assert_eq!(output.sinks.len(), 1);
        assert_eq!(output.sinks[0].len(), 1);
        assert_eq!(output.sinks[0][0].row.values(), values![5].as_slice());
        assert!(output.errors.is_empty());
    }

    #[test]
    fn unclaimed_state_test() {
        let dfg = sum_graph();
        let mut worker =
            Worker::new(&dfg, 1, None, Exchanger::local(), 10, &discard_logger()).unwrap();
        let row = Row::from_values(values![1, 5]);
        worker
            .step(StepCommand {
                time: Timestamp(1),
                frontier: Frontier::at(Timestamp(2)),
                inputs: vec![vec![Change::insert(row, 1)]],
            })
            .unwrap();
        let snapshot = worker.state.snapshot().unwrap();

        // a graph without the reduce cannot take over its state
        let mut other = DFG::new();
        let input = other.insert(DFGNode::new(DFGNodeKind::Input { source: 0 }, vec![], ROOT_SCOPE));
        other.insert(DFGNode::new(DFGNodeKind::Output { sink: 0 }, vec![input], ROOT_SCOPE));
        let err = Worker::new(&other, 1, Some(snapshot), Exchanger::local(), 10, &discard_logger())
            .err()
            .unwrap();
        assert!(matches!(err, Error::CheckpointMismatch { .. }));
    }
}
