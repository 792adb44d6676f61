// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    conf::{logger::ReflowLogger, ReflowConf},
    data::{consolidate, partition::PartitionGroup, Change, Timestamp},
    dataflow::dfg::DFGNodeID,
    error::{Error, ReflowResult},
    manager::{progress::ProgressTracker, snapshot::SnapshotManager, source::SourceManager},
    persistence::CheckpointBody,
    reportable_error,
    stream::{
        channel::strategy::KeyBy,
        node::{StepCommand, Worker, WorkerCommand, WorkerReport},
        sink::SinkDriver,
        time::Frontier,
    },
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// What the coordinator of a pipeline is busy with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not running
    Idle,
    /// Polling sources
    Ingesting,
    /// Shards are running a step
    Propagating,
    /// Advancing the closed frontier and taking checkpoints
    Closing,
}

/// Outcome of a call to [AssembledPipeline::run] or [AssembledPipeline::run_until]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Every time below this frontier is closed
    pub closed: Frontier,
    /// Steps executed during the run
    pub steps: u64,
    /// Checkpoints published during the run
    pub checkpoints: u64,
    /// Changes polled from sources during the run
    pub polled: u64,
}

/// A pipeline whose workers are set up and ready to run.
///
/// The coordinator drives the shards in lock step. It polls the sources,
/// runs one step per closed timestamp on every shard, hands the output to the
/// sinks and advances the closed frontier.
pub struct AssembledPipeline {
    conf: ReflowConf,
    /// Idle workers, they run on their own threads during a run
    workers: Vec<Worker>,
    abort: Arc<AtomicBool>,
    sources: SourceManager,
    progress: ProgressTracker,
    snapshots: Option<SnapshotManager>,
    sinks: SinkDriver,
    sink_count: usize,
    error_sink: Option<usize>,
    late_sink: Option<usize>,
    has_windows: bool,
    state: SchedulerState,
    /// Frontier handed to the shards with the last step
    window_frontier: Frontier,
    /// Closed frontier of the newest checkpoint
    checkpointed: Option<Frontier>,
    steps: u64,
    checkpoints: u64,
    poisoned: Option<String>,
    partitions: PartitionGroup,
    logger: ReflowLogger,
}

impl AssembledPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conf: ReflowConf,
        has_windows: bool,
        workers: Vec<Worker>,
        abort: Arc<AtomicBool>,
        sources: SourceManager,
        progress: ProgressTracker,
        snapshots: Option<SnapshotManager>,
        sinks: SinkDriver,
        sink_count: usize,
        error_sink: Option<usize>,
        late_sink: Option<usize>,
        logger: ReflowLogger,
    ) -> Self {
        let closed = progress.closed();
        let partitions = PartitionGroup::new(workers.len().max(1));
        AssembledPipeline {
            conf,
            workers,
            abort,
            sources,
            progress,
            snapshots,
            sinks,
            sink_count,
            error_sink,
            late_sink,
            has_windows,
            state: SchedulerState::Idle,
            window_frontier: closed,
            checkpointed: None,
            steps: 0,
            checkpoints: 0,
            poisoned: None,
            partitions,
            logger,
        }
    }

    /// Runs until every source is closed and all of its changes are processed
    pub fn run(&mut self) -> ReflowResult<RunSummary> {
        self.execute(None)
    }

    /// Runs until every time up to and including `time` is closed.
    ///
    /// A later call continues where this one stopped.
    pub fn run_until(&mut self, time: Timestamp) -> ReflowResult<RunSummary> {
        self.execute(Some(time))
    }

    /// Every time below this frontier has been delivered to the sinks
    pub fn closed(&self) -> Frontier {
        self.progress.closed()
    }

    /// Frontier of a node of the dataflow graph
    pub fn node_frontier(&self, node: DFGNodeID) -> Option<Frontier> {
        self.progress.node_frontier(node.index())
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Total number of state entries over all shards
    pub fn state_entries(&self) -> usize {
        self.workers.iter().map(Worker::state_entries).sum()
    }

    /// State entries over all shards, by operator state (`n2/groups`)
    pub fn state_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for worker in &self.workers {
            for (id, entries) in worker.state_summary() {
                *summary.entry(id.to_string()).or_insert(0) += entries;
            }
        }
        summary
    }

    fn execute(&mut self, until: Option<Timestamp>) -> ReflowResult<RunSummary> {
        if let Some(reason) = &self.poisoned {
            return Err(Error::Aborted {
                msg: format!("pipeline failed earlier: {}", reason),
            });
        }
        let mut workers = std::mem::take(&mut self.workers);
        let shards = workers.len();
        let (report_tx, report_rx) = bounded::<WorkerReport>(shards * 2);

        let outcome = crossbeam_utils::thread::scope(|scope| {
            let mut commands: Vec<Sender<WorkerCommand>> = Vec::with_capacity(shards);
            let mut handles = Vec::with_capacity(shards);
            let mut spawned = Ok(());
            for worker in workers.drain(..) {
                let (command_tx, command_rx) = bounded::<WorkerCommand>(1);
                let reports = report_tx.clone();
                let spawn = scope
                    .builder()
                    .name(format!("reflow-worker-{}", worker.shard()))
                    .spawn(move |_| worker.run(command_rx, reports));
                match spawn {
                    Ok(handle) => {
                        commands.push(command_tx);
                        handles.push(handle);
                    }
                    Err(error) => {
                        spawned = Err(Error::from(error));
                        break;
                    }
                }
            }
            drop(report_tx);

            let result = spawned.and_then(|_| self.coordinate(until, &commands, &report_rx));
            if result.is_err() {
                self.abort.store(true, Ordering::SeqCst);
            }
            for command_tx in &commands {
                let _ = command_tx.send(WorkerCommand::Shutdown);
            }
            drop(commands);
            let returned: Vec<Worker> = handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .collect();
            (result, returned)
        });

        let (result, returned) = match outcome {
            Ok(outcome) => outcome,
            Err(_) => (reportable_error!("worker scope panicked"), Vec::new()),
        };
        let complete = returned.len() == shards;
        self.workers = returned;
        self.state = SchedulerState::Idle;

        match result {
            Ok(summary) if complete => Ok(summary),
            Ok(_) => {
                self.poisoned = Some("a worker was lost".to_string());
                reportable_error!("{} of {} workers returned", self.workers.len(), shards)
            }
            Err(error) => {
                slog::error!(self.logger, "Run failed"; "error" => %error);
                self.poisoned = Some(error.to_string());
                Err(error)
            }
        }
    }

    fn coordinate(
        &mut self,
        until: Option<Timestamp>,
        commands: &[Sender<WorkerCommand>],
        reports: &Receiver<WorkerReport>,
    ) -> ReflowResult<RunSummary> {
        let limit = match until {
            Some(time) => Frontier::at(time.succ()),
            None => Frontier::closed(),
        };
        let steps = self.steps;
        let checkpoints = self.checkpoints;
        let polled = self.sources.polled();
        slog::info!(self.logger, "Run started"; "until" => %limit, "closed" => %self.progress.closed());

        loop {
            self.sinks.check()?;
            self.state = SchedulerState::Ingesting;
            let fresh = self.sources.poll()?;
            if let Some(snapshots) = self.snapshots.as_mut() {
                snapshots.note_changes(fresh);
            }
            let mut progressed = fresh > 0;
            let target = self.sources.frontier().meet(limit);

            while let Some(time) = self.sources.next_pending() {
                if !target.passed(time) {
                    break;
                }
                let inputs = self.sources.take(time)?;
                let frontier = match self.sources.next_pending() {
                    Some(next) => target.meet(Frontier::at(next)),
                    None => target,
                };
                self.step(time, frontier, inputs, commands, reports)?;
                progressed = true;
            }

            // windows close on frontier progress alone
            if self.has_windows && target > self.window_frontier {
                let time = match (target.time(), self.window_frontier.time()) {
                    (Some(end), _) => Some(Timestamp(end.0.saturating_sub(1))),
                    (None, Some(start)) => Some(start),
                    (None, None) => None,
                };
                if let Some(time) = time {
                    let inputs = vec![Vec::new(); self.sources.len()];
                    self.step(time, target, inputs, commands, reports)?;
                    progressed = true;
                }
            }

            self.state = SchedulerState::Closing;
            let before = self.progress.closed();
            let closed = self.progress.advance(&self.sources.frontiers(), limit)?;
            if closed > before {
                self.sinks.advance(closed)?;
                progressed = true;
            }
            if self.snapshots.as_ref().map_or(false, SnapshotManager::due) {
                self.checkpoint(commands, reports)?;
            }

            let reached = until.map_or(false, |time| closed.passed(time));
            if reached || (self.sources.is_exhausted() && closed.is_closed()) {
                if self.checkpointed != Some(closed) {
                    self.checkpoint(commands, reports)?;
                }
                break;
            }

            if !progressed {
                let mut pause = self.conf.poll_interval();
                if let Some(at) = self.sources.next_retry() {
                    pause = pause.min(at.saturating_duration_since(Instant::now()));
                }
                std::thread::sleep(pause);
            }
        }

        self.sinks.flush()?;
        let summary = RunSummary {
            closed: self.progress.closed(),
            steps: self.steps - steps,
            checkpoints: self.checkpoints - checkpoints,
            polled: self.sources.polled() - polled,
        };
        slog::info!(
            self.logger,
            "Run finished";
            "closed" => %summary.closed,
            "steps" => summary.steps,
            "checkpoints" => summary.checkpoints
        );
        Ok(summary)
    }

    /// Runs the graph for `time` on every shard and delivers the output
    fn step(
        &mut self,
        time: Timestamp,
        frontier: Frontier,
        inputs: Vec<Vec<Change>>,
        commands: &[Sender<WorkerCommand>],
        reports: &Receiver<WorkerReport>,
    ) -> ReflowResult<()> {
        self.state = SchedulerState::Propagating;
        let shards = commands.len();
        let mut partitioned: Vec<Vec<Vec<Change>>> = vec![vec![Vec::new(); inputs.len()]; shards];
        for (source, batch) in inputs.into_iter().enumerate() {
            for change in batch {
                let shard = self.partitions.shard_of(KeyBy::Values.key(&change.row));
                if let Some(batches) = partitioned.get_mut(shard) {
                    batches[source].push(change);
                }
            }
        }
        for (command_tx, inputs) in commands.iter().zip(partitioned) {
            let command = WorkerCommand::Step(StepCommand {
                time,
                frontier,
                inputs,
            });
            command_tx.send(command).map_err(|_| Error::Aborted {
                msg: "worker stopped before its step".to_string(),
            })?;
        }

        let mut batches: Vec<Vec<Change>> = vec![Vec::new(); self.sink_count];
        let mut errors = Vec::new();
        let mut late = Vec::new();
        for report in self.await_reports(reports, shards)? {
            match report {
                WorkerReport::Stepped { output, .. } => {
                    if batches.len() < output.sinks.len() {
                        batches.resize(output.sinks.len(), Vec::new());
                    }
                    for (batch, changes) in batches.iter_mut().zip(output.sinks) {
                        batch.extend(changes);
                    }
                    errors.extend(output.errors);
                    late.extend(output.late);
                }
                _ => return reportable_error!("unexpected report during step {}", time),
            }
        }
        route(&mut batches, self.error_sink, errors, &self.logger, "evaluation errors");
        route(&mut batches, self.late_sink, late, &self.logger, "late changes");
        for batch in batches.iter_mut() {
            consolidate(batch);
        }
        self.sinks.deliver(time, batches)?;

        self.window_frontier = self.window_frontier.max(frontier);
        self.steps += 1;
        Ok(())
    }

    /// Publishes the state of every shard together with the source positions
    fn checkpoint(
        &mut self,
        commands: &[Sender<WorkerCommand>],
        reports: &Receiver<WorkerReport>,
    ) -> ReflowResult<()> {
        if self.snapshots.is_none() {
            return Ok(());
        }
        self.state = SchedulerState::Closing;
        self.sinks.flush()?;
        for command_tx in commands {
            command_tx
                .send(WorkerCommand::Snapshot)
                .map_err(|_| Error::Aborted {
                    msg: "worker stopped before its snapshot".to_string(),
                })?;
        }
        let mut shards = Vec::with_capacity(commands.len());
        for report in self.await_reports(reports, commands.len())? {
            match report {
                WorkerReport::Snapshotted { snapshot, .. } => shards.push(snapshot),
                _ => return reportable_error!("unexpected report during checkpoint"),
            }
        }
        let mut body = CheckpointBody {
            closed: self.progress.closed(),
            shards,
            ..Default::default()
        };
        self.sources.checkpoint(&mut body);
        if let Some(snapshots) = self.snapshots.as_mut() {
            snapshots.publish(&body)?;
        }
        self.checkpointed = Some(body.closed);
        self.checkpoints += 1;
        Ok(())
    }

    /// Waits for one report per shard and returns them in shard order.
    ///
    /// A failed shard makes the others abort, the first failure that is not
    /// an abort is returned.
    fn await_reports(
        &self,
        reports: &Receiver<WorkerReport>,
        shards: usize,
    ) -> ReflowResult<Vec<WorkerReport>> {
        let mut received: Vec<Option<WorkerReport>> = (0..shards).map(|_| None).collect();
        let mut failure: Option<Error> = None;
        let mut missing = shards;
        let started = Instant::now();
        while missing > 0 {
            let report = match reports.recv_timeout(self.conf.barrier_report_interval()) {
                Ok(report) => report,
                Err(RecvTimeoutError::Timeout) => {
                    slog::warn!(
                        self.logger,
                        "Waiting for shards";
                        "missing" => missing,
                        "elapsed_ms" => started.elapsed().as_millis() as u64
                    );
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(failure.unwrap_or_else(|| Error::Aborted {
                        msg: "every worker stopped".to_string(),
                    }));
                }
            };
            let shard = match &report {
                WorkerReport::Stepped { shard, .. }
                | WorkerReport::Snapshotted { shard, .. }
                | WorkerReport::Failed { shard, .. } => *shard,
            };
            let slot = match received.get_mut(shard) {
                Some(slot) if slot.is_none() => slot,
                _ => return reportable_error!("unexpected report of shard {}", shard),
            };
            missing -= 1;
            match report {
                WorkerReport::Failed { error, .. } => {
                    let replace = match &failure {
                        None => true,
                        Some(current) => current.is_abort() && !error.is_abort(),
                    };
                    if replace {
                        failure = Some(error);
                    }
                }
                report => *slot = Some(report),
            }
        }
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(received.into_iter().flatten().collect())
    }
}

fn route(
    batches: &mut Vec<Vec<Change>>,
    sink: Option<usize>,
    changes: Vec<Change>,
    logger: &ReflowLogger,
    what: &str,
) {
    if changes.is_empty() {
        return;
    }
    match sink.and_then(|index| batches.get_mut(index)) {
        Some(batch) => batch.extend(changes),
        None => slog::debug!(logger, "Dropping output without a sink"; "kind" => what, "count" => changes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Row, Value},
        persistence::{CheckpointStorage, MemoryStorage},
        pipeline::Pipeline,
        stream::{operator::reduce::Reducer, sink::MemorySink},
        values,
    };

    fn conf(workers: usize) -> ReflowConf {
        ReflowConf {
            workers,
            poll_interval: 1,
            ..Default::default()
        }
    }

    fn row(values: Vec<Value>) -> Row {
        Row::from_values(values)
    }

    #[test]
    fn run_until_test() {
        let mut pipeline = Pipeline::with_conf(conf(2)).with_logger(ReflowConf::quiet_logger());
        let changes = vec![
            Change::insert(row(values!["a", 1]), 1),
            Change::insert(row(values!["a", 2]), 2),
            Change::insert(row(values!["b", 5]), 3),
        ];
        let (sink, reader) = MemorySink::new("sums");
        pipeline
            .collection("numbers", changes)
            .reduce(vec![0], vec![Reducer::Sum(1)])
            .sink(sink);
        let mut assembled = pipeline.build().unwrap();

        let summary = assembled.run_until(Timestamp(2)).unwrap();
        assert_eq!(summary.closed, Frontier::at(Timestamp(3)));
        assert_eq!(assembled.state(), SchedulerState::Idle);
        assert_eq!(reader.values(), vec![(values!["a", 3], 1)]);

        let summary = assembled.run().unwrap();
        assert!(summary.closed.is_closed());
        assert_eq!(
            reader.values(),
            vec![(values!["a", 3], 1), (values!["b", 5], 1)]
        );
        assert_eq!(assembled.workers(), 2);
    }

    #[test]
    fn checkpoint_on_finish_test() {
        let storage = MemoryStorage::new();
        let mut pipeline = Pipeline::with_conf(conf(1))
            .with_storage(storage.clone())
            .with_logger(ReflowConf::quiet_logger());
        let (sink, _) = MemorySink::new("out");
        pipeline
            .collection("numbers", vec![Change::insert(row(values![1]), 1)])
            .distinct()
            .sink(sink);
        let mut assembled = pipeline.build().unwrap();
        let summary = assembled.run().unwrap();
        assert_eq!(summary.checkpoints, 1);
        assert_eq!(storage.list().unwrap().len(), 1);
    }
}
