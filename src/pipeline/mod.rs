// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    conf::{logger::ReflowLogger, PersistenceMode, ReflowConf},
    data::Change,
    dataflow::stream::Context,
    error::{Error, ReflowResult},
    manager::{
        progress::ProgressTracker,
        snapshot::{SnapshotManager, SnapshotPolicy},
        source::{RetryPolicy, SourceManager},
    },
    persistence::{CheckpointStorage, FileStorage, MemoryStorage},
    stream::{
        channel::{ExchangeTiming, Exchanger},
        node::Worker,
        sink::{Sink, SinkDriver},
        source::{ChannelSource, CollectionSource, InputHandle, Source},
    },
};
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

mod assembled;

pub use crate::dataflow::stream::{IterationScope, Stream};
pub use assembled::{AssembledPipeline, RunSummary, SchedulerState};

/// A Pipeline is the starting point of all reflow applications.
///
/// Sources are added to it, the returned [Stream]s are transformed and
/// attached to sinks, and [Pipeline::build] then assembles the workers.
///
/// # Creating a Pipeline
///
/// See [Configuration](ReflowConf)
///
/// With the default configuration
/// ```
/// use reflow::prelude::Pipeline;
///
/// let pipeline = Pipeline::default();
/// ```
///
/// With configuration
/// ```
/// use reflow::prelude::{Pipeline, ReflowConf};
///
/// let conf = ReflowConf {
///     workers: 2,
///     ..Default::default()
/// };
/// let pipeline = Pipeline::with_conf(conf);
/// ```
pub struct Pipeline {
    /// reflow configuration for this pipeline
    conf: ReflowConf,
    ctx: Rc<RefCell<Context>>,
    /// Overrides the storage chosen by `conf.persistence`
    storage: Option<Box<dyn CheckpointStorage>>,
    logger: Option<ReflowLogger>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::with_conf(ReflowConf::default())
    }
}

impl Pipeline {
    /// Creates a new Pipeline using the given ReflowConf
    pub fn with_conf(conf: ReflowConf) -> Self {
        Pipeline {
            conf,
            ctx: Rc::new(RefCell::new(Context::default())),
            storage: None,
            logger: None,
        }
    }

    /// Publishes checkpoints to `storage`, whatever `persistence` is set to
    pub fn with_storage(mut self, storage: impl CheckpointStorage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }

    /// Logs to `logger` instead of the one described by the configuration
    pub fn with_logger(mut self, logger: ReflowLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn conf(&self) -> &ReflowConf {
        &self.conf
    }

    /// Adds a source and returns the stream of its changes
    pub fn source(&mut self, source: impl Source) -> Stream {
        let id = self.ctx.borrow_mut().add_source(Box::new(source));
        Stream::new(id, crate::dataflow::dfg::ROOT_SCOPE, self.ctx.clone())
    }

    /// Creates a bounded source from a vector of changes
    pub fn collection(&mut self, name: impl Into<String>, changes: Vec<Change>) -> Stream {
        self.source(CollectionSource::new(name, changes))
    }

    /// Creates a live source fed through the returned [InputHandle]
    pub fn input(&mut self, name: impl Into<String>) -> (Stream, InputHandle) {
        let (source, handle) = ChannelSource::new(name);
        (self.source(source), handle)
    }

    /// Receives the rows that user logic failed on.
    ///
    /// Rows are `[operator, message, (values...)]` and keep the multiplicity
    /// of the failing change.
    pub fn error_sink(&mut self, sink: impl Sink) {
        let mut ctx = self.ctx.borrow_mut();
        let index = ctx.add_sink(Box::new(sink));
        ctx.error_sink = Some(index);
    }

    /// Receives changes that arrived after their window was closed
    pub fn late_sink(&mut self, sink: impl Sink) {
        let mut ctx = self.ctx.borrow_mut();
        let index = ctx.add_sink(Box::new(sink));
        ctx.late_sink = Some(index);
    }

    /// Validates the dataflow graph, recovers from the newest valid
    /// checkpoint and sets up the workers.
    pub fn build(self) -> ReflowResult<AssembledPipeline> {
        let conf = self.conf;
        conf.validate()?;
        let logger = match self.logger {
            Some(logger) => logger,
            None => conf.logger()?,
        };
        let ctx = std::mem::take(&mut *self.ctx.borrow_mut());

        if !ctx.errors.is_empty() {
            return Err(Error::Config {
                msg: ctx.errors.join("; "),
            });
        }
        if ctx.sources.is_empty() {
            return Err(Error::Config {
                msg: "pipeline has no sources".to_string(),
            });
        }
        ctx.dfg
            .validate()
            .map_err(|msg| Error::Config { msg })?;

        let storage: Option<Box<dyn CheckpointStorage>> = match (self.storage, conf.persistence) {
            (Some(storage), _) => Some(storage),
            (None, PersistenceMode::None) => None,
            (None, PersistenceMode::Memory) => Some(Box::new(MemoryStorage::new())),
            (None, PersistenceMode::File) => Some(Box::new(FileStorage::new(&conf.checkpoint_dir)?)),
        };
        let policy = SnapshotPolicy {
            interval: match conf.checkpoint_interval {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            change_threshold: conf.checkpoint_change_threshold,
            retained: conf.checkpoints_retained,
        };
        let fingerprint = ctx.dfg.fingerprint();
        let mut snapshots = storage
            .map(|storage| SnapshotManager::new(storage, policy, fingerprint, conf.workers, &logger));
        let recovered = match snapshots.as_mut() {
            Some(snapshots) => snapshots.recover()?,
            None => None,
        };

        let mut sources = SourceManager::new(ctx.sources, RetryPolicy::from_conf(&conf), &logger);
        let mut progress = ProgressTracker::new(&ctx.dfg);
        let mut shard_states = vec![None; conf.workers];
        if let Some(recovered) = recovered {
            sources.restore(&recovered.body)?;
            progress.restore(recovered.body.closed);
            for (slot, snapshot) in shard_states.iter_mut().zip(recovered.body.shards) {
                *slot = Some(snapshot);
            }
        }

        let abort = Arc::new(AtomicBool::new(false));
        let timing = ExchangeTiming {
            poll: conf.poll_interval().max(Duration::from_millis(1)),
            report: conf.barrier_report_interval(),
        };
        let exchangers = Exchanger::mesh(conf.workers, conf.channel_capacity, abort.clone(), timing, &logger);
        let sink_count = ctx.sinks.len();
        let mut workers = Vec::with_capacity(conf.workers);
        for (exchanger, snapshot) in exchangers.into_iter().zip(shard_states) {
            workers.push(Worker::new(
                &ctx.dfg,
                sink_count,
                snapshot,
                exchanger,
                conf.iteration_limit,
                &logger,
            )?);
        }
        let sinks = SinkDriver::spawn(ctx.sinks, conf.max_in_flight, &logger)?;

        slog::info!(
            logger,
            "Pipeline assembled";
            "nodes" => ctx.dfg.len(),
            "workers" => conf.workers,
            "closed" => %progress.closed()
        );

        Ok(AssembledPipeline::new(
            conf,
            ctx.dfg.has_windows(),
            workers,
            abort,
            sources,
            progress,
            snapshots,
            sinks,
            sink_count,
            ctx.error_sink,
            ctx.late_sink,
            logger,
        ))
    }
}
