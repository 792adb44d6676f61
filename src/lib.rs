// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

//! Reflow is an incremental dataflow engine.
//!
//! A dataflow is described once as a graph of relational operators over
//! collections of rows. Inputs change over time as timestamped insertions and
//! retractions, and reflow keeps every derived collection consistent by
//! propagating only the differences. Operators run on a configurable amount
//! of shard workers that partition state by key, and the state of a pipeline
//! can be checkpointed and restored.
//!
//! ```
//! use reflow::prelude::*;
//!
//! let mut pipeline = Pipeline::default();
//! let numbers = pipeline.collection(
//!     "numbers",
//!     vec![Change::insert(Row::from_values(values![1, 5]), 1)],
//! );
//! let (sink, reader) = MemorySink::new("sums");
//! numbers
//!     .reduce(vec![0], vec![Reducer::Sum(1)])
//!     .sink(sink);
//!
//! let mut pipeline = pipeline.build().unwrap();
//! pipeline.run().unwrap();
//! assert_eq!(reader.values(), vec![(values![1, 5], 1)]);
//! ```

// Public Interface

/// Reflow Configuration
pub mod conf;
/// Reflow data types
pub mod data;
/// Description of dataflow graphs
pub mod dataflow;
/// Reflow error types
pub mod error;
/// Checkpoint format and storage
pub mod persistence;
/// Utilities for creating a reflow pipeline
pub mod pipeline;
/// Contains the core stream logic
pub mod stream;

// Internal modules

/// Module containing different runtime managers
mod manager;

/// Helper module that imports everything related to reflow into scope
pub mod prelude {
    pub use crate::{
        conf::{logger::ReflowLogger, PersistenceMode, ReflowConf},
        data::{Change, Diff, Key, Row, Timestamp, Value},
        error::{Error, EvalError, ReflowResult, SinkError, SourceError},
        persistence::{CheckpointStorage, FileStorage, MemoryStorage},
        pipeline::{AssembledPipeline, IterationScope, Pipeline, RunSummary, SchedulerState, Stream},
        stream::{
            operator::{
                join::{JoinKind, JoinSpec},
                reduce::{Combiner, Reducer},
                window::{LatePolicy, WindowAssigner, WindowSpec, WindowTime},
            },
            sink::{LocalFileSink, MemorySink, Sink, SinkReader},
            source::{ChannelSource, CollectionSource, InputHandle, Offset, Source, SourceKind},
            time::Frontier,
        },
        values,
    };
}
