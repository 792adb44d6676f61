// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

//! `reflow_state` contains all state management related functionality for the reflow runtime.
//!
//! Operators keep their state in indexes that live inside a per-shard [StateStore].
//! Every index is registered under a [StateId] and can be snapshotted into an opaque
//! [StateSnapshot] and later restored from one.

/// Error utilities
pub mod error;
/// Index implementations
pub mod index;
/// State registry
pub mod store;

pub use crate::{
    error::{Result, StateError},
    index::{Index, KeyedMultiset, OrderedIndex, ValueIndex, ValueState},
    store::{StateId, StateSnapshot, StateStore},
};

/// Signed multiplicity of a record.
///
/// Positive values are insertions and negative values are retractions.
pub type Diff = i64;
