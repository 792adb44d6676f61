// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

mod concat;
mod filter;
mod flatmap;
mod map;

pub use concat::{Concat, Negate};
pub use filter::Filter;
pub use flatmap::FlatMap;
pub use map::Map;

use crate::{
    data::{Row, Value},
    error::EvalError,
};
use std::sync::Arc;

/// Bounds for user-defined functions shared by all shards
pub trait ReflowFnBounds: Send + Sync + 'static {}
impl<T> ReflowFnBounds for T where T: Send + Sync + 'static {}

/// Function producing the values of a mapped row
pub type MapFn = Arc<dyn Fn(&Row) -> Result<Vec<Value>, EvalError> + Send + Sync>;
/// Predicate deciding whether a row is kept
pub type FilterFn = Arc<dyn Fn(&Row) -> Result<bool, EvalError> + Send + Sync>;
/// Function producing any number of rows from one row
pub type FlatMapFn = Arc<dyn Fn(&Row) -> Result<Vec<Vec<Value>>, EvalError> + Send + Sync>;
