// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

pub mod multiset;
pub mod ordered;
pub mod value;

pub use self::{
    multiset::KeyedMultiset,
    ordered::OrderedIndex,
    value::{ValueIndex, ValueState},
};

use serde::{de::DeserializeOwned, Serialize};

/// Common Index Operations
///
/// All indexes kept in a [StateStore](crate::StateStore) must implement this trait.
/// Indexes are plain in-memory structures and are persisted by serialising them
/// as a whole when a snapshot is taken.
pub trait Index: Serialize + DeserializeOwned + Default + Send + 'static {
    /// Name of the index kind, used to validate restored state
    const KIND: &'static str;

    /// Number of live entries held by the index
    fn entries(&self) -> usize;
}
