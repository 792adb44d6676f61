// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

pub mod keyed;

pub use keyed::KeyBy;

use crate::data::{partition::PartitionGroup, Change};

/// A `ChannelStrategy` defines how changes travel along an edge between shards
///
/// Common strategies include one-to-one [ChannelStrategy::Forward] and
/// hash partitioning with [ChannelStrategy::KeyBy].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelStrategy {
    /// Changes stay on the shard that produced them
    Forward,
    /// Changes move to the shard that owns their partitioning key
    KeyBy(KeyBy),
}

impl ChannelStrategy {
    #[inline]
    pub fn is_forward(&self) -> bool {
        matches!(self, ChannelStrategy::Forward)
    }

    /// Shard that receives `change` when sent from `shard`
    #[inline]
    pub fn target(&self, change: &Change, shard: usize, partitions: &PartitionGroup) -> usize {
        match self {
            ChannelStrategy::Forward => shard,
            ChannelStrategy::KeyBy(key_by) => partitions.shard_of(key_by.key(&change.row)),
        }
    }
}
