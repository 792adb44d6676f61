// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::Key;

/// Holds information about how the key space is partitioned.
///
/// One shard per KeyRange. The 64-bit key space is split into contiguous
/// ranges of (almost) equal size.
///
/// Example with 2 shards: ((0, KeyRange(0, 2^63 - 1)), (1, KeyRange(2^63, 2^64 - 1)))
#[derive(Debug, Clone)]
pub struct PartitionGroup {
    ranges: Vec<KeyRange>,
}

impl PartitionGroup {
    pub fn new(shards: usize) -> Self {
        assert!(shards > 0, "a partition group needs at least one shard");
        let n = shards as u128;
        let start = |i: u128| -> u128 { ((i << 64) + n - 1) / n };
        let ranges = (0..n)
            .map(|i| KeyRange::new(start(i) as u64, (start(i + 1) - 1) as u64))
            .collect();
        Self { ranges }
    }

    /// Shard that owns `key`
    #[inline]
    pub fn shard_of(&self, key: Key) -> usize {
        ((key.0 as u128 * self.ranges.len() as u128) >> 64) as usize
    }

    #[inline]
    pub fn range(&self, shard: usize) -> Option<&KeyRange> {
        self.ranges.get(shard)
    }

    #[inline]
    pub fn shards(&self) -> usize {
        self.ranges.len()
    }
}

/// A Key Range with an inclusive start and end position
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KeyRange {
    /// Start of the Key Range
    pub start: u64,
    /// End of the Key Range
    pub end: u64,
}

impl KeyRange {
    /// Creates a new KeyRange
    pub fn new(start: u64, end: u64) -> KeyRange {
        assert!(start <= end, "start range has to be smaller than end range");
        KeyRange { start, end }
    }

    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.start <= key.0 && key.0 <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_cover_test() {
        for shards in 1..9 {
            let group = PartitionGroup::new(shards);
            assert_eq!(group.range(0).unwrap().start, 0);
            assert_eq!(group.range(shards - 1).unwrap().end, u64::MAX);
            for i in 1..shards {
                let prev = group.range(i - 1).unwrap();
                let next = group.range(i).unwrap();
                assert_eq!(prev.end + 1, next.start);
            }
        }
    }

    #[test]
    fn shard_of_matches_range_test() {
        let group = PartitionGroup::new(3);
        for k in [0, 1, u64::MAX / 3, u64::MAX / 3 + 1, u64::MAX / 2, u64::MAX].iter() {
            let key = Key(*k);
            let shard = group.shard_of(key);
            assert!(group.range(shard).unwrap().contains(key), "key {}", k);
        }
    }
}
