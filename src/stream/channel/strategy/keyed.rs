// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::data::{Key, Row};

/// Selects the partitioning key of a row.
///
/// Data is split onto a contiguous key space containing one key range per shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyBy {
    /// Hash of a projection of the row
    Columns(Vec<usize>),
    /// Hash of every value of the row, ignoring the key it carries
    Values,
}

impl KeyBy {
    #[inline]
    pub fn key(&self, row: &Row) -> Key {
        match self {
            // rows missing a column fail in the operator, any shard will do
            KeyBy::Columns(columns) => row
                .project(columns)
                .map(|values| Key::for_values(&values))
                .unwrap_or_else(|_| Key::for_values(row.values())),
            KeyBy::Values => Key::for_values(row.values()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::partition::PartitionGroup, values};

    #[test]
    fn keyby_spread_test() {
        let partitions = PartitionGroup::new(4);
        let mut hits = vec![0usize; 4];
        for i in 0..1000i64 {
            let row = Row::from_values(values![i]);
            hits[partitions.shard_of(KeyBy::Values.key(&row))] += 1;
        }
        assert!(hits.iter().all(|h| *h > 150), "{:?}", hits);
    }

    #[test]
    fn missing_column_test() {
        let row = Row::from_values(values![1]);
        assert_eq!(KeyBy::Columns(vec![3]).key(&row), KeyBy::Values.key(&row));
    }

    #[test]
    fn values_ignore_key_test() {
        let row = Row::from_values(values![1, 2]);
        let rekeyed = Row::new(Key(42), values![1, 2]);
        assert_eq!(KeyBy::Values.key(&row), KeyBy::Values.key(&rekeyed));
    }
}
