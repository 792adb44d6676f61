// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{index::Index, Diff};
use fxhash::FxHashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{btree_map, hash_map, BTreeMap},
    hash::Hash,
};

/// A multiset of values grouped by key.
///
/// Each value carries a signed multiplicity. Updates that bring a multiplicity
/// back to zero remove the value, and keys without values are removed as well,
/// so the index never grows with cancelled history.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(bound(
    serialize = "K: Serialize + Hash + Eq, V: Serialize + Ord",
    deserialize = "K: DeserializeOwned + Hash + Eq, V: DeserializeOwned + Ord"
))]
pub struct KeyedMultiset<K, V> {
    map: FxHashMap<K, BTreeMap<V, Diff>>,
    values: usize,
}

impl<K, V> Default for KeyedMultiset<K, V>
where
    K: Hash + Eq,
    V: Ord,
{
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
            values: 0,
        }
    }
}

impl<K, V> KeyedMultiset<K, V>
where
    K: Hash + Eq,
    V: Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `diff` to the multiplicity of `value` under `key`.
    ///
    /// Returns the resulting multiplicity.
    pub fn update(&mut self, key: K, value: V, diff: Diff) -> Diff {
        if diff == 0 {
            return self.multiplicity(&key, &value);
        }
        match self.map.entry(key) {
            hash_map::Entry::Vacant(v) => {
                let mut values = BTreeMap::new();
                values.insert(value, diff);
                v.insert(values);
                self.values += 1;
                diff
            }
            hash_map::Entry::Occupied(mut o) => {
                let values = o.get_mut();
                let updated = match values.entry(value) {
                    btree_map::Entry::Vacant(v) => {
                        v.insert(diff);
                        self.values += 1;
                        diff
                    }
                    btree_map::Entry::Occupied(mut e) => {
                        let m = *e.get() + diff;
                        if m == 0 {
                            e.remove();
                            self.values -= 1;
                        } else {
                            *e.get_mut() = m;
                        }
                        m
                    }
                };
                if values.is_empty() {
                    o.remove();
                }
                updated
            }
        }
    }

    /// Current multiplicity of `value` under `key`
    pub fn multiplicity(&self, key: &K, value: &V) -> Diff {
        self.map
            .get(key)
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }

    /// Values and multiplicities under `key` in ascending value order
    pub fn get(&self, key: &K) -> impl Iterator<Item = (&V, Diff)> {
        self.map
            .get(key)
            .into_iter()
            .flat_map(|values| values.iter().map(|(v, d)| (v, *d)))
    }

    /// Returns true if `key` has any value with a nonzero multiplicity
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Sum of the multiplicities under `key`
    pub fn count(&self, key: &K) -> Diff {
        self.get(key).map(|(_, d)| d).sum()
    }

    pub fn remove_key(&mut self, key: &K) -> Option<BTreeMap<V, Diff>> {
        let removed = self.map.remove(key);
        if let Some(values) = &removed {
            self.values -= values.len();
        }
        removed
    }

    /// Replaces everything under `key` with `values`, dropping zero multiplicities
    pub fn replace(&mut self, key: K, values: BTreeMap<V, Diff>) {
        let values: BTreeMap<V, Diff> = values.into_iter().filter(|(_, d)| *d != 0).collect();
        if let Some(old) = self.map.remove(&key) {
            self.values -= old.len();
        }
        if !values.is_empty() {
            self.values += values.len();
            self.map.insert(key, values);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Number of keys with at least one value
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of (key, value) pairs held
    pub fn values(&self) -> usize {
        self.values
    }
}

impl<K, V> Index for KeyedMultiset<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Send + 'static,
    V: Serialize + DeserializeOwned + Ord + Send + 'static,
{
    const KIND: &'static str = "keyed_multiset";

    fn entries(&self) -> usize {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiset_update_test() {
        let mut set: KeyedMultiset<u64, &'static str> = KeyedMultiset::new();
        assert_eq!(set.update(1, "a", 2), 2);
        assert_eq!(set.update(1, "b", 1), 1);
        assert_eq!(set.update(2, "a", -1), -1);
        assert_eq!(set.count(&1), 3);
        assert_eq!(set.values(), 3);

        let under_one: Vec<_> = set.get(&1).collect();
        assert_eq!(under_one, vec![(&"a", 2), (&"b", 1)]);
    }

    #[test]
    fn multiset_gc_test() {
        let mut set: KeyedMultiset<u64, u64> = KeyedMultiset::new();
        set.update(7, 70, 1);
        set.update(7, 71, 1);
        assert_eq!(set.update(7, 70, -1), 0);
        assert!(set.contains_key(&7));
        assert_eq!(set.update(7, 71, -1), 0);
        assert!(!set.contains_key(&7));
        assert!(set.is_empty());
        assert_eq!(set.values(), 0);
    }

    #[test]
    fn multiset_replace_test() {
        let mut set: KeyedMultiset<u64, u64> = KeyedMultiset::new();
        set.update(1, 10, 1);
        let mut next = BTreeMap::new();
        next.insert(11, 2);
        next.insert(12, 0);
        set.replace(1, next);
        assert_eq!(set.multiplicity(&1, &10), 0);
        assert_eq!(set.multiplicity(&1, &11), 2);
        assert_eq!(set.values(), 1);
        set.replace(1, BTreeMap::new());
        assert!(set.is_empty());
    }
}
