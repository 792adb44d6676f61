// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::index::Index;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, ops::RangeBounds};

/// An index that keeps its keys sorted, used where state is consumed in key order
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(bound(
    serialize = "K: Serialize + Ord, V: Serialize",
    deserialize = "K: DeserializeOwned + Ord, V: DeserializeOwned"
))]
pub struct OrderedIndex<K, V> {
    map: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for OrderedIndex<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> OrderedIndex<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }
    pub fn rmw<F, I>(&mut self, key: K, init: I, f: F) -> &mut V
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V),
    {
        let v = self.map.entry(key).or_insert_with(init);
        f(v);
        v
    }
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl Iterator<Item = (&K, &V)> {
        self.map.range(range)
    }
    pub fn first(&self) -> Option<(&K, &V)> {
        self.map.iter().next()
    }

    /// Removes and returns, in key order, every entry whose key is below `bound`
    pub fn drain_below(&mut self, bound: &K) -> Vec<(K, V)> {
        let upper = self.map.split_off(bound);
        let lower = std::mem::replace(&mut self.map, upper);
        lower.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> Index for OrderedIndex<K, V>
where
    K: Serialize + DeserializeOwned + Ord + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    const KIND: &'static str = "ordered_index";

    fn entries(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_below_test() {
        let mut index: OrderedIndex<(u64, u64), &'static str> = OrderedIndex::new();
        index.put((10, 1), "a");
        index.put((20, 0), "b");
        index.put((5, 9), "c");
        index.put((30, 0), "d");

        let drained = index.drain_below(&(20, 0));
        assert_eq!(drained, vec![((5, 9), "c"), ((10, 1), "a")]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.first(), Some((&(20, 0), &"b")));
        assert!(index.drain_below(&(0, 0)).is_empty());
    }
}
