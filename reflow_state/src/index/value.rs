// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::index::Index;
use fxhash::FxHashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::hash::Hash;

/// A hash index suitable for point lookups and in-place updates
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(bound(
    serialize = "K: Serialize + Hash + Eq, V: Serialize",
    deserialize = "K: DeserializeOwned + Hash + Eq, V: DeserializeOwned"
))]
pub struct ValueIndex<K, V> {
    map: FxHashMap<K, V>,
}

impl<K: Hash + Eq, V> Default for ValueIndex<K, V> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }
}

impl<K: Hash + Eq, V> ValueIndex<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }
    #[inline]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }
    #[inline]
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }
    #[inline]
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }
    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }
    /// Read-modify-write on the value under `key`, initialising it with `init` if absent
    #[inline]
    pub fn rmw<F, I>(&mut self, key: K, init: I, f: F) -> &mut V
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V),
    {
        let v = self.map.entry(key).or_insert_with(init);
        f(v);
        v
    }
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> Index for ValueIndex<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    const KIND: &'static str = "value_index";

    fn entries(&self) -> usize {
        self.map.len()
    }
}

/// A single optional value, e.g., an operator watermark
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ValueState<V> {
    value: Option<V>,
}

impl<V> Default for ValueState<V> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<V> ValueState<V> {
    #[inline]
    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }
    #[inline]
    pub fn put(&mut self, value: V) -> Option<V> {
        self.value.replace(value)
    }
    #[inline]
    pub fn take(&mut self) -> Option<V> {
        self.value.take()
    }
}

impl<V> Index for ValueState<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    const KIND: &'static str = "value";

    fn entries(&self) -> usize {
        self.value.is_some() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_index_rmw_test() {
        let mut index: ValueIndex<u64, u64> = ValueIndex::new();
        index.rmw(1, || 10, |v| *v += 1);
        index.rmw(1, || 10, |v| *v += 1);
        assert_eq!(index.get(&1), Some(&12));
        assert_eq!(index.remove(&1), Some(12));
        assert!(index.is_empty());
    }

    #[test]
    fn value_state_test() {
        let mut state: ValueState<i64> = ValueState::default();
        assert_eq!(state.get(), None);
        state.put(100);
        assert_eq!(state.put(200), Some(100));
        assert_eq!(state.take(), Some(200));
        assert_eq!(state.entries(), 0);
    }
}
