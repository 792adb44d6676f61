// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{error::*, index::Index};
use serde::{Deserialize, Serialize};
use std::{any::Any, collections::BTreeMap, fmt};

/// Identifier of a registered piece of state.
///
/// The operator part is the path of the owning operator in the dataflow graph,
/// which stays stable across restarts of the same graph.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    operator: String,
    name: String,
}

impl StateId {
    pub fn new(operator: impl Into<String>, name: impl Into<String>) -> Self {
        StateId {
            operator: operator.into(),
            name: name.into(),
        }
    }
    pub fn operator(&self) -> &str {
        &self.operator
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operator, self.name)
    }
}

trait Slot: Send {
    fn kind(&self) -> &'static str;
    fn entries(&self) -> usize;
    fn serialise(&self) -> bincode::Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct IndexSlot<I: Index>(I);

impl<I: Index> Slot for IndexSlot<I> {
    fn kind(&self) -> &'static str {
        I::KIND
    }
    fn entries(&self) -> usize {
        self.0.entries()
    }
    fn serialise(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(&self.0)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct SnapshotEntry {
    kind: String,
    bytes: Vec<u8>,
}

/// Serialised contents of a [StateStore]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StateSnapshot {
    entries: BTreeMap<StateId, SnapshotEntry>,
}

impl StateSnapshot {
    pub fn ids(&self) -> impl Iterator<Item = &StateId> {
        self.entries.keys()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Total size of the serialised indexes in bytes
    pub fn bytes(&self) -> usize {
        self.entries.values().map(|e| e.bytes.len()).sum()
    }
}

/// Registry of all state kept by the operators of one shard.
///
/// Indexes are registered once under a [StateId] and then accessed through
/// typed lookups. A store created with [StateStore::restore] hands out the
/// restored contents as each index gets registered again.
#[derive(Default)]
pub struct StateStore {
    slots: BTreeMap<StateId, Box<dyn Slot>>,
    restored: BTreeMap<StateId, SnapshotEntry>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that lazily restores indexes from `snapshot`
    pub fn restore(snapshot: StateSnapshot) -> Self {
        StateStore {
            slots: BTreeMap::new(),
            restored: snapshot.entries,
        }
    }

    /// Registers an index of type `I` under `id`
    pub fn register<I: Index>(&mut self, id: StateId) -> Result<()> {
        ensure!(
            !self.slots.contains_key(&id),
            AlreadyRegistered { id: id.to_string() }
        );

        let index: I = match self.restored.remove(&id) {
            Some(entry) => {
                ensure!(
                    entry.kind == I::KIND,
                    WrongIndexKind {
                        id: id.to_string(),
                        found: entry.kind.clone(),
                        expected: I::KIND,
                    }
                );
                bincode::deserialize(&entry.bytes).context(Deserialise { id: id.to_string() })?
            }
            None => I::default(),
        };

        self.slots.insert(id, Box::new(IndexSlot(index)));
        Ok(())
    }

    pub fn get<I: Index>(&self, id: &StateId) -> Result<&I> {
        let slot = self
            .slots
            .get(id)
            .context(UnknownState { id: id.to_string() })?;
        let kind = slot.kind();
        slot.as_any()
            .downcast_ref::<IndexSlot<I>>()
            .map(|s| &s.0)
            .context(WrongIndexKind {
                id: id.to_string(),
                found: kind,
                expected: I::KIND,
            })
    }

    pub fn get_mut<I: Index>(&mut self, id: &StateId) -> Result<&mut I> {
        let slot = self
            .slots
            .get_mut(id)
            .context(UnknownState { id: id.to_string() })?;
        let kind = slot.kind();
        slot.as_any_mut()
            .downcast_mut::<IndexSlot<I>>()
            .map(|s| &mut s.0)
            .context(WrongIndexKind {
                id: id.to_string(),
                found: kind,
                expected: I::KIND,
            })
    }

    pub fn is_registered(&self, id: &StateId) -> bool {
        self.slots.contains_key(id)
    }

    /// Restored state that no index has been registered for yet
    pub fn unclaimed(&self) -> Vec<StateId> {
        self.restored.keys().cloned().collect()
    }

    /// Total number of live entries across all registered indexes
    pub fn entries(&self) -> usize {
        self.slots.values().map(|s| s.entries()).sum()
    }

    /// Number of live entries of every registered index
    pub fn entries_by_state(&self) -> BTreeMap<StateId, usize> {
        self.slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.entries()))
            .collect()
    }

    /// Serialises every registered index
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        let mut entries = BTreeMap::new();
        for (id, slot) in &self.slots {
            let bytes = slot
                .serialise()
                .context(Serialise { id: id.to_string() })?;
            entries.insert(
                id.clone(),
                SnapshotEntry {
                    kind: slot.kind().to_string(),
                    bytes,
                },
            );
        }
        Ok(StateSnapshot { entries })
    }
}
