// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::Sink;
use crate::{
    data::{consolidate_updates, Change, Diff, Row, Timestamp, Value},
    error::SinkError,
    stream::time::Frontier,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Default)]
struct Delivered {
    batches: Vec<(Timestamp, Vec<Change>)>,
    frontier: Frontier,
}

/// Keeps every delivered batch in memory, readable through a [SinkReader]
pub struct MemorySink {
    name: String,
    delivered: Arc<Mutex<Delivered>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> (MemorySink, SinkReader) {
        let delivered = Arc::new(Mutex::new(Delivered::default()));
        let sink = MemorySink {
            name: name.into(),
            delivered: delivered.clone(),
        };
        (sink, SinkReader { delivered })
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, time: Timestamp, changes: &[Change]) -> Result<(), SinkError> {
        let mut delivered = lock(&self.delivered)?;
        match delivered.batches.last() {
            // redelivery after recovery
            Some((last, _)) if time <= *last => Ok(()),
            _ => {
                delivered.batches.push((time, changes.to_vec()));
                Ok(())
            }
        }
    }

    fn on_frontier(&mut self, frontier: Frontier) -> Result<(), SinkError> {
        let mut delivered = lock(&self.delivered)?;
        delivered.frontier = delivered.frontier.max(frontier);
        Ok(())
    }
}

fn lock(delivered: &Mutex<Delivered>) -> Result<MutexGuard<'_, Delivered>, SinkError> {
    delivered.lock().map_err(|_| SinkError::Rejected {
        msg: "memory sink was poisoned".to_string(),
    })
}

/// Read access to the output of a [MemorySink]
#[derive(Clone)]
pub struct SinkReader {
    delivered: Arc<Mutex<Delivered>>,
}

impl SinkReader {
    fn read<T>(&self, f: impl FnOnce(&Delivered) -> T) -> T {
        match self.delivered.lock() {
            Ok(delivered) => f(&delivered),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Delivered batches in delivery order
    pub fn batches(&self) -> Vec<(Timestamp, Vec<Change>)> {
        self.read(|d| d.batches.clone())
    }

    /// Every delivered change in delivery order
    pub fn changes(&self) -> Vec<Change> {
        self.read(|d| d.batches.iter().flat_map(|(_, b)| b.iter().cloned()).collect())
    }

    /// Net contents of the output up to and including `time`
    pub fn collection_at(&self, time: Timestamp) -> Vec<(Row, Diff)> {
        let mut updates: Vec<(Row, Diff)> = self.read(|d| {
            d.batches
                .iter()
                .filter(|(t, _)| *t <= time)
                .flat_map(|(_, b)| b.iter().map(|c| (c.row.clone(), c.diff)))
                .collect()
        });
        consolidate_updates(&mut updates);
        updates
    }

    /// Net contents of everything delivered so far
    pub fn collection(&self) -> Vec<(Row, Diff)> {
        self.collection_at(Timestamp::MAX)
    }

    /// Net contents by row values, rows with equal values but different
    /// keys are merged
    pub fn values(&self) -> Vec<(Vec<Value>, Diff)> {
        let mut totals: BTreeMap<Vec<Value>, Diff> = BTreeMap::new();
        for (row, diff) in self.collection() {
            *totals.entry(row.values().to_vec()).or_insert(0) += diff;
        }
        totals.into_iter().filter(|(_, diff)| *diff != 0).collect()
    }

    pub fn frontier(&self) -> Frontier {
        self.read(|d| d.frontier)
    }

    /// Timestamp of the latest delivered batch
    pub fn last_time(&self) -> Option<Timestamp> {
        self.read(|d| d.batches.last().map(|(t, _)| *t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    #[test]
    fn memory_sink_test() {
        let (mut sink, reader) = MemorySink::new("out");
        let a = Row::from_values(values![1]);
        let b = Row::from_values(values![2]);
        sink.deliver(Timestamp(1), &[Change::insert(a.clone(), 1)]).unwrap();
        sink.deliver(Timestamp(2), &[Change::retract(a.clone(), 2), Change::insert(b.clone(), 2)])
            .unwrap();
        // a repeated delivery is ignored
        sink.deliver(Timestamp(2), &[Change::insert(a.clone(), 2)]).unwrap();

        assert_eq!(reader.batches().len(), 2);
        assert_eq!(reader.collection_at(Timestamp(1)), vec![(a, 1)]);
        assert_eq!(reader.collection(), vec![(b, 1)]);
        assert_eq!(reader.values(), vec![(values![2], 1)]);
        assert_eq!(reader.last_time(), Some(Timestamp(2)));
    }
}
