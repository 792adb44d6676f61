// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::{Offset, Source, SourceKind};
use crate::{
    data::{Change, Timestamp},
    error::SourceError,
    stream::time::Frontier,
};
use std::collections::BTreeMap;

/// A bounded source that hands out one timestamp per poll
pub struct CollectionSource {
    name: String,
    kind: SourceKind,
    batches: Vec<(Timestamp, Vec<Change>)>,
    next: usize,
}

impl CollectionSource {
    pub fn new(name: impl Into<String>, changes: Vec<Change>) -> Self {
        let mut grouped: BTreeMap<Timestamp, Vec<Change>> = BTreeMap::new();
        for change in changes {
            grouped.entry(change.time).or_default().push(change);
        }
        CollectionSource {
            name: name.into(),
            kind: SourceKind::Retractable,
            batches: grouped.into_iter().collect(),
            next: 0,
        }
    }

    /// Declares that the collection only inserts
    pub fn append_only(mut self) -> Self {
        self.kind = SourceKind::AppendOnly;
        self
    }

    /// Amount of batches that were not polled yet
    pub fn remaining(&self) -> usize {
        self.batches.len().saturating_sub(self.next)
    }
}

impl Source for CollectionSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn poll(&mut self) -> Result<Vec<Change>, SourceError> {
        match self.batches.get(self.next) {
            Some((_, batch)) => {
                self.next += 1;
                Ok(batch.clone())
            }
            None => Ok(Vec::new()),
        }
    }

    fn frontier(&self) -> Frontier {
        match self.batches.get(self.next) {
            Some((time, _)) => Frontier::at(*time),
            None => Frontier::closed(),
        }
    }

    fn position(&self) -> Offset {
        Offset::from_index(self.next as u64)
    }

    fn seek(&mut self, offset: &Offset) -> Result<(), SourceError> {
        let index = offset.index()? as usize;
        if index > self.batches.len() {
            return Err(SourceError::Seek {
                msg: format!(
                    "{} has {} batches, cannot resume at {}",
                    self.name,
                    self.batches.len(),
                    index
                ),
            });
        }
        self.next = index;
        Ok(())
    }
}
