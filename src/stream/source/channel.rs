// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::{Offset, Source, SourceKind};
use crate::{
    data::{Change, Diff, Row, Timestamp},
    error::{Error, ReflowResult, SourceError},
    stream::time::Frontier,
};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Max amount of events taken per poll
const POLL_BATCH: usize = 4096;

#[derive(Debug)]
enum InputEvent {
    Change(Change),
    Advance(Timestamp),
    Close,
}

/// Feeds changes into a running pipeline through a [ChannelSource]
pub struct InputHandle {
    sender: Sender<InputEvent>,
    frontier: Frontier,
}

impl InputHandle {
    pub fn insert(&mut self, row: Row, time: impl Into<Timestamp>) -> ReflowResult<()> {
        self.update(Change::new(row, time.into(), 1))
    }

    pub fn remove(&mut self, row: Row, time: impl Into<Timestamp>) -> ReflowResult<()> {
        self.update(Change::new(row, time.into(), -1))
    }

    /// Sends `diff` copies of `row` at `time`
    pub fn update_with(&mut self, row: Row, time: impl Into<Timestamp>, diff: Diff) -> ReflowResult<()> {
        self.update(Change::new(row, time.into(), diff))
    }

    pub fn update(&mut self, change: Change) -> ReflowResult<()> {
        if self.frontier.passed(change.time) {
            return Err(Error::InvariantViolation {
                msg: format!(
                    "change at {} is below the input frontier {}",
                    change.time, self.frontier
                ),
            });
        }
        self.send(InputEvent::Change(change))
    }

    /// Promises that no change below `time` will be sent
    pub fn advance_to(&mut self, time: impl Into<Timestamp>) -> ReflowResult<()> {
        let time = time.into();
        let next = Frontier::at(time);
        if next < self.frontier {
            return Err(Error::InvariantViolation {
                msg: format!("cannot move the input frontier from {} back to {}", self.frontier, next),
            });
        }
        self.frontier = next;
        self.send(InputEvent::Advance(time))
    }

    /// Ends the input, equivalent to advancing past every timestamp
    pub fn close(mut self) -> ReflowResult<()> {
        self.frontier = Frontier::closed();
        self.send(InputEvent::Close)
    }

    pub fn frontier(&self) -> Frontier {
        self.frontier
    }

    fn send(&self, event: InputEvent) -> ReflowResult<()> {
        self.sender.send(event).map_err(|_| Error::Aborted {
            msg: "input source is gone".to_string(),
        })
    }
}

/// A source fed by an [InputHandle].
///
/// Its position is the amount of events taken from the channel. Resuming
/// expects the events to be sent again from the start and skips the ones
/// already consumed.
pub struct ChannelSource {
    name: String,
    kind: SourceKind,
    receiver: Receiver<InputEvent>,
    frontier: Frontier,
    consumed: u64,
    skip: u64,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>) -> (ChannelSource, InputHandle) {
        let (sender, receiver) = unbounded();
        let source = ChannelSource {
            name: name.into(),
            kind: SourceKind::Retractable,
            receiver,
            frontier: Frontier::MIN,
            consumed: 0,
            skip: 0,
        };
        let handle = InputHandle {
            sender,
            frontier: Frontier::MIN,
        };
        (source, handle)
    }

    pub fn append_only(mut self) -> Self {
        self.kind = SourceKind::AppendOnly;
        self
    }
}

impl Source for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn poll(&mut self) -> Result<Vec<Change>, SourceError> {
        let mut changes = Vec::new();
        for _ in 0..POLL_BATCH {
            if self.frontier.is_closed() {
                break;
            }
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // a dropped handle ends the input
                    self.frontier = Frontier::closed();
                    break;
                }
            };
            self.consumed += 1;
            let replayed = self.skip > 0;
            if replayed {
                self.skip -= 1;
            }
            match event {
                InputEvent::Change(change) if !replayed => changes.push(change),
                InputEvent::Change(_) => {}
                InputEvent::Advance(time) => self.frontier = self.frontier.max(Frontier::at(time)),
                InputEvent::Close => self.frontier = Frontier::closed(),
            }
        }
        Ok(changes)
    }

    fn frontier(&self) -> Frontier {
        self.frontier
    }

    fn position(&self) -> Offset {
        Offset::from_index(self.consumed + self.skip)
    }

    fn seek(&mut self, offset: &Offset) -> Result<(), SourceError> {
        let target = offset.index()?;
        if target < self.consumed {
            return Err(SourceError::Seek {
                msg: format!(
                    "{} already consumed {} events, cannot go back to {}",
                    self.name, self.consumed, target
                ),
            });
        }
        self.skip = target - self.consumed;
        Ok(())
    }
}
